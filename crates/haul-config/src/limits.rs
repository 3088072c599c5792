use serde::{Deserialize, Serialize};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Who is opening an upload session. Decides the size ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerClass {
  Registered,
  Guest,
}

/// Size ceilings enforced when an upload session is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadLimits {
  /// Largest declared size a registered caller may upload.
  pub registered_max_bytes: u64,
  /// Largest declared size a guest may upload.
  pub guest_max_bytes: u64,
  /// Chunk size clients are told to use.
  pub chunk_bytes: u64,
}

impl Default for UploadLimits {
  fn default() -> Self {
    Self {
      registered_max_bytes: 5 * GIB,
      guest_max_bytes: GIB,
      chunk_bytes: 5 * MIB,
    }
  }
}

impl UploadLimits {
  /// The declared-size ceiling for a caller class.
  pub fn ceiling(&self, class: CallerClass) -> u64 {
    match class {
      CallerClass::Registered => self.registered_max_bytes,
      CallerClass::Guest => self.guest_max_bytes,
    }
  }
}
