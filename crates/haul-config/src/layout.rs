use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Top-level folders of the storage namespace.
///
/// ```text
/// chunks/<session-id>/<index>     raw chunks of an open session
/// temp/<session-id>/temp.zip      assembled package during finalize
/// temp/<transfer-id>-<n>.zip      scratch package for a download
/// uploads/<transfer-id>/...       unpacked transfer files
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
  pub chunks_dir: String,
  pub temp_dir: String,
  pub uploads_dir: String,
}

impl Default for LayoutConfig {
  fn default() -> Self {
    Self {
      chunks_dir: "chunks".to_string(),
      temp_dir: "temp".to_string(),
      uploads_dir: "uploads".to_string(),
    }
  }
}

impl LayoutConfig {
  /// Folder holding every chunk of a session.
  pub fn chunk_folder(&self, session_id: impl Display) -> String {
    format!("{}/{session_id}", self.chunks_dir)
  }

  /// Key of one chunk. The base name is the decimal index.
  pub fn chunk_path(&self, session_id: impl Display, index: u32) -> String {
    format!("{}/{session_id}/{index}", self.chunks_dir)
  }

  /// Scratch folder used while a session is finalized.
  pub fn temp_folder(&self, session_id: impl Display) -> String {
    format!("{}/{session_id}", self.temp_dir)
  }

  /// Key of the package a session's chunks are concatenated into.
  pub fn package_path(&self, session_id: impl Display) -> String {
    format!("{}/{session_id}/temp.zip", self.temp_dir)
  }

  /// Key of a scratch package built for one download of a transfer.
  pub fn download_package_path(&self, transfer_id: impl Display, nonce: impl Display) -> String {
    format!("{}/{transfer_id}-{nonce}.zip", self.temp_dir)
  }

  /// Whether an entry directly under the temp folder is a download scratch
  /// package. Finalize scratch lives in per-session folders instead.
  pub fn is_download_package(&self, name: &str) -> bool {
    !name.starts_with('.') && name.ends_with(".zip")
  }

  /// Folder a finalized transfer is unpacked into.
  pub fn upload_folder(&self, transfer_id: impl Display) -> String {
    format!("{}/{transfer_id}", self.uploads_dir)
  }
}
