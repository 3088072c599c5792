//! Haul Config
//!
//! This crate contains the serializable configuration for Haul: which storage
//! backend to use, how the storage namespace is laid out, the upload size
//! ceilings and the cleanup schedule.
//!
//! Configuration is loaded from a JSON file (via the CLI with
//! `--config=haul.json`). Every field has a default, so an empty object is a
//! valid configuration.

mod layout;
mod limits;

pub use layout::LayoutConfig;
pub use limits::{CallerClass, UploadLimits};

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error type for loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  /// The configuration file could not be read.
  #[error("failed to read config {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// The configuration is not valid JSON for [`HaulConfig`].
  #[error("failed to parse config: {0}")]
  Parse(#[from] serde_json::Error),

  /// The configuration parsed but holds an unusable value.
  #[error("invalid config: {0}")]
  Invalid(String),
}

/// Which storage backend holds chunks, packages and transfer files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
  /// A directory tree on the local filesystem.
  Local { root: PathBuf },
  /// A process-local in-memory object store. Contents vanish on exit.
  Memory,
  /// An S3 bucket, or any S3-compatible service reachable at `endpoint`.
  ///
  /// Credentials come from the standard `AWS_*` environment variables, which
  /// also fill in `region` and `endpoint` when they are unset here.
  S3 {
    bucket: String,
    region: Option<String>,
    endpoint: Option<String>,
  },
}

impl Default for StorageConfig {
  fn default() -> Self {
    StorageConfig::Local {
      root: PathBuf::from("haul-data"),
    }
  }
}

/// Cleanup schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
  /// Seconds between sweeps.
  pub interval_secs: u64,
  /// Seconds without an accepted chunk after which a session is stale.
  pub session_idle_secs: u64,
}

impl Default for ReaperConfig {
  fn default() -> Self {
    Self {
      interval_secs: 60 * 60,
      session_idle_secs: 4 * 60 * 60,
    }
  }
}

impl ReaperConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }

  pub fn session_idle(&self) -> Duration {
    Duration::from_secs(self.session_idle_secs)
  }
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaulConfig {
  /// SQLite connection URL for the repository.
  pub database_url: String,
  pub storage: StorageConfig,
  pub layout: LayoutConfig,
  pub limits: UploadLimits,
  pub reaper: ReaperConfig,
}

impl Default for HaulConfig {
  fn default() -> Self {
    Self {
      database_url: "sqlite://haul.db?mode=rwc".to_string(),
      storage: StorageConfig::default(),
      layout: LayoutConfig::default(),
      limits: UploadLimits::default(),
      reaper: ReaperConfig::default(),
    }
  }
}

impl HaulConfig {
  /// Load and validate configuration from a JSON file.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json(&raw)
  }

  /// Parse and validate configuration from a JSON string.
  pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
    let config: HaulConfig = serde_json::from_str(raw)?;
    config.validate()?;
    Ok(config)
  }

  /// Reject values the pipeline cannot work with.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.limits.chunk_bytes == 0 {
      return Err(ConfigError::Invalid("limits.chunk_bytes must be positive".into()));
    }
    if self.reaper.interval_secs == 0 {
      return Err(ConfigError::Invalid("reaper.interval_secs must be positive".into()));
    }
    if let StorageConfig::S3 { bucket, .. } = &self.storage
      && bucket.trim().is_empty()
    {
      return Err(ConfigError::Invalid("storage.bucket must not be empty".into()));
    }
    for (name, dir) in [
      ("chunks_dir", &self.layout.chunks_dir),
      ("temp_dir", &self.layout.temp_dir),
      ("uploads_dir", &self.layout.uploads_dir),
    ] {
      if dir.trim_matches('/').is_empty() {
        return Err(ConfigError::Invalid(format!("layout.{name} must not be empty")));
      }
    }
    Ok(())
  }
}
