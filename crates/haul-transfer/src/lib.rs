//! Haul Transfer
//!
//! The upload, assembly and download pipeline:
//!
//! - [`ChunkUploadManager`] opens upload sessions and accepts their chunks in
//!   any order, any number of times.
//! - [`Assembler`] concatenates a session's chunks into a zip package, unpacks
//!   it into the transfer folder and registers the resulting files.
//! - [`DownloadStreamer`] serves a transfer or a single file as a
//!   [`GuardedStream`] whose close releases the reference it holds.
//! - [`TransferManager`] covers the owner-facing transfer operations.
//!
//! All of them share a [`TransferContext`]: the repository, the storage
//! backend, the storage layout and the in-process coordination state.

mod assembler;
mod coordination;
mod download;
mod error;
mod guarded;
pub mod package;
mod transfers;
mod upload;

pub use assembler::Assembler;
pub use coordination::{
  ChunkPermit, SessionClaim, SessionRegistry, SessionState, TransferGuard, TransferLocks,
};
pub use download::{Download, DownloadStreamer};
pub use error::{ErrorKind, PackageError, TransferError};
pub use guarded::{DecrementOnClose, DeleteOnClose, GuardedStream, Release};
pub use haul_store::ExpirySpec;
pub use transfers::{TransferInfo, TransferManager};
pub use upload::ChunkUploadManager;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use haul_config::LayoutConfig;
use haul_storage::Storage;
use haul_store::Repository;

/// Dependencies shared by every pipeline component.
#[derive(Clone)]
pub struct TransferContext {
  pub repo: Arc<dyn Repository>,
  pub storage: Arc<dyn Storage>,
  pub layout: Arc<LayoutConfig>,
  pub sessions: Arc<SessionRegistry>,
  pub locks: Arc<TransferLocks>,
}

impl TransferContext {
  pub fn new(repo: Arc<dyn Repository>, storage: Arc<dyn Storage>, layout: LayoutConfig) -> Self {
    Self {
      repo,
      storage,
      layout: Arc::new(layout),
      sessions: Arc::new(SessionRegistry::new()),
      locks: Arc::new(TransferLocks::new()),
    }
  }
}

/// Parse a symbolic expiry and resolve it against `now`.
///
/// `never` yields `None`. Anything outside `5m, 3h, 12h, 1d, 3d, 1w, never`
/// is [`TransferError::InvalidInput`].
pub fn parse_expiry(raw: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, TransferError> {
  let spec: ExpirySpec = raw.parse()?;
  Ok(spec.resolve(now))
}

/// Extension of a file name including the leading dot, or empty if none.
pub(crate) fn extension(name: &str) -> String {
  name
    .rfind('.')
    .map(|i| name[i..].to_string())
    .unwrap_or_default()
}
