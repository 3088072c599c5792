//! Transfer pipeline errors.

use uuid::Uuid;

/// Coarse classification of a [`TransferError`] for the request layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  NotFound,
  Unauthorized,
  InvalidInput,
  LimitExceeded,
  Conflict,
  Internal,
}

/// Errors that can occur while building or unpacking a package.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
  /// Reading or writing storage failed.
  #[error("storage error: {0}")]
  Storage(#[from] haul_storage::Error),

  /// The archive could not be written or is not a valid archive.
  #[error("archive error: {0}")]
  Archive(#[from] zip::result::ZipError),

  /// The local spool file failed.
  #[error("spool error: {0}")]
  Io(#[from] std::io::Error),

  /// An archive entry would land outside the destination folder.
  #[error("archive entry '{0}' escapes the destination folder")]
  UnsafeEntry(String),

  /// The blocking archive worker panicked or was cancelled.
  #[error("archive worker failed: {0}")]
  Worker(#[from] tokio::task::JoinError),
}

/// Errors that can occur in the upload, assembly and download pipeline.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
  /// The upload session does not exist (never created, cancelled, finalized
  /// or reaped).
  #[error("upload session '{0}' not found")]
  SessionNotFound(Uuid),

  /// The transfer does not exist or has expired.
  #[error("transfer '{0}' has expired or does not exist")]
  ExpiredOrMissing(Uuid),

  /// A file of the transfer is absent.
  #[error("file '{0}' not found")]
  FileMissing(String),

  /// The caller does not own the session or transfer.
  #[error("caller is not the owner of '{0}'")]
  Unauthorized(Uuid),

  /// A caller-supplied value was rejected.
  #[error("invalid input: {0}")]
  InvalidInput(String),

  /// The declared upload size exceeds the caller's ceiling.
  #[error("declared size {declared} exceeds the limit of {ceiling} bytes")]
  LimitExceeded { declared: u64, ceiling: u64 },

  /// The session or transfer is busy with a conflicting operation.
  #[error("'{id}' is busy: {reason}")]
  Conflict { id: Uuid, reason: &'static str },

  /// Storage failed.
  #[error("storage error: {0}")]
  Storage(#[from] haul_storage::Error),

  /// The repository failed.
  #[error("repository error: {0}")]
  Repository(#[from] haul_store::Error),

  /// Packaging or unpacking failed.
  #[error("package error: {0}")]
  Package(#[from] PackageError),
}

impl TransferError {
  /// Collapse the error into its [`ErrorKind`].
  pub fn kind(&self) -> ErrorKind {
    match self {
      TransferError::SessionNotFound(_)
      | TransferError::ExpiredOrMissing(_)
      | TransferError::FileMissing(_) => ErrorKind::NotFound,
      TransferError::Unauthorized(_) => ErrorKind::Unauthorized,
      TransferError::InvalidInput(_) => ErrorKind::InvalidInput,
      TransferError::LimitExceeded { .. } => ErrorKind::LimitExceeded,
      TransferError::Conflict { .. } => ErrorKind::Conflict,
      TransferError::Storage(e) if e.is_not_found() => ErrorKind::NotFound,
      TransferError::Repository(haul_store::Error::NotFound(_)) => ErrorKind::NotFound,
      TransferError::Package(PackageError::Storage(e)) if e.is_not_found() => ErrorKind::NotFound,
      TransferError::Storage(_) | TransferError::Repository(_) | TransferError::Package(_) => {
        ErrorKind::Internal
      }
    }
  }
}

impl From<haul_store::ParseExpiryError> for TransferError {
  fn from(e: haul_store::ParseExpiryError) -> Self {
    TransferError::InvalidInput(e.to_string())
  }
}

/// Map a repository miss onto a domain error, passing other failures through.
pub(crate) fn or_missing(
  e: haul_store::Error,
  missing: impl FnOnce() -> TransferError,
) -> TransferError {
  match e {
    haul_store::Error::NotFound(_) => missing(),
    e => TransferError::Repository(e),
  }
}
