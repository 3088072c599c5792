//! Haul Store
//!
//! This crate provides the persistence trait and implementations for upload
//! sessions, chunk records, transfers and transfer files. Data is persisted to
//! a SQLite database.
//!
//! The [`Repository`] trait defines operations for:
//! - Opening, touching and discarding upload sessions
//! - Recording accepted chunks and listing their indices
//! - Creating, updating and deleting transfers and their files
//! - Tracking how many download streams hold each file open
//! - Finding stale sessions and expired transfers for cleanup

mod sqlite;
mod types;

pub use sqlite::SqliteRepository;
pub use types::{
  ChunkRecord, ExpirySpec, ParseExpiryError, PendingUpload, Transfer, TransferFile,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Error type for repository operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Schema migrations failed to apply.
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}

impl Error {
  pub fn is_not_found(&self) -> bool {
    matches!(self, Error::NotFound(_))
  }
}

/// Persistence for the transfer pipeline.
#[async_trait]
pub trait Repository: Send + Sync {
  /// Insert a new upload session.
  async fn create_session(&self, session: &PendingUpload) -> Result<(), Error>;

  /// Get an upload session by ID.
  async fn get_session(&self, session_id: Uuid) -> Result<PendingUpload, Error>;

  /// Set a session's `last_updated_at`.
  async fn touch_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<(), Error>;

  /// Delete an upload session together with its chunk records.
  /// Deleting an absent session succeeds.
  async fn delete_session(&self, session_id: Uuid) -> Result<(), Error>;

  /// List sessions whose `last_updated_at` is strictly before `threshold`.
  async fn list_sessions_idle_since(
    &self,
    threshold: DateTime<Utc>,
  ) -> Result<Vec<PendingUpload>, Error>;

  /// Record an accepted chunk.
  async fn create_chunk(&self, chunk: &ChunkRecord) -> Result<(), Error>;

  /// Distinct chunk indices recorded for a session, ascending.
  async fn list_chunk_indices(&self, session_id: Uuid) -> Result<Vec<u32>, Error>;

  /// Insert a new transfer.
  async fn create_transfer(&self, transfer: &Transfer) -> Result<(), Error>;

  /// Get a transfer by ID.
  async fn get_transfer(&self, transfer_id: Uuid) -> Result<Transfer, Error>;

  /// Replace a transfer's message and expiry.
  async fn update_transfer(
    &self,
    transfer_id: Uuid,
    message: &str,
    expires_at: Option<DateTime<Utc>>,
  ) -> Result<(), Error>;

  /// Delete a transfer together with its file records.
  /// Deleting an absent transfer succeeds.
  async fn delete_transfer(&self, transfer_id: Uuid) -> Result<(), Error>;

  /// Transfers whose expiry is set and at or before `now`.
  async fn list_expired_transfers(&self, now: DateTime<Utc>) -> Result<Vec<Transfer>, Error>;

  /// Transfers owned by `owner_id`, newest first.
  async fn list_transfers_by_owner(&self, owner_id: Uuid) -> Result<Vec<Transfer>, Error>;

  /// Insert a new transfer file.
  async fn create_file(&self, file: &TransferFile) -> Result<(), Error>;

  /// Get a transfer file by ID.
  async fn get_file(&self, file_id: Uuid) -> Result<TransferFile, Error>;

  /// Files belonging to a transfer, ordered by storage path.
  async fn list_files(&self, transfer_id: Uuid) -> Result<Vec<TransferFile>, Error>;

  /// Add one to a file's active stream count.
  async fn increment_active_streams(&self, file_id: Uuid) -> Result<(), Error>;

  /// Subtract one from a file's active stream count, never going below zero.
  async fn decrement_active_streams(&self, file_id: Uuid) -> Result<(), Error>;

  /// Persist a finalized transfer and its files and drop the session that
  /// produced them, all in one transaction.
  async fn complete_upload(
    &self,
    transfer: &Transfer,
    files: &[TransferFile],
    session_id: Uuid,
  ) -> Result<(), Error>;
}
