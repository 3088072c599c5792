use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::{ChunkRecord, Error, PendingUpload, Repository, Transfer, TransferFile};

/// SQLite-based repository implementation.
pub struct SqliteRepository {
  pool: SqlitePool,
}

impl SqliteRepository {
  /// Create a new SQLite repository with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if missing) the database at `url`.
  pub async fn connect(url: &str) -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str(url)?
      .create_if_missing(true)
      .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(Self::new(pool))
  }

  /// Open a private in-memory database with the schema applied.
  ///
  /// The pool holds a single connection that is never recycled, since an
  /// in-memory database lives only as long as its connection.
  pub async fn in_memory() -> Result<Self, Error> {
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect("sqlite::memory:")
      .await?;
    let repo = Self::new(pool);
    repo.migrate().await?;
    Ok(repo)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::migrate!("../../migrations").run(&self.pool).await?;
    Ok(())
  }
}

async fn insert_transfer<'e, E>(executor: E, transfer: &Transfer) -> Result<(), sqlx::Error>
where
  E: Executor<'e, Database = Sqlite>,
{
  sqlx::query(
    r#"
            INSERT INTO transfers (id, owner_id, storage_path, total_size, message, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
  )
  .bind(transfer.id)
  .bind(transfer.owner_id)
  .bind(&transfer.storage_path)
  .bind(transfer.total_size)
  .bind(&transfer.message)
  .bind(transfer.created_at)
  .bind(transfer.expires_at)
  .execute(executor)
  .await?;

  Ok(())
}

async fn insert_file<'e, E>(executor: E, file: &TransferFile) -> Result<(), sqlx::Error>
where
  E: Executor<'e, Database = Sqlite>,
{
  sqlx::query(
    r#"
            INSERT INTO transfer_files (id, name, size, storage_path, transfer_id, extension, active_streams)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
  )
  .bind(file.id)
  .bind(&file.name)
  .bind(file.size)
  .bind(&file.storage_path)
  .bind(file.transfer_id)
  .bind(&file.extension)
  .bind(file.active_streams)
  .execute(executor)
  .await?;

  Ok(())
}

#[async_trait]
impl Repository for SqliteRepository {
  async fn create_session(&self, session: &PendingUpload) -> Result<(), Error> {
    sqlx::query(
      r#"
            INSERT INTO pending_uploads (id, owner_id, declared_size, message, expiry, created_at, last_updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(session.id)
    .bind(session.owner_id)
    .bind(session.declared_size)
    .bind(&session.message)
    .bind(session.expiry)
    .bind(session.created_at)
    .bind(session.last_updated_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_session(&self, session_id: Uuid) -> Result<PendingUpload, Error> {
    sqlx::query_as(
      r#"
            SELECT id, owner_id, declared_size, message, expiry, created_at, last_updated_at
            FROM pending_uploads
            WHERE id = ?
            "#,
    )
    .bind(session_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("upload session {session_id}")))
  }

  async fn touch_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<(), Error> {
    let result = sqlx::query("UPDATE pending_uploads SET last_updated_at = ? WHERE id = ?")
      .bind(at)
      .bind(session_id)
      .execute(&self.pool)
      .await?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("upload session {session_id}")));
    }
    Ok(())
  }

  async fn delete_session(&self, session_id: Uuid) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;

    sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
      .bind(session_id)
      .execute(&mut *tx)
      .await?;
    sqlx::query("DELETE FROM pending_uploads WHERE id = ?")
      .bind(session_id)
      .execute(&mut *tx)
      .await?;

    tx.commit().await?;
    Ok(())
  }

  async fn list_sessions_idle_since(
    &self,
    threshold: DateTime<Utc>,
  ) -> Result<Vec<PendingUpload>, Error> {
    let sessions = sqlx::query_as(
      r#"
            SELECT id, owner_id, declared_size, message, expiry, created_at, last_updated_at
            FROM pending_uploads
            WHERE last_updated_at < ?
            ORDER BY last_updated_at ASC
            "#,
    )
    .bind(threshold)
    .fetch_all(&self.pool)
    .await?;

    Ok(sessions)
  }

  async fn create_chunk(&self, chunk: &ChunkRecord) -> Result<(), Error> {
    sqlx::query(
      r#"
            INSERT INTO upload_chunks (id, session_id, chunk_index, uploaded_at)
            VALUES (?, ?, ?, ?)
            "#,
    )
    .bind(chunk.id)
    .bind(chunk.session_id)
    .bind(chunk.chunk_index)
    .bind(chunk.uploaded_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn list_chunk_indices(&self, session_id: Uuid) -> Result<Vec<u32>, Error> {
    let indices: Vec<u32> = sqlx::query_scalar(
      r#"
            SELECT DISTINCT chunk_index
            FROM upload_chunks
            WHERE session_id = ?
            ORDER BY chunk_index ASC
            "#,
    )
    .bind(session_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(indices)
  }

  async fn create_transfer(&self, transfer: &Transfer) -> Result<(), Error> {
    insert_transfer(&self.pool, transfer).await?;
    Ok(())
  }

  async fn get_transfer(&self, transfer_id: Uuid) -> Result<Transfer, Error> {
    sqlx::query_as(
      r#"
            SELECT id, owner_id, storage_path, total_size, message, created_at, expires_at
            FROM transfers
            WHERE id = ?
            "#,
    )
    .bind(transfer_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("transfer {transfer_id}")))
  }

  async fn update_transfer(
    &self,
    transfer_id: Uuid,
    message: &str,
    expires_at: Option<DateTime<Utc>>,
  ) -> Result<(), Error> {
    let result = sqlx::query("UPDATE transfers SET message = ?, expires_at = ? WHERE id = ?")
      .bind(message)
      .bind(expires_at)
      .bind(transfer_id)
      .execute(&self.pool)
      .await?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("transfer {transfer_id}")));
    }
    Ok(())
  }

  async fn delete_transfer(&self, transfer_id: Uuid) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;

    sqlx::query("DELETE FROM transfer_files WHERE transfer_id = ?")
      .bind(transfer_id)
      .execute(&mut *tx)
      .await?;
    sqlx::query("DELETE FROM transfers WHERE id = ?")
      .bind(transfer_id)
      .execute(&mut *tx)
      .await?;

    tx.commit().await?;
    Ok(())
  }

  async fn list_expired_transfers(&self, now: DateTime<Utc>) -> Result<Vec<Transfer>, Error> {
    let transfers = sqlx::query_as(
      r#"
            SELECT id, owner_id, storage_path, total_size, message, created_at, expires_at
            FROM transfers
            WHERE expires_at IS NOT NULL AND expires_at <= ?
            ORDER BY expires_at ASC
            "#,
    )
    .bind(now)
    .fetch_all(&self.pool)
    .await?;

    Ok(transfers)
  }

  async fn list_transfers_by_owner(&self, owner_id: Uuid) -> Result<Vec<Transfer>, Error> {
    let transfers = sqlx::query_as(
      r#"
            SELECT id, owner_id, storage_path, total_size, message, created_at, expires_at
            FROM transfers
            WHERE owner_id = ?
            ORDER BY created_at DESC
            "#,
    )
    .bind(owner_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(transfers)
  }

  async fn create_file(&self, file: &TransferFile) -> Result<(), Error> {
    insert_file(&self.pool, file).await?;
    Ok(())
  }

  async fn get_file(&self, file_id: Uuid) -> Result<TransferFile, Error> {
    sqlx::query_as(
      r#"
            SELECT id, name, size, storage_path, transfer_id, extension, active_streams
            FROM transfer_files
            WHERE id = ?
            "#,
    )
    .bind(file_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("file {file_id}")))
  }

  async fn list_files(&self, transfer_id: Uuid) -> Result<Vec<TransferFile>, Error> {
    let files = sqlx::query_as(
      r#"
            SELECT id, name, size, storage_path, transfer_id, extension, active_streams
            FROM transfer_files
            WHERE transfer_id = ?
            ORDER BY storage_path ASC
            "#,
    )
    .bind(transfer_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(files)
  }

  async fn increment_active_streams(&self, file_id: Uuid) -> Result<(), Error> {
    let result =
      sqlx::query("UPDATE transfer_files SET active_streams = active_streams + 1 WHERE id = ?")
        .bind(file_id)
        .execute(&self.pool)
        .await?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("file {file_id}")));
    }
    Ok(())
  }

  async fn decrement_active_streams(&self, file_id: Uuid) -> Result<(), Error> {
    let result = sqlx::query(
      "UPDATE transfer_files SET active_streams = MAX(active_streams - 1, 0) WHERE id = ?",
    )
    .bind(file_id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("file {file_id}")));
    }
    Ok(())
  }

  async fn complete_upload(
    &self,
    transfer: &Transfer,
    files: &[TransferFile],
    session_id: Uuid,
  ) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;

    insert_transfer(&mut *tx, transfer).await?;
    for file in files {
      insert_file(&mut *tx, file).await?;
    }
    sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
      .bind(session_id)
      .execute(&mut *tx)
      .await?;
    sqlx::query("DELETE FROM pending_uploads WHERE id = ?")
      .bind(session_id)
      .execute(&mut *tx)
      .await?;

    tx.commit().await?;
    Ok(())
  }
}
