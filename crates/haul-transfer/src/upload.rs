use chrono::Utc;
use haul_config::{CallerClass, UploadLimits};
use haul_storage::{ByteStream, write_stream};
use haul_store::{ChunkRecord, ExpirySpec, PendingUpload};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::TransferContext;
use crate::error::{TransferError, or_missing};

/// Opens upload sessions and accepts their chunks.
pub struct ChunkUploadManager {
  ctx: TransferContext,
  limits: UploadLimits,
}

impl ChunkUploadManager {
  pub fn new(ctx: TransferContext, limits: UploadLimits) -> Self {
    Self { ctx, limits }
  }

  /// Open an upload session and return its id.
  ///
  /// The id is reused for the transfer the session finalizes into.
  pub async fn begin_session(
    &self,
    owner: Uuid,
    class: CallerClass,
    declared_size: u64,
    message: &str,
    expiry: &str,
  ) -> Result<Uuid, TransferError> {
    let ceiling = self.limits.ceiling(class);
    if declared_size > ceiling {
      return Err(TransferError::LimitExceeded {
        declared: declared_size,
        ceiling,
      });
    }
    let declared = i64::try_from(declared_size)
      .map_err(|_| TransferError::InvalidInput(format!("size {declared_size} is too large")))?;
    let expiry: ExpirySpec = expiry.parse()?;

    let now = Utc::now();
    let session = PendingUpload {
      id: Uuid::new_v4(),
      owner_id: owner,
      declared_size: declared,
      message: message.to_string(),
      expiry,
      created_at: now,
      last_updated_at: now,
    };
    self.ctx.repo.create_session(&session).await?;

    info!(
      session_id = %session.id,
      owner_id = %owner,
      declared_size,
      expiry = %expiry,
      "upload session opened"
    );
    Ok(session.id)
  }

  /// Store one chunk of a session, replacing any earlier bytes at `index`.
  ///
  /// Returns the number of bytes written.
  #[instrument(skip(self, data), fields(session_id = %session_id))]
  pub async fn accept_chunk(
    &self,
    session_id: Uuid,
    index: u32,
    owner: Uuid,
    data: ByteStream,
  ) -> Result<u64, TransferError> {
    let _permit = self.ctx.sessions.begin_chunk(session_id)?;
    self.owned_session(session_id, owner).await?;

    let layout = &self.ctx.layout;
    self
      .ctx
      .storage
      .create_folder(&layout.chunk_folder(session_id))
      .await?;
    let written = write_stream(
      self.ctx.storage.as_ref(),
      &layout.chunk_path(session_id, index),
      data,
    )
    .await?;

    let now = Utc::now();
    self
      .ctx
      .repo
      .create_chunk(&ChunkRecord {
        id: Uuid::new_v4(),
        session_id,
        chunk_index: index,
        uploaded_at: now,
      })
      .await?;
    self
      .ctx
      .repo
      .touch_session(session_id, now)
      .await
      .map_err(|e| or_missing(e, || TransferError::SessionNotFound(session_id)))?;

    debug!(bytes = written, "chunk accepted");
    Ok(written)
  }

  /// Indices accepted so far, unique and ascending.
  pub async fn list_accepted_indices(
    &self,
    session_id: Uuid,
    owner: Uuid,
  ) -> Result<Vec<u32>, TransferError> {
    self.owned_session(session_id, owner).await?;
    Ok(self.ctx.repo.list_chunk_indices(session_id).await?)
  }

  /// Discard a session and every chunk it holds.
  #[instrument(skip(self), fields(session_id = %session_id))]
  pub async fn cancel_session(&self, session_id: Uuid, owner: Uuid) -> Result<(), TransferError> {
    let claim = self.ctx.sessions.claim_for_discard(session_id)?;
    self.owned_session(session_id, owner).await?;

    let layout = &self.ctx.layout;
    // A session that failed after its chunks were consumed may have left a
    // package and partially unpacked files behind.
    for folder in [
      layout.chunk_folder(session_id),
      layout.temp_folder(session_id),
      layout.upload_folder(session_id),
    ] {
      self.ctx.storage.delete_all(&folder).await?;
    }
    self.ctx.repo.delete_session(session_id).await?;
    claim.finish();

    info!("upload session cancelled");
    Ok(())
  }

  async fn owned_session(
    &self,
    session_id: Uuid,
    owner: Uuid,
  ) -> Result<PendingUpload, TransferError> {
    load_owned_session(&self.ctx, session_id, owner).await
  }
}

/// Load a session and check that `owner` created it.
pub(crate) async fn load_owned_session(
  ctx: &TransferContext,
  session_id: Uuid,
  owner: Uuid,
) -> Result<PendingUpload, TransferError> {
  let session = ctx
    .repo
    .get_session(session_id)
    .await
    .map_err(|e| or_missing(e, || TransferError::SessionNotFound(session_id)))?;
  if session.owner_id != owner {
    return Err(TransferError::Unauthorized(session_id));
  }
  Ok(session)
}
