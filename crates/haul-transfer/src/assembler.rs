use chrono::Utc;
use futures::StreamExt;
use haul_storage::{EntryInfo, Storage};
use haul_store::{Transfer, TransferFile};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::TransferError;
use crate::upload::load_owned_session;
use crate::{TransferContext, extension, package};

/// Turns a completed upload session into a transfer.
pub struct Assembler {
  ctx: TransferContext,
}

impl Assembler {
  pub fn new(ctx: TransferContext) -> Self {
    Self { ctx }
  }

  /// Assemble, unpack and register a session's upload.
  ///
  /// Until the chunk folder is deleted any failure leaves the session and
  /// its chunks intact, so the client may resume or retry. After that point
  /// the session is closed and only cleanup can remove it.
  #[instrument(skip(self), fields(session_id = %session_id))]
  pub async fn finalize(&self, session_id: Uuid, owner: Uuid) -> Result<Uuid, TransferError> {
    let mut claim = self.ctx.sessions.claim_for_finalize(session_id)?;
    let session = load_owned_session(&self.ctx, session_id, owner).await?;

    let storage = self.ctx.storage.as_ref();
    let layout = &self.ctx.layout;
    let chunk_folder = layout.chunk_folder(session_id);
    let temp_folder = layout.temp_folder(session_id);
    let upload_folder = layout.upload_folder(session_id);
    let package_path = layout.package_path(session_id);

    storage.create_folder(&chunk_folder).await?;
    let chunks = ordered_chunks(storage, &chunk_folder).await?;
    if chunks.is_empty() {
      return Err(TransferError::InvalidInput(
        "no chunks have been uploaded".to_string(),
      ));
    }
    storage.create_folder(&temp_folder).await?;
    storage.create_folder(&upload_folder).await?;

    if let Err(e) = concatenate(storage, &chunks, &package_path).await {
      if let Err(cleanup) = storage.delete_all(&temp_folder).await {
        warn!(error = %cleanup, "failed to remove partial package");
      }
      return Err(e);
    }

    claim.close();
    storage.delete_all(&chunk_folder).await?;

    let unpacked = package::unpack(storage, &package_path, &upload_folder).await?;
    storage.delete_all(&temp_folder).await?;

    let now = Utc::now();
    let transfer = Transfer {
      id: session_id,
      owner_id: session.owner_id,
      storage_path: upload_folder.clone(),
      total_size: session.declared_size,
      message: session.message.clone(),
      created_at: now,
      expires_at: session.expiry.resolve(now),
    };

    let files: Vec<TransferFile> = storage
      .read_folder(&upload_folder)
      .await?
      .into_iter()
      .filter(|entry| !entry.is_dir)
      .map(|entry| TransferFile {
        id: Uuid::new_v4(),
        extension: extension(&entry.name),
        size: i64::try_from(entry.size).unwrap_or(i64::MAX),
        name: entry.name,
        storage_path: entry.path,
        transfer_id: session_id,
        active_streams: 0,
      })
      .collect();

    self
      .ctx
      .repo
      .complete_upload(&transfer, &files, session_id)
      .await?;
    claim.finish();

    info!(
      chunks = chunks.len(),
      files = files.len(),
      unpacked_files = unpacked.files.len(),
      unpacked_bytes = unpacked.bytes,
      expires_at = ?transfer.expires_at,
      "upload finalized"
    );
    Ok(transfer.id)
  }
}

/// Non-folder entries of the chunk folder whose name is an integer, in
/// ascending numeric order.
async fn ordered_chunks(
  storage: &dyn Storage,
  chunk_folder: &str,
) -> Result<Vec<EntryInfo>, TransferError> {
  let mut chunks: Vec<(u64, EntryInfo)> = storage
    .read_folder(chunk_folder)
    .await?
    .into_iter()
    .filter(|entry| !entry.is_dir)
    .filter_map(|entry| match entry.name.parse::<u64>() {
      Ok(index) => Some((index, entry)),
      Err(_) => {
        warn!(name = %entry.name, "ignoring chunk with a non-numeric name");
        None
      }
    })
    .collect();
  chunks.sort_by_key(|(index, _)| *index);
  Ok(chunks.into_iter().map(|(_, entry)| entry).collect())
}

async fn concatenate(
  storage: &dyn Storage,
  chunks: &[EntryInfo],
  dest: &str,
) -> Result<(), TransferError> {
  let mut writer = storage.open_write(dest).await?;
  for chunk in chunks {
    let mut source = storage.open_read(&chunk.path).await?;
    while let Some(data) = source.next().await {
      writer.write(data?).await?;
    }
  }
  writer.close().await?;
  Ok(())
}
