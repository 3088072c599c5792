use chrono::Utc;
use haul_store::{Transfer, TransferFile};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{TransferError, or_missing};
use crate::guarded::{DecrementOnClose, DeleteOnClose, GuardedStream};
use crate::{TransferContext, TransferGuard, package};

/// A stream ready to be sent to a client.
pub struct Download {
  pub stream: GuardedStream,
  /// Name to suggest to the client.
  pub filename: String,
}

/// Serves finalized transfers and files.
pub struct DownloadStreamer {
  ctx: TransferContext,
}

impl DownloadStreamer {
  pub fn new(ctx: TransferContext) -> Self {
    Self { ctx }
  }

  /// Stream a whole transfer.
  ///
  /// A transfer with exactly one file streams that file directly and holds a
  /// reference on it until the stream closes. Any other transfer is packaged
  /// into a scratch zip that is deleted when the stream closes.
  #[instrument(skip(self), fields(transfer_id = %transfer_id))]
  pub async fn stream_transfer(&self, transfer_id: Uuid) -> Result<Download, TransferError> {
    let guard = self.ctx.locks.read(transfer_id).await;
    let transfer = self.live_transfer(transfer_id).await?;
    let files = self
      .ctx
      .repo
      .list_files(transfer_id)
      .await
      .map_err(|e| or_missing(e, || TransferError::FileMissing(transfer_id.to_string())))?;

    match files.as_slice() {
      [file] => self.open_file(file, &guard).await,
      _ => self.open_package(&transfer, &guard).await,
    }
  }

  /// Stream one file of a transfer, holding a reference on it until the
  /// stream closes.
  #[instrument(skip(self), fields(file_id = %file_id))]
  pub async fn stream_file(&self, file_id: Uuid) -> Result<Download, TransferError> {
    let file = self.find_file(file_id).await?;
    let guard = self.ctx.locks.read(file.transfer_id).await;
    self.live_transfer(file.transfer_id).await?;
    // Cleanup may have removed the file while we waited for the lock.
    let file = self.find_file(file_id).await?;
    self.open_file(&file, &guard).await
  }

  async fn live_transfer(&self, transfer_id: Uuid) -> Result<Transfer, TransferError> {
    let transfer = self
      .ctx
      .repo
      .get_transfer(transfer_id)
      .await
      .map_err(|e| or_missing(e, || TransferError::ExpiredOrMissing(transfer_id)))?;
    if transfer.is_expired(Utc::now()) {
      return Err(TransferError::ExpiredOrMissing(transfer_id));
    }
    Ok(transfer)
  }

  async fn find_file(&self, file_id: Uuid) -> Result<TransferFile, TransferError> {
    self
      .ctx
      .repo
      .get_file(file_id)
      .await
      .map_err(|e| or_missing(e, || TransferError::FileMissing(file_id.to_string())))
  }

  async fn open_file(
    &self,
    file: &TransferFile,
    _guard: &TransferGuard,
  ) -> Result<Download, TransferError> {
    let inner = self
      .ctx
      .storage
      .open_read(&file.storage_path)
      .await
      .map_err(|e| match e {
        e if e.is_not_found() => TransferError::FileMissing(file.storage_path.clone()),
        e => TransferError::Storage(e),
      })?;
    self.ctx.repo.increment_active_streams(file.id).await?;

    debug!(file_id = %file.id, path = %file.storage_path, "opened file stream");
    Ok(Download {
      stream: GuardedStream::new(
        inner,
        DecrementOnClose::new(self.ctx.repo.clone(), file.id),
      ),
      filename: file.name.clone(),
    })
  }

  async fn open_package(
    &self,
    transfer: &Transfer,
    _guard: &TransferGuard,
  ) -> Result<Download, TransferError> {
    let storage = self.ctx.storage.as_ref();
    let scratch = self
      .ctx
      .layout
      .download_package_path(transfer.id, Uuid::new_v4());

    if let Err(e) = package::pack_folder(storage, &transfer.storage_path, &scratch).await {
      discard(storage, &scratch).await;
      return Err(e.into());
    }
    let inner = match storage.open_read(&scratch).await {
      Ok(inner) => inner,
      Err(e) => {
        discard(storage, &scratch).await;
        return Err(e.into());
      }
    };

    debug!(path = %scratch, "opened package stream");
    Ok(Download {
      stream: GuardedStream::new(
        inner,
        DeleteOnClose::new(self.ctx.storage.clone(), scratch),
      ),
      filename: format!("{}.zip", transfer.id),
    })
  }
}

async fn discard(storage: &dyn haul_storage::Storage, path: &str) {
  if let Err(e) = storage.delete_file(path).await {
    warn!(path, error = %e, "failed to delete scratch package");
  }
}
