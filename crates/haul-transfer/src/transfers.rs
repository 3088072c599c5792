use chrono::Utc;
use haul_store::{Transfer, TransferFile};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{TransferError, or_missing};
use crate::{TransferContext, parse_expiry};

/// A transfer together with its files.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferInfo {
  pub transfer: Transfer,
  pub files: Vec<TransferFile>,
}

/// Owner-facing operations on finalized transfers.
pub struct TransferManager {
  ctx: TransferContext,
}

impl TransferManager {
  pub fn new(ctx: TransferContext) -> Self {
    Self { ctx }
  }

  /// Load a transfer and its files.
  pub async fn transfer_info(&self, transfer_id: Uuid) -> Result<TransferInfo, TransferError> {
    let transfer = self.find(transfer_id).await?;
    let files = self.ctx.repo.list_files(transfer_id).await?;
    Ok(TransferInfo { transfer, files })
  }

  /// Transfers owned by `owner`, newest first.
  pub async fn list_transfers(&self, owner: Uuid) -> Result<Vec<Transfer>, TransferError> {
    Ok(self.ctx.repo.list_transfers_by_owner(owner).await?)
  }

  /// Replace a transfer's message and, when `expiry` is given, restart its
  /// lifetime from now.
  #[instrument(skip(self, message), fields(transfer_id = %transfer_id))]
  pub async fn update_transfer(
    &self,
    transfer_id: Uuid,
    owner: Uuid,
    message: &str,
    expiry: Option<&str>,
  ) -> Result<Transfer, TransferError> {
    let transfer = self.owned(transfer_id, owner).await?;
    let expires_at = match expiry {
      Some(raw) => parse_expiry(raw, Utc::now())?,
      None => transfer.expires_at,
    };

    self
      .ctx
      .repo
      .update_transfer(transfer_id, message, expires_at)
      .await
      .map_err(|e| or_missing(e, || TransferError::ExpiredOrMissing(transfer_id)))?;

    info!(expires_at = ?expires_at, "transfer updated");
    Ok(Transfer {
      message: message.to_string(),
      expires_at,
      ..transfer
    })
  }

  /// Delete a transfer's files and records.
  ///
  /// Refused while any of its files is being streamed.
  #[instrument(skip(self), fields(transfer_id = %transfer_id))]
  pub async fn delete_transfer(&self, transfer_id: Uuid, owner: Uuid) -> Result<(), TransferError> {
    let _guard = self.ctx.locks.write(transfer_id).await;
    let transfer = self.owned(transfer_id, owner).await?;

    let files = self.ctx.repo.list_files(transfer_id).await?;
    if files.iter().any(|f| f.active_streams > 0) {
      return Err(TransferError::Conflict {
        id: transfer_id,
        reason: "transfer has open downloads",
      });
    }

    self.ctx.storage.delete_all(&transfer.storage_path).await?;
    self.ctx.repo.delete_transfer(transfer_id).await?;

    info!(files = files.len(), "transfer deleted");
    Ok(())
  }

  async fn find(&self, transfer_id: Uuid) -> Result<Transfer, TransferError> {
    self
      .ctx
      .repo
      .get_transfer(transfer_id)
      .await
      .map_err(|e| or_missing(e, || TransferError::ExpiredOrMissing(transfer_id)))
  }

  async fn owned(&self, transfer_id: Uuid, owner: Uuid) -> Result<Transfer, TransferError> {
    let transfer = self.find(transfer_id).await?;
    if transfer.owner_id != owner {
      return Err(TransferError::Unauthorized(transfer_id));
    }
    Ok(transfer)
  }
}
