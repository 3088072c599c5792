//! Haul Reaper
//!
//! Periodically reclaims storage held by upload sessions that went idle, by
//! transfers past their expiry and by download packages nobody cleaned up.
//!
//! A sweep never deletes data a reader still holds: sessions with chunk
//! uploads in flight or a finalize in progress are skipped, and so are
//! transfers that are locked for a download or have open file streams.
//! Skipped items are retried on the next sweep.
//!
//! # Usage
//!
//! ```ignore
//! let handle = Reaper::new(ctx, config.reaper).spawn();
//! // ...
//! handle.stop().await;
//! ```

use chrono::{DateTime, Utc};
use haul_config::ReaperConfig;
use haul_store::{PendingUpload, Transfer};
use haul_transfer::TransferContext;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that abort a whole sweep.
///
/// Failures on a single session or transfer are logged and counted in the
/// [`SweepReport`] instead.
#[derive(Debug, thiserror::Error)]
pub enum ReaperError {
  #[error("repository error: {0}")]
  Repository(#[from] haul_store::Error),

  #[error("storage error: {0}")]
  Storage(#[from] haul_storage::Error),
}

/// Outcome counts for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
  /// Candidates found.
  pub examined: usize,
  pub removed: usize,
  /// Candidates left alone because they were in use.
  pub skipped: usize,
  /// Candidates whose removal failed; retried next sweep.
  pub failed: usize,
}

/// Reports for every pass of one [`Reaper::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
  pub sessions: SweepReport,
  pub transfers: SweepReport,
  pub scratch: SweepReport,
}

enum Outcome {
  Removed,
  Skipped,
  Failed,
}

impl SweepReport {
  fn record(&mut self, outcome: Outcome) {
    self.examined += 1;
    match outcome {
      Outcome::Removed => self.removed += 1,
      Outcome::Skipped => self.skipped += 1,
      Outcome::Failed => self.failed += 1,
    }
  }
}

/// Reclaims stale sessions and expired transfers.
pub struct Reaper {
  ctx: TransferContext,
  config: ReaperConfig,
}

impl Reaper {
  pub fn new(ctx: TransferContext, config: ReaperConfig) -> Self {
    Self { ctx, config }
  }

  /// Run every sweep once.
  pub async fn sweep(&self, now: DateTime<Utc>) -> SweepSummary {
    let sessions = self.sweep_stale_sessions(now).await.unwrap_or_else(|e| {
      error!(error = %e, "stale session sweep failed");
      SweepReport::default()
    });
    let transfers = self.sweep_expired_transfers(now).await.unwrap_or_else(|e| {
      error!(error = %e, "expired transfer sweep failed");
      SweepReport::default()
    });
    let scratch = self.sweep_scratch_packages(now).await.unwrap_or_else(|e| {
      error!(error = %e, "scratch package sweep failed");
      SweepReport::default()
    });
    SweepSummary {
      sessions,
      transfers,
      scratch,
    }
  }

  /// Delete sessions that have not accepted a chunk within the idle window.
  #[instrument(skip(self))]
  pub async fn sweep_stale_sessions(
    &self,
    now: DateTime<Utc>,
  ) -> Result<SweepReport, ReaperError> {
    let mut report = SweepReport::default();
    let Some(threshold) = self.idle_threshold(now) else {
      return Ok(report);
    };

    for session in self.ctx.repo.list_sessions_idle_since(threshold).await? {
      report.record(self.reap_session(&session, threshold).await);
    }

    if report.examined > 0 {
      info!(
        examined = report.examined,
        removed = report.removed,
        skipped = report.skipped,
        failed = report.failed,
        "stale session sweep finished"
      );
    }
    Ok(report)
  }

  /// Delete transfers whose expiry has passed and that nobody is reading.
  #[instrument(skip(self))]
  pub async fn sweep_expired_transfers(
    &self,
    now: DateTime<Utc>,
  ) -> Result<SweepReport, ReaperError> {
    let mut report = SweepReport::default();

    for transfer in self.ctx.repo.list_expired_transfers(now).await? {
      report.record(self.reap_transfer(&transfer).await);
    }

    if report.examined > 0 {
      info!(
        examined = report.examined,
        removed = report.removed,
        skipped = report.skipped,
        failed = report.failed,
        "expired transfer sweep finished"
      );
    }
    Ok(report)
  }

  /// Delete download packages that outlived the idle window.
  ///
  /// Closing a download stream deletes its package. This catches the ones a
  /// crash or a stream dropped outside a runtime left behind.
  #[instrument(skip(self))]
  pub async fn sweep_scratch_packages(
    &self,
    now: DateTime<Utc>,
  ) -> Result<SweepReport, ReaperError> {
    let mut report = SweepReport::default();
    let Some(threshold) = self.idle_threshold(now) else {
      return Ok(report);
    };

    let layout = &self.ctx.layout;
    let entries = match self.ctx.storage.read_folder(&layout.temp_dir).await {
      Ok(entries) => entries,
      Err(e) if e.is_not_found() => return Ok(report),
      Err(e) => return Err(e.into()),
    };

    let stale = entries.into_iter().filter(|entry| {
      !entry.is_dir && layout.is_download_package(&entry.name) && entry.modified < threshold
    });
    for entry in stale {
      let outcome = match self.ctx.storage.delete_file(&entry.path).await {
        Ok(()) => {
          debug!(path = %entry.path, "scratch package removed");
          Outcome::Removed
        }
        Err(e) => {
          warn!(path = %entry.path, error = %e, "failed to delete scratch package");
          Outcome::Failed
        }
      };
      report.record(outcome);
    }

    if report.examined > 0 {
      info!(
        examined = report.examined,
        removed = report.removed,
        failed = report.failed,
        "scratch package sweep finished"
      );
    }
    Ok(report)
  }

  async fn reap_session(&self, listed: &PendingUpload, threshold: DateTime<Utc>) -> Outcome {
    let session_id = listed.id;
    let Ok(claim) = self.ctx.sessions.claim_for_discard(session_id) else {
      debug!(session_id = %session_id, "session in use; skipping");
      return Outcome::Skipped;
    };

    // The listing is a snapshot: the session may since have been finalized,
    // cancelled or handed a fresh chunk.
    match self.ctx.repo.get_session(session_id).await {
      Ok(session) if session.last_updated_at < threshold => {}
      Ok(_) => return Outcome::Skipped,
      Err(e) if e.is_not_found() => return Outcome::Skipped,
      Err(e) => {
        warn!(session_id = %session_id, error = %e, "failed to reload session");
        return Outcome::Failed;
      }
    }

    let layout = &self.ctx.layout;
    for folder in [
      layout.chunk_folder(session_id),
      layout.temp_folder(session_id),
      layout.upload_folder(session_id),
    ] {
      if let Err(e) = self.ctx.storage.delete_all(&folder).await {
        warn!(
          session_id = %session_id,
          path = %folder,
          error = %e,
          "failed to delete session storage"
        );
        return Outcome::Failed;
      }
    }

    if let Err(e) = self.ctx.repo.delete_session(session_id).await {
      warn!(session_id = %session_id, error = %e, "failed to delete session record");
      return Outcome::Failed;
    }

    claim.finish();
    info!(session_id = %session_id, owner_id = %listed.owner_id, "stale session removed");
    Outcome::Removed
  }

  async fn reap_transfer(&self, transfer: &Transfer) -> Outcome {
    let transfer_id = transfer.id;
    let Some(_guard) = self.ctx.locks.try_write(transfer_id) else {
      debug!(transfer_id = %transfer_id, "transfer locked by a download; skipping");
      return Outcome::Skipped;
    };

    let files = match self.ctx.repo.list_files(transfer_id).await {
      Ok(files) => files,
      Err(e) => {
        warn!(transfer_id = %transfer_id, error = %e, "failed to list transfer files");
        return Outcome::Failed;
      }
    };
    let open: i64 = files.iter().map(|f| f.active_streams).sum();
    if open > 0 {
      debug!(
        transfer_id = %transfer_id,
        open_streams = open,
        "transfer has open streams; skipping"
      );
      return Outcome::Skipped;
    }

    if let Err(e) = self.ctx.storage.delete_all(&transfer.storage_path).await {
      warn!(
        transfer_id = %transfer_id,
        path = %transfer.storage_path,
        error = %e,
        "failed to delete transfer storage"
      );
      return Outcome::Failed;
    }
    if let Err(e) = self.ctx.repo.delete_transfer(transfer_id).await {
      warn!(transfer_id = %transfer_id, error = %e, "failed to delete transfer record");
      return Outcome::Failed;
    }

    info!(transfer_id = %transfer_id, files = files.len(), "expired transfer removed");
    Outcome::Removed
  }

  fn idle_threshold(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let idle = chrono::Duration::from_std(self.config.session_idle()).ok()?;
    now.checked_sub_signed(idle)
  }

  /// Sweep every interval until `cancel` fires.
  ///
  /// The first sweep runs immediately.
  pub async fn run(&self, cancel: CancellationToken) {
    info!(
      interval_secs = self.config.interval_secs,
      session_idle_secs = self.config.session_idle_secs,
      "starting reaper"
    );

    let mut ticker = tokio::time::interval(self.config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("reaper cancelled");
          break;
        }
        _ = ticker.tick() => {
          self.sweep(Utc::now()).await;
        }
      }
    }
  }

  /// Run the reaper on a background task.
  pub fn spawn(self) -> ReaperHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move { self.run(token).await });
    ReaperHandle { cancel, task }
  }
}

/// Handle to a spawned [`Reaper`].
pub struct ReaperHandle {
  cancel: CancellationToken,
  task: JoinHandle<()>,
}

impl ReaperHandle {
  /// Stop the reaper and wait for an in-progress sweep to finish.
  pub async fn stop(self) {
    self.cancel.cancel();
    if let Err(e) = self.task.await {
      error!(error = %e, "reaper task failed");
    }
  }

  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }
}
