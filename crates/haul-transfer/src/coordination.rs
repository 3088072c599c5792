//! In-process coordination between uploads, finalize, downloads and cleanup.
//!
//! [`SessionRegistry`] tracks what each upload session is doing right now so
//! that chunk uploads, finalize, cancel and the stale-session sweep never
//! overlap on one session. [`TransferLocks`] lets stream opens of a transfer
//! run side by side while keeping them apart from its deletion.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

use crate::error::TransferError;

/// Live state of an upload session. Sessions without an entry are idle and
/// open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  /// Accepting chunks; `in_flight` uploads are running.
  Open { in_flight: usize },
  /// Finalize owns the session.
  Finalizing,
  /// Past the point of no return; only discarding is allowed.
  Closed,
}

/// Tracks the live state of upload sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
  states: Mutex<HashMap<Uuid, SessionState>>,
}

impl SessionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Current state of a session.
  pub fn state(&self, session_id: Uuid) -> SessionState {
    self
      .states
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(&session_id)
      .copied()
      .unwrap_or(SessionState::Open { in_flight: 0 })
  }

  /// Register a chunk upload. Fails unless the session is open.
  pub fn begin_chunk(self: &Arc<Self>, session_id: Uuid) -> Result<ChunkPermit, TransferError> {
    let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
    match states.entry(session_id) {
      Entry::Vacant(slot) => {
        slot.insert(SessionState::Open { in_flight: 1 });
      }
      Entry::Occupied(mut slot) => match slot.get_mut() {
        SessionState::Open { in_flight } => *in_flight += 1,
        SessionState::Finalizing => return Err(busy(session_id, "session is being finalized")),
        SessionState::Closed => return Err(busy(session_id, "session is closed")),
      },
    }
    Ok(ChunkPermit {
      registry: Arc::clone(self),
      session_id,
    })
  }

  /// Take the session for finalize. Requires an open session with no chunk
  /// uploads in flight.
  pub fn claim_for_finalize(
    self: &Arc<Self>,
    session_id: Uuid,
  ) -> Result<SessionClaim, TransferError> {
    self.claim(session_id, false)
  }

  /// Take the session for cancel or cleanup. Closed sessions may be claimed
  /// too, since they only await removal.
  pub fn claim_for_discard(
    self: &Arc<Self>,
    session_id: Uuid,
  ) -> Result<SessionClaim, TransferError> {
    self.claim(session_id, true)
  }

  fn claim(
    self: &Arc<Self>,
    session_id: Uuid,
    allow_closed: bool,
  ) -> Result<SessionClaim, TransferError> {
    let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
    let previous = states
      .get(&session_id)
      .copied()
      .unwrap_or(SessionState::Open { in_flight: 0 });
    match previous {
      SessionState::Open { in_flight: 0 } => {}
      SessionState::Closed if allow_closed => {}
      SessionState::Open { .. } => return Err(busy(session_id, "chunk uploads in progress")),
      SessionState::Finalizing => return Err(busy(session_id, "session is being finalized")),
      SessionState::Closed => return Err(busy(session_id, "session is closed")),
    }
    states.insert(session_id, SessionState::Finalizing);
    Ok(SessionClaim {
      registry: Arc::clone(self),
      session_id,
      restore: previous,
      finished: false,
    })
  }

  fn release_chunk(&self, session_id: Uuid) {
    let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(SessionState::Open { in_flight }) = states.get_mut(&session_id) {
      *in_flight = in_flight.saturating_sub(1);
      if *in_flight == 0 {
        states.remove(&session_id);
      }
    }
  }

  fn set(&self, session_id: Uuid, state: Option<SessionState>) {
    let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
    match state {
      Some(SessionState::Open { in_flight: 0 }) | None => {
        states.remove(&session_id);
      }
      Some(state) => {
        states.insert(session_id, state);
      }
    }
  }
}

fn busy(id: Uuid, reason: &'static str) -> TransferError {
  TransferError::Conflict { id, reason }
}

/// Held for the duration of one chunk upload.
#[derive(Debug)]
pub struct ChunkPermit {
  registry: Arc<SessionRegistry>,
  session_id: Uuid,
}

impl Drop for ChunkPermit {
  fn drop(&mut self) {
    self.registry.release_chunk(self.session_id);
  }
}

/// Exclusive hold on a session for finalize, cancel or cleanup.
///
/// Dropping an unfinished claim returns the session to the state it was
/// claimed from, unless [`SessionClaim::close`] was called, in which case the
/// session stays closed.
#[derive(Debug)]
pub struct SessionClaim {
  registry: Arc<SessionRegistry>,
  session_id: Uuid,
  restore: SessionState,
  finished: bool,
}

impl SessionClaim {
  /// Mark the session as past the point of no return.
  pub fn close(&mut self) {
    self.restore = SessionState::Closed;
  }

  /// The session is gone; forget it.
  pub fn finish(mut self) {
    self.finished = true;
    self.registry.set(self.session_id, None);
  }
}

impl Drop for SessionClaim {
  fn drop(&mut self) {
    if !self.finished {
      self.registry.set(self.session_id, Some(self.restore));
    }
  }
}

/// Per-transfer async read/write locks.
///
/// Stream opens share a transfer; deletion holds it alone. Entries are
/// created on first use and removed once the last holder and waiter is gone.
#[derive(Debug, Default)]
pub struct TransferLocks {
  locks: Mutex<HashMap<Uuid, Arc<RwLock<()>>>>,
}

impl TransferLocks {
  pub fn new() -> Self {
    Self::default()
  }

  fn slot(&self, transfer_id: Uuid) -> Arc<RwLock<()>> {
    let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(transfer_id).or_default())
  }

  fn guard(self: &Arc<Self>, transfer_id: Uuid, hold: Hold) -> TransferGuard {
    TransferGuard {
      locks: Arc::clone(self),
      transfer_id,
      hold: Some(hold),
    }
  }

  /// Wait for shared access to a transfer. Any number of readers may hold a
  /// transfer at once.
  pub async fn read(self: &Arc<Self>, transfer_id: Uuid) -> TransferGuard {
    let guard = self.slot(transfer_id).read_owned().await;
    self.guard(transfer_id, Hold::Shared(guard))
  }

  /// Wait for exclusive access to a transfer.
  pub async fn write(self: &Arc<Self>, transfer_id: Uuid) -> TransferGuard {
    let guard = self.slot(transfer_id).write_owned().await;
    self.guard(transfer_id, Hold::Exclusive(guard))
  }

  /// Take exclusive access to a transfer if nobody holds it.
  pub fn try_write(self: &Arc<Self>, transfer_id: Uuid) -> Option<TransferGuard> {
    match self.slot(transfer_id).try_write_owned() {
      Ok(guard) => Some(self.guard(transfer_id, Hold::Exclusive(guard))),
      Err(_) => {
        self.prune(transfer_id);
        None
      }
    }
  }

  /// Number of transfers with a live lock entry.
  pub fn len(&self) -> usize {
    self
      .locks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn prune(&self, transfer_id: Uuid) {
    let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(slot) = locks.get(&transfer_id)
      && Arc::strong_count(slot) == 1
    {
      locks.remove(&transfer_id);
    }
  }
}

#[derive(Debug)]
enum Hold {
  Shared(OwnedRwLockReadGuard<()>),
  Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Access to one transfer, shared or exclusive. Released on drop.
#[derive(Debug)]
pub struct TransferGuard {
  locks: Arc<TransferLocks>,
  transfer_id: Uuid,
  hold: Option<Hold>,
}

impl TransferGuard {
  pub fn transfer_id(&self) -> Uuid {
    self.transfer_id
  }

  pub fn is_exclusive(&self) -> bool {
    matches!(self.hold, Some(Hold::Exclusive(_)))
  }
}

impl Drop for TransferGuard {
  fn drop(&mut self) {
    // The owned guard holds a reference to the slot; release it first.
    self.hold.take();
    self.locks.prune(self.transfer_id);
  }
}
