//! Integration tests for the SQLite repository against an in-memory database.

use chrono::{Duration, Utc};
use haul_store::{
  ChunkRecord, Error, ExpirySpec, PendingUpload, Repository, SqliteRepository, Transfer,
  TransferFile,
};
use uuid::Uuid;

fn session(owner_id: Uuid) -> PendingUpload {
  let now = Utc::now();
  PendingUpload {
    id: Uuid::new_v4(),
    owner_id,
    declared_size: 10,
    message: "holiday photos".to_string(),
    expiry: ExpirySpec::OneDay,
    created_at: now,
    last_updated_at: now,
  }
}

fn chunk(session_id: Uuid, index: u32) -> ChunkRecord {
  ChunkRecord {
    id: Uuid::new_v4(),
    session_id,
    chunk_index: index,
    uploaded_at: Utc::now(),
  }
}

fn transfer(owner_id: Uuid) -> Transfer {
  let id = Uuid::new_v4();
  Transfer {
    id,
    owner_id,
    storage_path: format!("uploads/{id}"),
    total_size: 10,
    message: String::new(),
    created_at: Utc::now(),
    expires_at: None,
  }
}

fn file(transfer_id: Uuid, name: &str) -> TransferFile {
  TransferFile {
    id: Uuid::new_v4(),
    name: name.to_string(),
    size: 5,
    storage_path: format!("uploads/{transfer_id}/{name}"),
    transfer_id,
    extension: ".txt".to_string(),
    active_streams: 0,
  }
}

#[tokio::test]
async fn test_session_round_trip_and_touch() {
  let repo = SqliteRepository::in_memory().await.unwrap();
  let pending = session(Uuid::new_v4());
  repo.create_session(&pending).await.unwrap();

  let loaded = repo.get_session(pending.id).await.unwrap();
  assert_eq!(loaded.expiry, ExpirySpec::OneDay);
  assert_eq!(loaded.declared_size, 10);
  assert_eq!(loaded.message, "holiday photos");

  let later = pending.last_updated_at + Duration::minutes(3);
  repo.touch_session(pending.id, later).await.unwrap();
  assert_eq!(
    repo.get_session(pending.id).await.unwrap().last_updated_at,
    later
  );
}

#[tokio::test]
async fn test_missing_records_are_not_found() {
  let repo = SqliteRepository::in_memory().await.unwrap();
  let id = Uuid::new_v4();

  assert!(matches!(repo.get_session(id).await, Err(Error::NotFound(_))));
  assert!(matches!(repo.get_transfer(id).await, Err(Error::NotFound(_))));
  assert!(matches!(repo.get_file(id).await, Err(Error::NotFound(_))));
  assert!(matches!(
    repo.touch_session(id, Utc::now()).await,
    Err(Error::NotFound(_))
  ));
  assert!(matches!(
    repo.increment_active_streams(id).await,
    Err(Error::NotFound(_))
  ));
}

#[tokio::test]
async fn test_chunk_indices_are_distinct_and_ascending() {
  let repo = SqliteRepository::in_memory().await.unwrap();
  let pending = session(Uuid::new_v4());
  repo.create_session(&pending).await.unwrap();

  for index in [3, 1, 2, 1] {
    repo.create_chunk(&chunk(pending.id, index)).await.unwrap();
  }

  assert_eq!(
    repo.list_chunk_indices(pending.id).await.unwrap(),
    vec![1, 2, 3]
  );
}

#[tokio::test]
async fn test_delete_session_drops_chunks() {
  let repo = SqliteRepository::in_memory().await.unwrap();
  let pending = session(Uuid::new_v4());
  repo.create_session(&pending).await.unwrap();
  repo.create_chunk(&chunk(pending.id, 0)).await.unwrap();

  repo.delete_session(pending.id).await.unwrap();

  assert!(repo.list_chunk_indices(pending.id).await.unwrap().is_empty());
  assert!(matches!(
    repo.get_session(pending.id).await,
    Err(Error::NotFound(_))
  ));
  // Idempotent.
  repo.delete_session(pending.id).await.unwrap();
}

#[tokio::test]
async fn test_idle_sessions_are_strictly_older_than_threshold() {
  let repo = SqliteRepository::in_memory().await.unwrap();
  let now = Utc::now();

  let mut stale = session(Uuid::new_v4());
  stale.last_updated_at = now - Duration::hours(5);
  let mut fresh = session(Uuid::new_v4());
  fresh.last_updated_at = now - Duration::minutes(10);
  repo.create_session(&stale).await.unwrap();
  repo.create_session(&fresh).await.unwrap();

  let idle = repo
    .list_sessions_idle_since(now - Duration::hours(4))
    .await
    .unwrap();
  assert_eq!(idle.len(), 1);
  assert_eq!(idle[0].id, stale.id);
}

#[tokio::test]
async fn test_active_stream_count_never_goes_negative() {
  let repo = SqliteRepository::in_memory().await.unwrap();
  let t = transfer(Uuid::new_v4());
  repo.create_transfer(&t).await.unwrap();
  let f = file(t.id, "a.txt");
  repo.create_file(&f).await.unwrap();

  repo.increment_active_streams(f.id).await.unwrap();
  repo.increment_active_streams(f.id).await.unwrap();
  assert_eq!(repo.get_file(f.id).await.unwrap().active_streams, 2);

  repo.decrement_active_streams(f.id).await.unwrap();
  repo.decrement_active_streams(f.id).await.unwrap();
  repo.decrement_active_streams(f.id).await.unwrap();
  assert_eq!(repo.get_file(f.id).await.unwrap().active_streams, 0);
}

#[tokio::test]
async fn test_complete_upload_is_atomic() {
  let repo = SqliteRepository::in_memory().await.unwrap();
  let owner = Uuid::new_v4();
  let pending = session(owner);
  repo.create_session(&pending).await.unwrap();
  repo.create_chunk(&chunk(pending.id, 0)).await.unwrap();

  let t = transfer(owner);
  let files = vec![file(t.id, "a.txt"), file(t.id, "b.txt")];
  repo.complete_upload(&t, &files, pending.id).await.unwrap();

  assert_eq!(repo.get_transfer(t.id).await.unwrap(), t);
  assert_eq!(repo.list_files(t.id).await.unwrap(), files);
  assert!(matches!(
    repo.get_session(pending.id).await,
    Err(Error::NotFound(_))
  ));

  // A duplicate file id aborts the whole transaction.
  let other_pending = session(owner);
  repo.create_session(&other_pending).await.unwrap();
  let other = transfer(owner);
  let mut clash = file(other.id, "c.txt");
  clash.id = files[0].id;
  assert!(
    repo
      .complete_upload(&other, &[clash], other_pending.id)
      .await
      .is_err()
  );
  assert!(matches!(
    repo.get_transfer(other.id).await,
    Err(Error::NotFound(_))
  ));
  assert!(repo.get_session(other_pending.id).await.is_ok());
}

#[tokio::test]
async fn test_expired_transfers_and_owner_listing() {
  let repo = SqliteRepository::in_memory().await.unwrap();
  let owner = Uuid::new_v4();
  let now = Utc::now();

  let mut expired = transfer(owner);
  expired.created_at = now - Duration::hours(2);
  expired.expires_at = Some(now - Duration::minutes(1));
  let mut live = transfer(owner);
  live.created_at = now - Duration::hours(1);
  live.expires_at = Some(now + Duration::hours(1));
  let forever = transfer(owner);
  let foreign = transfer(Uuid::new_v4());

  for t in [&expired, &live, &forever, &foreign] {
    repo.create_transfer(t).await.unwrap();
  }

  let due: Vec<_> = repo
    .list_expired_transfers(now)
    .await
    .unwrap()
    .into_iter()
    .map(|t| t.id)
    .collect();
  assert_eq!(due, vec![expired.id]);

  let owned: Vec<_> = repo
    .list_transfers_by_owner(owner)
    .await
    .unwrap()
    .into_iter()
    .map(|t| t.id)
    .collect();
  assert_eq!(owned, vec![forever.id, live.id, expired.id]);
}

#[tokio::test]
async fn test_update_and_delete_transfer() {
  let repo = SqliteRepository::in_memory().await.unwrap();
  let t = transfer(Uuid::new_v4());
  repo.create_transfer(&t).await.unwrap();
  repo.create_file(&file(t.id, "a.txt")).await.unwrap();

  let expires_at = Some(Utc::now() + Duration::hours(3));
  repo
    .update_transfer(t.id, "new message", expires_at)
    .await
    .unwrap();
  let updated = repo.get_transfer(t.id).await.unwrap();
  assert_eq!(updated.message, "new message");
  assert_eq!(updated.expires_at, expires_at);

  repo.delete_transfer(t.id).await.unwrap();
  assert!(matches!(
    repo.get_transfer(t.id).await,
    Err(Error::NotFound(_))
  ));
  assert!(repo.list_files(t.id).await.unwrap().is_empty());
  assert!(matches!(
    repo.update_transfer(t.id, "", None).await,
    Err(Error::NotFound(_))
  ));
}
