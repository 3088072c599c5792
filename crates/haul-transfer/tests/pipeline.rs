//! End-to-end tests for upload, finalize, download and transfer management.

use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use haul_config::{CallerClass, LayoutConfig, UploadLimits};
use haul_storage::{LocalStorage, ObjectStorage, Storage, bytes_stream, read_all};
use haul_store::{Repository, SqliteRepository};
use haul_transfer::{
  Assembler, ChunkUploadManager, DownloadStreamer, ErrorKind, GuardedStream, SessionState,
  TransferContext, TransferError, TransferManager,
};
use uuid::Uuid;
use zip::write::SimpleFileOptions;

struct Harness {
  ctx: TransferContext,
  uploads: ChunkUploadManager,
  assembler: Assembler,
  downloads: DownloadStreamer,
  transfers: TransferManager,
  _dir: Option<tempfile::TempDir>,
}

impl Harness {
  async fn with_storage(storage: Arc<dyn Storage>, dir: Option<tempfile::TempDir>) -> Self {
    let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::in_memory().await.unwrap());
    let ctx = TransferContext::new(repo, storage, LayoutConfig::default());
    Self {
      uploads: ChunkUploadManager::new(ctx.clone(), UploadLimits::default()),
      assembler: Assembler::new(ctx.clone()),
      downloads: DownloadStreamer::new(ctx.clone()),
      transfers: TransferManager::new(ctx.clone()),
      ctx,
      _dir: dir,
    }
  }

  async fn local() -> Self {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(LocalStorage::new(dir.path()));
    Self::with_storage(storage, Some(dir)).await
  }

  async fn object() -> Self {
    Self::with_storage(Arc::new(ObjectStorage::in_memory()), None).await
  }

  async fn begin(&self, owner: Uuid, declared: u64) -> Uuid {
    self
      .uploads
      .begin_session(owner, CallerClass::Registered, declared, "hello", "1d")
      .await
      .unwrap()
  }

  /// Upload `data` split into `chunk_size` pieces, sending indices in `order`.
  async fn upload(
    &self,
    session: Uuid,
    owner: Uuid,
    data: &[u8],
    chunk_size: usize,
    order: &[usize],
  ) {
    let pieces: Vec<&[u8]> = data.chunks(chunk_size).collect();
    for &index in order {
      self
        .uploads
        .accept_chunk(
          session,
          index as u32,
          owner,
          bytes_stream(Bytes::copy_from_slice(pieces[index])),
        )
        .await
        .unwrap();
    }
  }

  /// Upload every chunk of `data` in ascending order.
  async fn upload_all(&self, session: Uuid, owner: Uuid, data: &[u8], chunk_size: usize) {
    let order: Vec<usize> = (0..data.len().div_ceil(chunk_size)).collect();
    self.upload(session, owner, data, chunk_size, &order).await;
  }
}

fn archive(files: &[(&str, &[u8])]) -> Vec<u8> {
  let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
  for (name, data) in files {
    if name.ends_with('/') {
      zip.add_directory(*name, SimpleFileOptions::default()).unwrap();
    } else {
      zip.start_file(*name, SimpleFileOptions::default()).unwrap();
      zip.write_all(data).unwrap();
    }
  }
  zip.finish().unwrap().into_inner()
}

fn read_archive(data: &[u8]) -> Vec<(String, Vec<u8>)> {
  let mut archive = zip::ZipArchive::new(Cursor::new(data)).unwrap();
  let mut entries = Vec::new();
  for i in 0..archive.len() {
    let mut entry = archive.by_index(i).unwrap();
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf).unwrap();
    entries.push((entry.name().to_string(), buf));
  }
  entries.sort();
  entries
}

async fn drain(stream: &mut GuardedStream) -> Vec<u8> {
  let mut out = Vec::new();
  while let Some(chunk) = stream.next().await {
    out.extend_from_slice(&chunk.unwrap());
  }
  out
}

async fn file_contents(h: &Harness, transfer_id: Uuid) -> Vec<(String, Bytes)> {
  let info = h.transfers.transfer_info(transfer_id).await.unwrap();
  let mut out = Vec::new();
  for file in info.files {
    let data = read_all(h.ctx.storage.as_ref(), &file.storage_path)
      .await
      .unwrap();
    out.push((file.name, data));
  }
  out
}

fn sample_archive() -> Vec<u8> {
  let big: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
  archive(&[
    ("notes.txt", b"the quick brown fox"),
    ("data.bin", big.as_slice()),
    ("nested/", b""),
    ("nested/inner.txt", b"inside"),
  ])
}

#[tokio::test]
async fn test_chunk_order_does_not_change_the_result() {
  let package = sample_archive();
  let chunk_size = 97;
  let count = package.len().div_ceil(chunk_size);
  let owner = Uuid::new_v4();

  let ascending: Vec<usize> = (0..count).collect();
  let reversed: Vec<usize> = (0..count).rev().collect();
  let interleaved: Vec<usize> = (0..count)
    .filter(|i| i % 2 == 1)
    .chain((0..count).filter(|i| i % 2 == 0))
    .collect();

  let mut results = Vec::new();
  for order in [&ascending, &reversed, &interleaved] {
    let h = Harness::local().await;
    let session = h.begin(owner, package.len() as u64).await;
    h.upload(session, owner, &package, chunk_size, order).await;
    let transfer_id = h.assembler.finalize(session, owner).await.unwrap();
    assert_eq!(transfer_id, session);
    results.push(file_contents(&h, transfer_id).await);
  }

  assert_eq!(results[0], results[1]);
  assert_eq!(results[0], results[2]);
  let names: Vec<_> = results[0].iter().map(|(name, _)| name.as_str()).collect();
  assert_eq!(names, vec!["data.bin", "notes.txt"]);
}

#[tokio::test]
async fn test_gaps_filled_later_assemble_correctly() {
  let h = Harness::object().await;
  let package = archive(&[("a.txt", b"0123456789abcdef")]);
  let owner = Uuid::new_v4();
  let session = h.begin(owner, package.len() as u64).await;
  let count = package.len().div_ceil(10);

  let evens: Vec<usize> = (0..count).step_by(2).collect();
  h.upload(session, owner, &package, 10, &evens).await;
  let odds: Vec<usize> = (1..count).step_by(2).collect();
  h.upload(session, owner, &package, 10, &odds).await;

  let indices = h.uploads.list_accepted_indices(session, owner).await.unwrap();
  assert_eq!(indices, (0..count as u32).collect::<Vec<_>>());

  let transfer_id = h.assembler.finalize(session, owner).await.unwrap();
  let files = file_contents(&h, transfer_id).await;
  assert_eq!(files, vec![("a.txt".to_string(), Bytes::from_static(b"0123456789abcdef"))]);
}

#[tokio::test]
async fn test_reuploaded_chunk_replaces_earlier_bytes() {
  let h = Harness::local().await;
  let package = archive(&[("a.txt", b"final bytes")]);
  let owner = Uuid::new_v4();
  let session = h.begin(owner, package.len() as u64).await;

  h.uploads
    .accept_chunk(session, 0, owner, bytes_stream(Bytes::from_static(b"garbage")))
    .await
    .unwrap();
  h.uploads
    .accept_chunk(session, 0, owner, bytes_stream(package.clone()))
    .await
    .unwrap();

  let transfer_id = h.assembler.finalize(session, owner).await.unwrap();
  let files = file_contents(&h, transfer_id).await;
  assert_eq!(files, vec![("a.txt".to_string(), Bytes::from_static(b"final bytes"))]);
}

#[tokio::test]
async fn test_accepted_indices_are_unique_and_ascending() {
  let h = Harness::object().await;
  let owner = Uuid::new_v4();
  let session = h.begin(owner, 100).await;

  for index in [3, 1, 2, 1] {
    h.uploads
      .accept_chunk(session, index, owner, bytes_stream(Bytes::from_static(b"x")))
      .await
      .unwrap();
  }

  let indices = h.uploads.list_accepted_indices(session, owner).await.unwrap();
  assert_eq!(indices, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_declared_size_is_not_enforced() {
  let h = Harness::local().await;
  let package = archive(&[("twelve.bin", b"123456789012")]);
  let owner = Uuid::new_v4();
  let session = h.begin(owner, 10).await;
  h.upload(session, owner, &package, package.len(), &[0]).await;

  let transfer_id = h.assembler.finalize(session, owner).await.unwrap();
  let info = h.transfers.transfer_info(transfer_id).await.unwrap();
  assert_eq!(info.transfer.total_size, 10);
  assert_eq!(info.files.len(), 1);
  assert_eq!(info.files[0].size, 12);
  assert_eq!(info.files[0].extension, ".bin");
}

#[tokio::test]
async fn test_begin_session_validates_input() {
  let h = Harness::object().await;
  let owner = Uuid::new_v4();

  let err = h
    .uploads
    .begin_session(owner, CallerClass::Guest, 2 * 1024 * 1024 * 1024, "", "1d")
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::LimitExceeded);

  // The same size is fine for a registered caller.
  h.uploads
    .begin_session(owner, CallerClass::Registered, 2 * 1024 * 1024 * 1024, "", "1d")
    .await
    .unwrap();

  let err = h
    .uploads
    .begin_session(owner, CallerClass::Registered, 10, "", "2w")
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_ownership_and_missing_sessions_are_distinct() {
  let h = Harness::object().await;
  let owner = Uuid::new_v4();
  let stranger = Uuid::new_v4();
  let session = h.begin(owner, 10).await;

  let err = h
    .uploads
    .accept_chunk(session, 0, stranger, bytes_stream(Bytes::from_static(b"x")))
    .await
    .unwrap_err();
  assert!(matches!(err, TransferError::Unauthorized(id) if id == session));

  let err = h.uploads.cancel_session(session, stranger).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Unauthorized);
  let err = h.assembler.finalize(session, stranger).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Unauthorized);

  let unknown = Uuid::new_v4();
  let err = h
    .uploads
    .accept_chunk(unknown, 0, owner, bytes_stream(Bytes::from_static(b"x")))
    .await
    .unwrap_err();
  assert!(matches!(err, TransferError::SessionNotFound(id) if id == unknown));
  let err = h.uploads.list_accepted_indices(unknown, owner).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_cancel_without_chunks_succeeds() {
  let h = Harness::local().await;
  let owner = Uuid::new_v4();
  let session = h.begin(owner, 10).await;

  h.uploads.cancel_session(session, owner).await.unwrap();

  let err = h.uploads.list_accepted_indices(session, owner).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_cancel_removes_chunks() {
  let h = Harness::object().await;
  let owner = Uuid::new_v4();
  let session = h.begin(owner, 10).await;
  h.upload(session, owner, b"abcdef", 2, &[0, 1, 2]).await;

  h.uploads.cancel_session(session, owner).await.unwrap();

  let chunk_folder = h.ctx.layout.chunk_folder(session);
  assert!(!h.ctx.storage.exists(&chunk_folder).await.unwrap());
}

#[tokio::test]
async fn test_finalize_without_chunks_keeps_session_open() {
  let h = Harness::local().await;
  let owner = Uuid::new_v4();
  let session = h.begin(owner, 10).await;

  let err = h.assembler.finalize(session, owner).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidInput);
  assert_eq!(
    h.ctx.sessions.state(session),
    SessionState::Open { in_flight: 0 }
  );

  // The session is still usable.
  let package = archive(&[("late.txt", b"late")]);
  h.upload_all(session, owner, &package, 64).await;
  let transfer_id = h.assembler.finalize(session, owner).await.unwrap();
  let files = file_contents(&h, transfer_id).await;
  assert_eq!(files, vec![("late.txt".to_string(), Bytes::from_static(b"late"))]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_chunks_assemble_correctly() {
  for h in [Harness::local().await, Harness::object().await] {
    let package = sample_archive();
    let chunk_size = 300;
    let count = package.len().div_ceil(chunk_size);
    let owner = Uuid::new_v4();
    let session = h.begin(owner, package.len() as u64).await;

    let uploads = Arc::new(ChunkUploadManager::new(h.ctx.clone(), UploadLimits::default()));
    let mut tasks = Vec::new();
    for (index, piece) in package.chunks(chunk_size).enumerate() {
      let uploads = Arc::clone(&uploads);
      let data = Bytes::copy_from_slice(piece);
      tasks.push(tokio::spawn(async move {
        uploads
          .accept_chunk(session, index as u32, owner, bytes_stream(data))
          .await
      }));
    }
    for task in tasks {
      task.await.unwrap().unwrap();
    }

    let indices = h.uploads.list_accepted_indices(session, owner).await.unwrap();
    assert_eq!(indices, (0..count as u32).collect::<Vec<_>>());
    assert_eq!(
      h.ctx.sessions.state(session),
      SessionState::Open { in_flight: 0 }
    );

    let transfer_id = h.assembler.finalize(session, owner).await.unwrap();
    let big: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(
      file_contents(&h, transfer_id).await,
      vec![
        ("data.bin".to_string(), Bytes::from(big)),
        ("notes.txt".to_string(), Bytes::from_static(b"the quick brown fox")),
      ]
    );
  }
}

#[tokio::test]
async fn test_finalize_consumes_the_session() {
  let h = Harness::object().await;
  let owner = Uuid::new_v4();
  let package = archive(&[("a.txt", b"a")]);
  let session = h.begin(owner, package.len() as u64).await;
  h.upload_all(session, owner, &package, 64).await;

  h.assembler.finalize(session, owner).await.unwrap();

  let err = h.assembler.finalize(session, owner).await.unwrap_err();
  assert!(matches!(err, TransferError::SessionNotFound(_)));
  let err = h
    .uploads
    .accept_chunk(session, 1, owner, bytes_stream(Bytes::from_static(b"x")))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);

  assert!(!h.ctx.storage.exists(&h.ctx.layout.chunk_folder(session)).await.unwrap());
  assert!(!h.ctx.storage.exists(&h.ctx.layout.temp_folder(session)).await.unwrap());
}

#[tokio::test]
async fn test_corrupt_package_closes_the_session() {
  let h = Harness::local().await;
  let owner = Uuid::new_v4();
  let session = h.begin(owner, 10).await;
  h.upload(session, owner, b"definitely not a zip", 5, &[0, 1, 2, 3]).await;

  let err = h.assembler.finalize(session, owner).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Internal);

  // Past the point of no return: chunks are gone and the session refuses
  // further uploads, but the record survives for cleanup.
  assert_eq!(h.ctx.sessions.state(session), SessionState::Closed);
  assert!(h.ctx.repo.get_session(session).await.is_ok());
  let err = h
    .uploads
    .accept_chunk(session, 9, owner, bytes_stream(Bytes::from_static(b"x")))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Conflict);

  // Cancel may still discard it.
  h.uploads.cancel_session(session, owner).await.unwrap();
  assert!(h.ctx.repo.get_session(session).await.is_err());
}

async fn finalized(h: &Harness, owner: Uuid, files: &[(&str, &[u8])]) -> Uuid {
  let package = archive(files);
  let session = h.begin(owner, package.len() as u64).await;
  h.upload_all(session, owner, &package, 50).await;
  h.assembler.finalize(session, owner).await.unwrap()
}

#[tokio::test]
async fn test_single_file_stream_holds_a_reference() {
  let h = Harness::local().await;
  let owner = Uuid::new_v4();
  let transfer_id = finalized(&h, owner, &[("only.txt", b"just me")]).await;
  let file_id = h.transfers.transfer_info(transfer_id).await.unwrap().files[0].id;

  let mut download = h.downloads.stream_transfer(transfer_id).await.unwrap();
  assert_eq!(download.filename, "only.txt");
  assert_eq!(h.ctx.repo.get_file(file_id).await.unwrap().active_streams, 1);

  let second = h.downloads.stream_file(file_id).await.unwrap();
  assert_eq!(h.ctx.repo.get_file(file_id).await.unwrap().active_streams, 2);

  assert_eq!(drain(&mut download.stream).await, b"just me");
  download.stream.close().await;
  assert_eq!(h.ctx.repo.get_file(file_id).await.unwrap().active_streams, 1);

  // Closing without reading still releases.
  second.stream.close().await;
  assert_eq!(h.ctx.repo.get_file(file_id).await.unwrap().active_streams, 0);

  // An extra decrement never goes negative.
  h.ctx.repo.decrement_active_streams(file_id).await.unwrap();
  assert_eq!(h.ctx.repo.get_file(file_id).await.unwrap().active_streams, 0);
}

#[tokio::test]
async fn test_downloads_of_one_transfer_run_side_by_side() {
  let h = Harness::local().await;
  let owner = Uuid::new_v4();
  let transfer_id = finalized(&h, owner, &[("a.txt", b"alpha"), ("b.txt", b"bravo")]).await;
  let file_id = h.transfers.transfer_info(transfer_id).await.unwrap().files[0].id;

  // A package being built holds the transfer; a file stream still opens.
  let packing = h.ctx.locks.read(transfer_id).await;
  let single = tokio::time::timeout(Duration::from_millis(500), h.downloads.stream_file(file_id))
    .await
    .expect("stream_file waited on another download")
    .unwrap();
  assert!(h.ctx.locks.try_write(transfer_id).is_none());
  drop(packing);

  let (first, second) = tokio::join!(
    h.downloads.stream_transfer(transfer_id),
    h.downloads.stream_transfer(transfer_id)
  );
  let (mut first, mut second) = (first.unwrap(), second.unwrap());
  assert_eq!(read_archive(&drain(&mut first.stream).await).len(), 2);
  assert_eq!(read_archive(&drain(&mut second.stream).await).len(), 2);
  first.stream.close().await;
  second.stream.close().await;

  // The open file stream still blocks deletion.
  let err = h.transfers.delete_transfer(transfer_id, owner).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Conflict);
  single.stream.close().await;
  h.transfers.delete_transfer(transfer_id, owner).await.unwrap();
  assert!(h.ctx.locks.is_empty());
}

#[tokio::test]
async fn test_dropped_stream_releases_its_reference() {
  let h = Harness::object().await;
  let owner = Uuid::new_v4();
  let transfer_id = finalized(&h, owner, &[("only.txt", b"just me")]).await;
  let file_id = h.transfers.transfer_info(transfer_id).await.unwrap().files[0].id;

  let download = h.downloads.stream_file(file_id).await.unwrap();
  assert_eq!(h.ctx.repo.get_file(file_id).await.unwrap().active_streams, 1);
  drop(download);

  let mut released = false;
  for _ in 0..100 {
    if h.ctx.repo.get_file(file_id).await.unwrap().active_streams == 0 {
      released = true;
      break;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  assert!(released);
}

#[tokio::test]
async fn test_multi_file_transfer_streams_a_package() {
  for h in [Harness::local().await, Harness::object().await] {
    let owner = Uuid::new_v4();
    let transfer_id = finalized(
      &h,
      owner,
      &[
        ("a.txt", b"alpha"),
        ("b.txt", b"bravo"),
        ("sub/", b""),
        ("sub/c.txt", b"charlie"),
      ],
    )
    .await;

    let mut download = h.downloads.stream_transfer(transfer_id).await.unwrap();
    assert_eq!(download.filename, format!("{transfer_id}.zip"));
    let bytes = drain(&mut download.stream).await;
    download.stream.close().await;

    let entries = read_archive(&bytes);
    assert_eq!(
      entries,
      vec![
        ("a.txt".to_string(), b"alpha".to_vec()),
        ("b.txt".to_string(), b"bravo".to_vec()),
        ("sub/".to_string(), Vec::new()),
        ("sub/c.txt".to_string(), b"charlie".to_vec()),
      ]
    );

    // The scratch package is gone and no counters moved.
    let temp = h.ctx.storage.read_folder("temp").await.unwrap_or_default();
    assert!(temp.iter().all(|e| !e.name.ends_with(".zip")));
    for file in h.transfers.transfer_info(transfer_id).await.unwrap().files {
      assert_eq!(file.active_streams, 0);
    }
  }
}

#[tokio::test]
async fn test_missing_transfers_and_files() {
  let h = Harness::object().await;

  let err = h.downloads.stream_transfer(Uuid::new_v4()).await.err().unwrap();
  assert!(matches!(err, TransferError::ExpiredOrMissing(_)));
  let err = h.downloads.stream_file(Uuid::new_v4()).await.err().unwrap();
  assert!(matches!(err, TransferError::FileMissing(_)));
}

#[tokio::test]
async fn test_expired_transfer_is_not_served() {
  let h = Harness::local().await;
  let owner = Uuid::new_v4();
  let transfer_id = finalized(&h, owner, &[("a.txt", b"a")]).await;

  let past = chrono::Utc::now() - chrono::Duration::minutes(1);
  h.ctx
    .repo
    .update_transfer(transfer_id, "", Some(past))
    .await
    .unwrap();

  let err = h.downloads.stream_transfer(transfer_id).await.err().unwrap();
  assert!(matches!(err, TransferError::ExpiredOrMissing(_)));
}

#[tokio::test]
async fn test_owner_manages_transfers() {
  let h = Harness::object().await;
  let owner = Uuid::new_v4();
  let stranger = Uuid::new_v4();
  let first = finalized(&h, owner, &[("a.txt", b"a")]).await;
  let second = finalized(&h, owner, &[("b.txt", b"b")]).await;

  let listed: Vec<_> = h
    .transfers
    .list_transfers(owner)
    .await
    .unwrap()
    .into_iter()
    .map(|t| t.id)
    .collect();
  assert_eq!(listed, vec![second, first]);
  assert!(h.transfers.list_transfers(stranger).await.unwrap().is_empty());

  let err = h
    .transfers
    .update_transfer(first, stranger, "mine now", None)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Unauthorized);

  let updated = h
    .transfers
    .update_transfer(first, owner, "renamed", Some("never"))
    .await
    .unwrap();
  assert_eq!(updated.message, "renamed");
  assert_eq!(updated.expires_at, None);
  assert_eq!(
    h.transfers.transfer_info(first).await.unwrap().transfer,
    updated
  );

  let err = h
    .transfers
    .update_transfer(first, owner, "x", Some("10y"))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidInput);

  // Deletion waits for open downloads to finish.
  let download = h.downloads.stream_transfer(first).await.unwrap();
  let err = h.transfers.delete_transfer(first, owner).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Conflict);
  download.stream.close().await;

  h.transfers.delete_transfer(first, owner).await.unwrap();
  let err = h.transfers.transfer_info(first).await.unwrap_err();
  assert!(matches!(err, TransferError::ExpiredOrMissing(_)));
  assert!(!h.ctx.storage.exists(&h.ctx.layout.upload_folder(first)).await.unwrap());
}
