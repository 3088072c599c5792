//! Zip packaging between storage folders and package objects.
//!
//! Archives need random access, so the zip side always runs on a blocking
//! thread against a local spool file while the async side moves bytes to and
//! from storage. The two halves talk over a bounded channel, which keeps
//! memory flat no matter how large the package is.

use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Component;

use bytes::Bytes;
use futures::StreamExt;
use haul_storage::{ObjectWriter, Storage, join_key, relative_key, write_stream};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::PackageError;

/// Frames in flight between the async storage side and the zip worker.
const FRAME_BUFFER: usize = 16;

/// Read size used when pulling bytes out of an archive entry.
const ENTRY_READ_SIZE: usize = 64 * 1024;

enum Frame {
  Folder(String),
  FileStart(String),
  Data(Bytes),
  FileEnd,
}

/// What a pack or unpack moved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageSummary {
  /// Folders written, relative to the package root.
  pub folders: Vec<String>,
  /// Files written, relative to the package root.
  pub files: Vec<String>,
  /// Total bytes of file content.
  pub bytes: u64,
}

/// Package every entry beneath `folder` into a zip object at `dest`.
///
/// Entry names are relative to `folder`. Folders become zero-byte entries with
/// a trailing `/`, so empty folders survive the round trip.
pub async fn pack_folder(
  storage: &dyn Storage,
  folder: &str,
  dest: &str,
) -> Result<PackageSummary, PackageError> {
  let entries = storage.list_recursive(folder).await?;
  let (tx, rx) = mpsc::channel(FRAME_BUFFER);
  let worker = tokio::task::spawn_blocking(move || write_archive(rx));

  let mut summary = PackageSummary::default();
  let fed = async {
    for entry in &entries {
      let Some(rel) = relative_key(folder, &entry.path) else {
        continue;
      };
      if entry.is_dir {
        if tx.send(Frame::Folder(rel.to_string())).await.is_err() {
          return Ok(());
        }
        summary.folders.push(rel.to_string());
        continue;
      }

      if tx.send(Frame::FileStart(rel.to_string())).await.is_err() {
        return Ok(());
      }
      let mut source = storage.open_read(&entry.path).await?;
      while let Some(chunk) = source.next().await {
        let chunk = chunk?;
        summary.bytes += chunk.len() as u64;
        if tx.send(Frame::Data(chunk)).await.is_err() {
          return Ok(());
        }
      }
      summary.files.push(rel.to_string());
    }
    Ok::<(), PackageError>(())
  }
  .await;
  drop(tx);

  // A worker failure explains why the channel closed, so it wins.
  let spool = worker.await??;
  fed?;

  let file = tokio::fs::File::from_std(spool);
  let stream = ReaderStream::new(file).map(|r| r.map_err(haul_storage::Error::Io));
  let written = write_stream(storage, dest, Box::pin(stream)).await?;
  debug!(
    folder,
    dest,
    files = summary.files.len(),
    folders = summary.folders.len(),
    package_bytes = written,
    "packed folder"
  );
  Ok(summary)
}

fn write_archive(mut rx: mpsc::Receiver<Frame>) -> Result<File, PackageError> {
  let options = SimpleFileOptions::default()
    .compression_method(CompressionMethod::Deflated)
    .large_file(true);
  let mut zip = ZipWriter::new(tempfile::tempfile()?);

  while let Some(frame) = rx.blocking_recv() {
    match frame {
      Frame::Folder(path) => zip.add_directory(format!("{path}/"), options)?,
      Frame::FileStart(path) => zip.start_file(path, options)?,
      Frame::Data(data) => zip.write_all(&data)?,
      Frame::FileEnd => {}
    }
  }

  let mut spool = zip.finish()?;
  spool.rewind()?;
  Ok(spool)
}

/// Unpack the zip object at `package` into `dest`.
///
/// Folder entries become folders; file entries are written to their path
/// beneath `dest`. Entries that would escape `dest` abort the unpack.
pub async fn unpack(
  storage: &dyn Storage,
  package: &str,
  dest: &str,
) -> Result<PackageSummary, PackageError> {
  let spool = spool_object(storage, package).await?;
  let (tx, mut rx) = mpsc::channel(FRAME_BUFFER);
  let worker = tokio::task::spawn_blocking(move || read_archive(spool, tx));

  let mut summary = PackageSummary::default();
  let applied = async {
    let mut writer: Option<(String, Box<dyn ObjectWriter>)> = None;
    while let Some(frame) = rx.recv().await {
      match frame {
        Frame::Folder(rel) => {
          storage.create_folder(&join_key(dest, &rel)).await?;
          summary.folders.push(rel);
        }
        Frame::FileStart(rel) => {
          let out = storage.open_write(&join_key(dest, &rel)).await?;
          writer = Some((rel, out));
        }
        Frame::Data(data) => {
          if let Some((_, out)) = writer.as_mut() {
            summary.bytes += data.len() as u64;
            out.write(data).await?;
          }
        }
        Frame::FileEnd => {
          if let Some((rel, out)) = writer.take() {
            out.close().await?;
            summary.files.push(rel);
          }
        }
      }
    }
    Ok::<(), PackageError>(())
  }
  .await;
  drop(rx);

  worker.await??;
  applied?;

  debug!(
    package,
    dest,
    files = summary.files.len(),
    folders = summary.folders.len(),
    "unpacked package"
  );
  Ok(summary)
}

async fn spool_object(storage: &dyn Storage, path: &str) -> Result<File, PackageError> {
  let mut spool = tokio::fs::File::from_std(tempfile::tempfile()?);
  let mut source = storage.open_read(path).await?;
  while let Some(chunk) = source.next().await {
    spool.write_all(&chunk?).await?;
  }
  spool.flush().await?;

  let mut spool = spool.into_std().await;
  spool.rewind()?;
  Ok(spool)
}

fn read_archive(spool: File, tx: mpsc::Sender<Frame>) -> Result<(), PackageError> {
  let mut archive = ZipArchive::new(spool)?;

  for i in 0..archive.len() {
    let mut entry = archive.by_index(i)?;
    let Some(rel) = entry_key(entry.enclosed_name().as_deref()) else {
      return Err(PackageError::UnsafeEntry(entry.name().to_string()));
    };
    if rel.is_empty() {
      continue;
    }

    if entry.is_dir() {
      if tx.blocking_send(Frame::Folder(rel)).is_err() {
        return Ok(());
      }
      continue;
    }

    if tx.blocking_send(Frame::FileStart(rel)).is_err() {
      return Ok(());
    }
    let mut buf = vec![0u8; ENTRY_READ_SIZE];
    loop {
      let n = entry.read(&mut buf)?;
      if n == 0 {
        break;
      }
      if tx
        .blocking_send(Frame::Data(Bytes::copy_from_slice(&buf[..n])))
        .is_err()
      {
        return Ok(());
      }
    }
    if tx.blocking_send(Frame::FileEnd).is_err() {
      return Ok(());
    }
  }
  Ok(())
}

/// Convert a sanitized archive path into a `/`-separated storage key.
fn entry_key(path: Option<&std::path::Path>) -> Option<String> {
  let path = path?;
  let mut parts = Vec::new();
  for component in path.components() {
    match component {
      Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
      Component::CurDir => {}
      _ => return None,
    }
  }
  Some(parts.join("/"))
}
