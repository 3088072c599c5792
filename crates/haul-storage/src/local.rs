use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::{ByteStream, EntryInfo, Error, ObjectWriter, Storage, base_name, normalize_key};

/// Prefix of the scratch files an open writer fills before it is committed.
const PART_PREFIX: &str = ".haul-part-";

static PART_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Filesystem-based storage.
///
/// Each key is stored at `{root}/{key}`. Writers fill a hidden sibling file
/// and rename it into place on close, so an unclosed writer never replaces
/// committed bytes.
pub struct LocalStorage {
  root: PathBuf,
}

impl LocalStorage {
  /// Create a new filesystem storage rooted at the given path.
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  /// Get the root directory of the storage.
  pub fn root(&self) -> &Path {
    &self.root
  }

  fn resolve(&self, key: &str) -> Result<(String, PathBuf), Error> {
    let key = normalize_key(key)?;
    let path = if key.is_empty() {
      self.root.clone()
    } else {
      self.root.join(&key)
    };
    Ok((key, path))
  }

  fn entry_info(key: &str, meta: &std::fs::Metadata) -> EntryInfo {
    EntryInfo {
      name: base_name(key).to_string(),
      path: key.to_string(),
      size: if meta.is_dir() { 0 } else { meta.len() },
      modified: meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH)),
      is_dir: meta.is_dir(),
    }
  }
}

fn map_not_found(key: &str, e: std::io::Error) -> Error {
  if e.kind() == ErrorKind::NotFound {
    Error::NotFound(key.to_string())
  } else {
    Error::Io(e)
  }
}

fn is_part_file(name: &str) -> bool {
  name.starts_with(PART_PREFIX)
}

#[async_trait]
impl Storage for LocalStorage {
  async fn create_file(&self, path: &str) -> Result<(), Error> {
    let (key, full) = self.resolve(path)?;
    if let Some(parent) = full.parent() {
      fs::create_dir_all(parent)
        .await
        .map_err(|e| Error::not_writable(&key, e))?;
    }
    File::create(&full)
      .await
      .map_err(|e| Error::not_writable(&key, e))?;
    Ok(())
  }

  async fn open_read(&self, path: &str) -> Result<ByteStream, Error> {
    let (key, full) = self.resolve(path)?;
    let meta = fs::metadata(&full).await.map_err(|e| map_not_found(&key, e))?;
    if meta.is_dir() {
      return Err(Error::NotAFile(key));
    }
    let file = File::open(&full).await.map_err(|e| map_not_found(&key, e))?;
    let stream = ReaderStream::new(file).map(|r| r.map_err(Error::Io));
    Ok(Box::pin(stream))
  }

  async fn open_write(&self, path: &str) -> Result<Box<dyn ObjectWriter>, Error> {
    let (key, full) = self.resolve(path)?;
    if key.is_empty() {
      return Err(Error::InvalidPath(path.to_string()));
    }
    let parent = full
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_else(|| self.root.clone());
    fs::create_dir_all(&parent)
      .await
      .map_err(|e| Error::not_writable(&key, e))?;

    let part = parent.join(format!(
      "{PART_PREFIX}{}-{}",
      std::process::id(),
      PART_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let file = File::create(&part)
      .await
      .map_err(|e| Error::not_writable(&key, e))?;

    Ok(Box::new(LocalWriter {
      file: Some(file),
      part,
      target: full,
    }))
  }

  async fn create_folder(&self, path: &str) -> Result<(), Error> {
    let (key, full) = self.resolve(path)?;
    fs::create_dir_all(&full)
      .await
      .map_err(|e| Error::not_writable(&key, e))
  }

  async fn read_folder(&self, path: &str) -> Result<Vec<EntryInfo>, Error> {
    let (key, full) = self.resolve(path)?;
    let mut entries = fs::read_dir(&full)
      .await
      .map_err(|e| map_not_found(&key, e))?;

    let mut infos = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
      let name = entry.file_name().to_string_lossy().into_owned();
      if is_part_file(&name) {
        continue;
      }
      let meta = entry.metadata().await?;
      infos.push(Self::entry_info(&crate::join_key(&key, &name), &meta));
    }

    infos.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(infos)
  }

  async fn list_recursive(&self, path: &str) -> Result<Vec<EntryInfo>, Error> {
    let (key, full) = self.resolve(path)?;
    let meta = fs::metadata(&full).await.map_err(|e| map_not_found(&key, e))?;
    if !meta.is_dir() {
      return Err(Error::NotFound(key));
    }

    let mut infos = Vec::new();
    let mut pending = vec![(key, full)];
    while let Some((dir_key, dir_path)) = pending.pop() {
      let mut entries = fs::read_dir(&dir_path).await?;
      while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_part_file(&name) {
          continue;
        }
        let entry_key = crate::join_key(&dir_key, &name);
        let meta = entry.metadata().await?;
        if meta.is_dir() {
          pending.push((entry_key.clone(), entry.path()));
        }
        infos.push(Self::entry_info(&entry_key, &meta));
      }
    }

    infos.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(infos)
  }

  async fn is_folder(&self, path: &str) -> Result<bool, Error> {
    let (_, full) = self.resolve(path)?;
    match fs::metadata(&full).await {
      Ok(meta) => Ok(meta.is_dir()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
      Err(e) => Err(Error::Io(e)),
    }
  }

  async fn delete_file(&self, path: &str) -> Result<(), Error> {
    let (_, full) = self.resolve(path)?;
    match fs::remove_file(&full).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(Error::Io(e)),
    }
  }

  async fn delete_all(&self, path: &str) -> Result<(), Error> {
    let (key, full) = self.resolve(path)?;
    if key.is_empty() {
      return Err(Error::InvalidPath(path.to_string()));
    }
    let result = match fs::symlink_metadata(&full).await {
      Ok(meta) if meta.is_dir() => fs::remove_dir_all(&full).await,
      Ok(_) => fs::remove_file(&full).await,
      Err(e) => Err(e),
    };
    match result {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(Error::Io(e)),
    }
  }

  async fn exists(&self, path: &str) -> Result<bool, Error> {
    let (_, full) = self.resolve(path)?;
    Ok(fs::try_exists(&full).await?)
  }

  async fn stat(&self, path: &str) -> Result<EntryInfo, Error> {
    let (key, full) = self.resolve(path)?;
    let meta = fs::metadata(&full).await.map_err(|e| map_not_found(&key, e))?;
    Ok(Self::entry_info(&key, &meta))
  }
}

/// Writer for [`LocalStorage`]. Renames the part file over the target on close.
struct LocalWriter {
  file: Option<File>,
  part: PathBuf,
  target: PathBuf,
}

#[async_trait]
impl ObjectWriter for LocalWriter {
  async fn write(&mut self, data: Bytes) -> Result<(), Error> {
    match self.file.as_mut() {
      Some(file) => Ok(file.write_all(&data).await?),
      None => Err(Error::Io(std::io::Error::other("writer already closed"))),
    }
  }

  async fn close(mut self: Box<Self>) -> Result<(), Error> {
    let Some(mut file) = self.file.take() else {
      return Ok(());
    };
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    if let Err(e) = fs::rename(&self.part, &self.target).await {
      let _ = fs::remove_file(&self.part).await;
      return Err(Error::Io(e));
    }
    Ok(())
  }
}

impl Drop for LocalWriter {
  fn drop(&mut self) {
    // Closed writers have already renamed the part file away.
    if self.file.take().is_some()
      && let Err(e) = std::fs::remove_file(&self.part)
      && e.kind() != ErrorKind::NotFound
    {
      warn!(path = %self.part.display(), error = %e, "failed to remove abandoned part file");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{read_all, write_bytes};

  #[tokio::test]
  async fn test_unclosed_writer_leaves_previous_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(dir.path());

    write_bytes(&storage, "a/b.bin", Bytes::from_static(b"first"))
      .await
      .unwrap();

    let mut writer = storage.open_write("a/b.bin").await.unwrap();
    writer.write(Bytes::from_static(b"second")).await.unwrap();
    drop(writer);

    let data = read_all(&storage, "a/b.bin").await.unwrap();
    assert_eq!(&data[..], b"first");

    // The abandoned part file is cleaned up and never listed.
    let entries = storage.read_folder("a").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "b.bin");
  }

  #[tokio::test]
  async fn test_open_read_on_folder_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(dir.path());
    storage.create_folder("x/y").await.unwrap();

    let result = storage.open_read("x").await;
    assert!(matches!(result, Err(Error::NotAFile(_))));
  }

  #[tokio::test]
  async fn test_delete_all_refuses_root() {
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(dir.path());
    assert!(matches!(
      storage.delete_all("/").await,
      Err(Error::InvalidPath(_))
    ));
  }
}
