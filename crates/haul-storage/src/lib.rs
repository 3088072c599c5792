//! Haul Storage
//!
//! This crate provides the storage backend trait and implementations for Haul.
//! Chunks, assembled packages and finalized transfer files all live behind the
//! [`Storage`] trait, addressed by `/`-separated keys relative to the backend
//! root.
//!
//! Two backends share the contract:
//! - [`LocalStorage`] maps keys onto a directory tree.
//! - [`ObjectStorage`] maps keys onto an [`object_store::ObjectStore`]. Object
//!   stores have no directories, so folders are emulated with key prefixes and
//!   a marker object named [`FOLDER_MARKER`].
//!
//! Reads are async byte streams; writes go through an [`ObjectWriter`] that
//! must be closed for the data to count as committed.

mod local;
mod object;

pub use local::LocalStorage;
pub use object::{FOLDER_MARKER, ObjectStorage};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// A boxed stream of bytes read from (or destined for) storage.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested object or folder does not exist.
  #[error("not found: {0}")]
  NotFound(String),

  /// The namespace could not be written at the given path.
  #[error("not writable: {path}")]
  NotWritable {
    path: String,
    #[source]
    source: BoxError,
  },

  /// The key is not a valid relative path (absolute, `..`, etc).
  #[error("invalid path: {0}")]
  InvalidPath(String),

  /// A folder was opened where an object was expected.
  #[error("not a file: {0}")]
  NotAFile(String),

  /// An I/O error occurred.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// The object store reported an error.
  #[error("object store error: {0}")]
  ObjectStore(#[from] object_store::Error),
}

impl Error {
  pub(crate) fn not_writable(
    path: impl Into<String>,
    source: impl Into<BoxError>,
  ) -> Self {
    Self::NotWritable {
      path: path.into(),
      source: source.into(),
    }
  }

  /// Whether this error means the path is absent.
  pub fn is_not_found(&self) -> bool {
    match self {
      Error::NotFound(_) => true,
      Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
      Error::ObjectStore(object_store::Error::NotFound { .. }) => true,
      _ => false,
    }
  }
}

/// Metadata for a single entry in a folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
  /// Base name of the entry.
  pub name: String,
  /// Key of the entry relative to the backend root.
  pub path: String,
  /// Length in bytes (zero for folders).
  pub size: u64,
  /// Last modification time.
  pub modified: DateTime<Utc>,
  /// Whether the entry is a folder.
  pub is_dir: bool,
}

/// A sequential writer returned by [`Storage::open_write`].
///
/// Bytes written before [`ObjectWriter::close`] returns successfully are not
/// considered committed. Dropping a writer without closing it abandons the
/// write.
#[async_trait]
pub trait ObjectWriter: Send {
  /// Append bytes to the object.
  async fn write(&mut self, data: Bytes) -> Result<(), Error>;

  /// Commit the object.
  async fn close(self: Box<Self>) -> Result<(), Error>;
}

/// Storage backend trait.
///
/// Both implementations must behave identically for every operation; callers
/// never touch the underlying medium directly.
#[async_trait]
pub trait Storage: Send + Sync {
  /// Create an empty object at `path`, truncating anything already there.
  async fn create_file(&self, path: &str) -> Result<(), Error>;

  /// Open `path` for sequential reading.
  async fn open_read(&self, path: &str) -> Result<ByteStream, Error>;

  /// Open `path` for sequential writing with create-or-truncate semantics.
  async fn open_write(&self, path: &str) -> Result<Box<dyn ObjectWriter>, Error>;

  /// Create a folder and its ancestors. No-op if it already exists.
  async fn create_folder(&self, path: &str) -> Result<(), Error>;

  /// List the immediate entries of a folder, sorted by name.
  async fn read_folder(&self, path: &str) -> Result<Vec<EntryInfo>, Error>;

  /// List every entry beneath a folder, sorted by path.
  ///
  /// The folder itself is not included.
  async fn list_recursive(&self, path: &str) -> Result<Vec<EntryInfo>, Error>;

  /// Whether `path` denotes a folder. Absent paths are not folders.
  async fn is_folder(&self, path: &str) -> Result<bool, Error>;

  /// Delete a single object. Deleting an absent object succeeds.
  async fn delete_file(&self, path: &str) -> Result<(), Error>;

  /// Delete an object or a folder and everything beneath it.
  /// Deleting an absent path succeeds.
  async fn delete_all(&self, path: &str) -> Result<(), Error>;

  /// Whether anything (object or folder) exists at `path`.
  async fn exists(&self, path: &str) -> Result<bool, Error>;

  /// Size and kind metadata for `path`.
  async fn stat(&self, path: &str) -> Result<EntryInfo, Error>;
}

/// Normalize a key into its canonical `a/b/c` form.
///
/// Leading, trailing and repeated separators are dropped. `.` and `..`
/// segments are rejected so a key can never escape the backend root.
pub fn normalize_key(key: &str) -> Result<String, Error> {
  let mut parts = Vec::new();
  for part in key.split(['/', '\\']) {
    match part {
      "" => continue,
      "." | ".." => return Err(Error::InvalidPath(key.to_string())),
      p => parts.push(p),
    }
  }
  Ok(parts.join("/"))
}

/// Join two keys with a single separator.
pub fn join_key(base: &str, child: &str) -> String {
  let base = base.trim_end_matches('/');
  let child = child.trim_start_matches('/');
  match (base.is_empty(), child.is_empty()) {
    (true, _) => child.to_string(),
    (_, true) => base.to_string(),
    _ => format!("{base}/{child}"),
  }
}

/// Key of `path` relative to `base`, if `path` lies beneath it.
pub fn relative_key<'a>(base: &str, path: &'a str) -> Option<&'a str> {
  let base = base.trim_matches('/');
  if base.is_empty() {
    return Some(path.trim_start_matches('/'));
  }
  path
    .trim_start_matches('/')
    .strip_prefix(base)
    .and_then(|rest| rest.strip_prefix('/'))
}

/// Last segment of a key.
pub fn base_name(key: &str) -> &str {
  let key = key.trim_end_matches('/');
  key.rsplit('/').next().unwrap_or(key)
}

/// Read an entire object into memory.
pub async fn read_all(storage: &dyn Storage, path: &str) -> Result<Bytes, Error> {
  let mut stream = storage.open_read(path).await?;
  let mut buf = BytesMut::new();
  while let Some(chunk) = stream.next().await {
    buf.extend_from_slice(&chunk?);
  }
  Ok(buf.freeze())
}

/// Copy a byte stream into a new object at `path` and commit it.
///
/// Returns the number of bytes written.
pub async fn write_stream(
  storage: &dyn Storage,
  path: &str,
  mut data: ByteStream,
) -> Result<u64, Error> {
  let mut writer = storage.open_write(path).await?;
  let mut written = 0u64;
  while let Some(chunk) = data.next().await {
    let chunk = chunk?;
    written += chunk.len() as u64;
    writer.write(chunk).await?;
  }
  writer.close().await?;
  Ok(written)
}

/// Write a single buffer into a new object at `path` and commit it.
pub async fn write_bytes(storage: &dyn Storage, path: &str, data: Bytes) -> Result<(), Error> {
  let mut writer = storage.open_write(path).await?;
  writer.write(data).await?;
  writer.close().await
}

/// Wrap an in-memory buffer as a [`ByteStream`].
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
  let data: Bytes = data.into();
  Box::pin(futures::stream::once(async move { Ok(data) }))
}
