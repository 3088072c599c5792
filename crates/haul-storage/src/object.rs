use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutPayload, WriteMultipart};
use tracing::warn;

use crate::{ByteStream, EntryInfo, Error, ObjectWriter, Storage, base_name, normalize_key};

/// Name of the marker object that makes an empty prefix visible as a folder.
pub const FOLDER_MARKER: &str = ".haul-folder";

/// Writes below this size are sent as a single put on close.
const PART_SIZE: usize = 5 * 1024 * 1024;

/// Parts uploaded concurrently once a write switches to multipart.
const MAX_CONCURRENT_PARTS: usize = 4;

/// Object-store-based storage.
///
/// Keys map one-to-one onto object locations. Folders have no native
/// representation: a folder exists while any object lives beneath its prefix,
/// and [`Storage::create_folder`] writes a [`FOLDER_MARKER`] object so empty
/// folders survive. Listings report marker objects as folders and never as
/// files.
pub struct ObjectStorage {
  store: Arc<dyn ObjectStore>,
}

impl ObjectStorage {
  /// Create a new object storage over the given store.
  pub fn new(store: Arc<dyn ObjectStore>) -> Self {
    Self { store }
  }

  /// Create an object storage backed by an in-memory store.
  pub fn in_memory() -> Self {
    Self::new(Arc::new(object_store::memory::InMemory::new()))
  }

  /// Create an object storage over an S3 bucket.
  ///
  /// Credentials and any option left as `None` are read from the standard
  /// `AWS_*` environment variables. Nothing is contacted until first use.
  pub fn s3(bucket: &str, region: Option<&str>, endpoint: Option<&str>) -> Result<Self, Error> {
    let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
    if let Some(region) = region {
      builder = builder.with_region(region);
    }
    if let Some(endpoint) = endpoint {
      builder = builder
        .with_endpoint(endpoint)
        .with_allow_http(endpoint.starts_with("http://"));
    }
    Ok(Self::new(Arc::new(builder.build()?)))
  }

  fn location(key: &str) -> Result<(String, Path), Error> {
    let key = normalize_key(key)?;
    let path = if key.is_empty() {
      Path::default()
    } else {
      Path::parse(&key).map_err(|_| Error::InvalidPath(key.clone()))?
    };
    Ok((key, path))
  }

  fn prefix(path: &Path) -> Option<&Path> {
    if path.as_ref().is_empty() {
      None
    } else {
      Some(path)
    }
  }

  fn file_info(meta: &ObjectMeta) -> EntryInfo {
    let key = meta.location.as_ref();
    EntryInfo {
      name: base_name(key).to_string(),
      path: key.to_string(),
      size: meta.size as u64,
      modified: meta.last_modified,
      is_dir: false,
    }
  }

  fn folder_info(key: &str, modified: DateTime<Utc>) -> EntryInfo {
    EntryInfo {
      name: base_name(key).to_string(),
      path: key.to_string(),
      size: 0,
      modified,
      is_dir: true,
    }
  }

  fn is_marker(meta: &ObjectMeta) -> bool {
    meta.location.filename() == Some(FOLDER_MARKER)
  }

  async fn folder_modified(&self, folder: &Path) -> DateTime<Utc> {
    match self.store.head(&folder.child(FOLDER_MARKER)).await {
      Ok(meta) => meta.last_modified,
      Err(_) => DateTime::<Utc>::from(std::time::UNIX_EPOCH),
    }
  }

  async fn has_children(&self, path: &Path) -> Result<bool, Error> {
    let mut listing = self.store.list(Self::prefix(path));
    match listing.next().await {
      Some(Ok(_)) => Ok(true),
      Some(Err(e)) => Err(Error::ObjectStore(e)),
      None => Ok(false),
    }
  }
}

fn not_found(key: &str, e: object_store::Error) -> Error {
  match e {
    object_store::Error::NotFound { .. } => Error::NotFound(key.to_string()),
    e => Error::ObjectStore(e),
  }
}

#[async_trait]
impl Storage for ObjectStorage {
  async fn create_file(&self, path: &str) -> Result<(), Error> {
    let (key, location) = Self::location(path)?;
    self
      .store
      .put(&location, PutPayload::from(Bytes::new()))
      .await
      .map_err(|e| Error::not_writable(key, e))?;
    Ok(())
  }

  async fn open_read(&self, path: &str) -> Result<ByteStream, Error> {
    let (key, location) = Self::location(path)?;
    let result = self
      .store
      .get(&location)
      .await
      .map_err(|e| not_found(&key, e))?;
    let stream = result.into_stream().map_err(Error::ObjectStore);
    Ok(Box::pin(stream))
  }

  async fn open_write(&self, path: &str) -> Result<Box<dyn ObjectWriter>, Error> {
    let (key, location) = Self::location(path)?;
    if key.is_empty() {
      return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(Box::new(ObjectUpload {
      store: Arc::clone(&self.store),
      key,
      location,
      buffer: BytesMut::new(),
      multipart: None,
    }))
  }

  async fn create_folder(&self, path: &str) -> Result<(), Error> {
    let (key, location) = Self::location(path)?;
    if key.is_empty() {
      return Ok(());
    }
    let marker = location.child(FOLDER_MARKER);
    if self.store.head(&marker).await.is_ok() {
      return Ok(());
    }
    self
      .store
      .put(&marker, PutPayload::from(Bytes::new()))
      .await
      .map_err(|e| Error::not_writable(key, e))?;
    Ok(())
  }

  async fn read_folder(&self, path: &str) -> Result<Vec<EntryInfo>, Error> {
    let (key, location) = Self::location(path)?;
    let listing = self
      .store
      .list_with_delimiter(Self::prefix(&location))
      .await?;

    if listing.objects.is_empty() && listing.common_prefixes.is_empty() {
      return Err(Error::NotFound(key));
    }

    let mut infos: Vec<EntryInfo> = listing
      .objects
      .iter()
      .filter(|meta| !Self::is_marker(meta))
      .map(Self::file_info)
      .collect();

    for folder in &listing.common_prefixes {
      let modified = self.folder_modified(folder).await;
      infos.push(Self::folder_info(folder.as_ref(), modified));
    }

    infos.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(infos)
  }

  async fn list_recursive(&self, path: &str) -> Result<Vec<EntryInfo>, Error> {
    let (key, location) = Self::location(path)?;
    let objects: Vec<ObjectMeta> = self
      .store
      .list(Self::prefix(&location))
      .try_collect()
      .await?;

    if objects.is_empty() {
      return Err(Error::NotFound(key));
    }

    let mut entries: BTreeMap<String, EntryInfo> = BTreeMap::new();
    for meta in &objects {
      let object_key = meta.location.as_ref();

      // Every prefix between the listed folder and the object is a folder.
      let mut parent = object_key.rsplit_once('/').map(|(p, _)| p);
      while let Some(folder) = parent {
        if folder.len() <= key.len() {
          break;
        }
        entries
          .entry(folder.to_string())
          .or_insert_with(|| Self::folder_info(folder, meta.last_modified));
        parent = folder.rsplit_once('/').map(|(p, _)| p);
      }

      // Markers only announce their folder, which the walk above recorded.
      if Self::is_marker(meta) {
        continue;
      }

      entries.insert(object_key.to_string(), Self::file_info(meta));
    }

    Ok(entries.into_values().collect())
  }

  async fn is_folder(&self, path: &str) -> Result<bool, Error> {
    let (key, location) = Self::location(path)?;
    if key.is_empty() {
      return Ok(true);
    }
    self.has_children(&location).await
  }

  async fn delete_file(&self, path: &str) -> Result<(), Error> {
    let (_, location) = Self::location(path)?;
    match self.store.delete(&location).await {
      Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
      Err(e) => Err(Error::ObjectStore(e)),
    }
  }

  async fn delete_all(&self, path: &str) -> Result<(), Error> {
    let (key, location) = Self::location(path)?;
    if key.is_empty() {
      return Err(Error::InvalidPath(path.to_string()));
    }

    let mut doomed: Vec<Path> = self
      .store
      .list(Some(&location))
      .map_ok(|meta| meta.location)
      .try_collect()
      .await?;
    doomed.push(location);

    for target in doomed {
      match self.store.delete(&target).await {
        Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
        Err(e) => return Err(Error::ObjectStore(e)),
      }
    }
    Ok(())
  }

  async fn exists(&self, path: &str) -> Result<bool, Error> {
    let (key, location) = Self::location(path)?;
    if key.is_empty() {
      return Ok(true);
    }
    match self.store.head(&location).await {
      Ok(_) => Ok(true),
      Err(object_store::Error::NotFound { .. }) => self.has_children(&location).await,
      Err(e) => Err(Error::ObjectStore(e)),
    }
  }

  async fn stat(&self, path: &str) -> Result<EntryInfo, Error> {
    let (key, location) = Self::location(path)?;
    match self.store.head(&location).await {
      Ok(meta) => Ok(Self::file_info(&meta)),
      Err(object_store::Error::NotFound { .. }) => {
        if key.is_empty() || self.has_children(&location).await? {
          let modified = self.folder_modified(&location).await;
          Ok(Self::folder_info(&key, modified))
        } else {
          Err(Error::NotFound(key))
        }
      }
      Err(e) => Err(Error::ObjectStore(e)),
    }
  }
}

/// Writer for [`ObjectStorage`].
///
/// Buffers until [`PART_SIZE`] bytes arrive, then switches to a multipart
/// upload. Small objects are committed with a single put on close. A writer
/// dropped mid-multipart aborts the upload so its parts do not linger.
struct ObjectUpload {
  store: Arc<dyn ObjectStore>,
  key: String,
  location: Path,
  buffer: BytesMut,
  multipart: Option<WriteMultipart>,
}

#[async_trait]
impl ObjectWriter for ObjectUpload {
  async fn write(&mut self, data: Bytes) -> Result<(), Error> {
    if let Some(upload) = self.multipart.as_mut() {
      upload.wait_for_capacity(MAX_CONCURRENT_PARTS).await?;
      upload.write(&data);
      return Ok(());
    }

    self.buffer.extend_from_slice(&data);
    if self.buffer.len() >= PART_SIZE {
      let upload = self
        .store
        .put_multipart(&self.location)
        .await
        .map_err(|e| Error::not_writable(self.key.clone(), e))?;
      let mut upload = WriteMultipart::new_with_chunk_size(upload, PART_SIZE);
      upload.write(&self.buffer.split());
      self.multipart = Some(upload);
    }
    Ok(())
  }

  async fn close(mut self: Box<Self>) -> Result<(), Error> {
    match self.multipart.take() {
      Some(upload) => {
        upload.finish().await?;
      }
      None => {
        let payload = PutPayload::from(self.buffer.split().freeze());
        self
          .store
          .put(&self.location, payload)
          .await
          .map_err(|e| Error::not_writable(self.key.clone(), e))?;
      }
    }
    Ok(())
  }
}

impl Drop for ObjectUpload {
  fn drop(&mut self) {
    let Some(upload) = self.multipart.take() else {
      return;
    };
    let key = std::mem::take(&mut self.key);
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        handle.spawn(async move {
          if let Err(e) = upload.abort().await {
            warn!(key = %key, error = %e, "failed to abort multipart upload");
          }
        });
      }
      Err(_) => warn!(key = %key, "multipart upload dropped outside a runtime; not aborted"),
    }
  }
}
