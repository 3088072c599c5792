//! Byte streams with cleanup attached to their lifetime.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use haul_storage::{ByteStream, Storage};
use haul_store::Repository;
use tokio::runtime::Handle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Cleanup run once when a [`GuardedStream`] closes.
///
/// Implementations log failures; there is nobody left to return them to.
#[async_trait]
pub trait Release: Send + 'static {
  async fn release(self: Box<Self>);
}

/// Decrements a file's active stream count.
pub struct DecrementOnClose {
  repo: Arc<dyn Repository>,
  file_id: Uuid,
}

impl DecrementOnClose {
  pub fn new(repo: Arc<dyn Repository>, file_id: Uuid) -> Self {
    Self { repo, file_id }
  }
}

#[async_trait]
impl Release for DecrementOnClose {
  async fn release(self: Box<Self>) {
    match self.repo.decrement_active_streams(self.file_id).await {
      Ok(()) => debug!(file_id = %self.file_id, "released file stream"),
      Err(e) => warn!(file_id = %self.file_id, error = %e, "failed to decrement active streams"),
    }
  }
}

/// Deletes a scratch object.
pub struct DeleteOnClose {
  storage: Arc<dyn Storage>,
  path: String,
}

impl DeleteOnClose {
  pub fn new(storage: Arc<dyn Storage>, path: impl Into<String>) -> Self {
    Self {
      storage,
      path: path.into(),
    }
  }
}

#[async_trait]
impl Release for DeleteOnClose {
  async fn release(self: Box<Self>) {
    match self.storage.delete_file(&self.path).await {
      Ok(()) => debug!(path = %self.path, "deleted scratch package"),
      Err(e) => warn!(path = %self.path, error = %e, "failed to delete scratch package"),
    }
  }
}

/// A byte stream that owns a [`Release`] action.
///
/// The release runs exactly once: when [`GuardedStream::close`] is awaited,
/// or, if the stream is dropped unclosed, on a task spawned onto the current
/// runtime. The outcome of reading never affects the release.
pub struct GuardedStream {
  inner: Option<ByteStream>,
  release: Option<Box<dyn Release>>,
}

impl GuardedStream {
  pub fn new(inner: ByteStream, release: impl Release) -> Self {
    Self {
      inner: Some(inner),
      release: Some(Box::new(release)),
    }
  }

  /// Close the underlying stream and run the release action.
  pub async fn close(mut self) {
    self.inner.take();
    if let Some(release) = self.release.take() {
      release.release().await;
    }
  }
}

impl Stream for GuardedStream {
  type Item = Result<Bytes, haul_storage::Error>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    match self.inner.as_mut() {
      Some(inner) => inner.as_mut().poll_next(cx),
      None => Poll::Ready(None),
    }
  }
}

impl Drop for GuardedStream {
  fn drop(&mut self) {
    self.inner.take();
    let Some(release) = self.release.take() else {
      return;
    };
    match Handle::try_current() {
      Ok(handle) => {
        handle.spawn(release.release());
      }
      Err(_) => warn!("stream dropped outside a runtime; release skipped"),
    }
  }
}
