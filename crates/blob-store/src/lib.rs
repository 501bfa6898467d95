//! Remote object store adapter.
//!
//! The backend only understands "send an opaque blob with a caption, get
//! back an immutable handle" plus listing, reading and deleting blobs that
//! were already sent. [`BlobStore`] is that seam; the rest of the engine is
//! written against it and tested with [`MemoryStore`].

mod dir;
mod memory;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tvault_protocol::BlobHandle;

pub use dir::DirStore;
pub use memory::{Fault, MemoryStore};

/// Default blob ceiling: 2 GiB.
pub const DEFAULT_MAX_BLOB_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Boxed future returned by [`BlobStore`] methods.
pub type BlobFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BlobStoreError>> + Send + 'a>>;

/// Errors surfaced by a backend.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rate limited by backend{}", retry_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("blob not found: {0}")]
    NotFound(BlobHandle),

    #[error("blob of {size} bytes exceeds the {limit} byte limit")]
    BlobTooLarge { size: u64, limit: u64 },

    #[error("backend error: {0}")]
    Backend(String),
}

impl BlobStoreError {
    /// `true` if the backend asked us to slow down.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

fn retry_suffix(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(", retry after {}s", d.as_secs()))
        .unwrap_or_default()
}

/// A blob as returned by [`BlobStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub handle: BlobHandle,
    /// Message text stored alongside the blob.
    pub caption: String,
    pub size: u64,
}

/// Abstract append-only object store.
///
/// Implementations must assign ids that increase monotonically within a
/// container and must reject payloads above [`max_blob_size`](Self::max_blob_size).
pub trait BlobStore: Send + Sync {
    /// Stores `data` with `caption` in `container` and returns its handle.
    fn put<'a>(&'a self, container: &'a str, data: Vec<u8>, caption: &'a str)
    -> BlobFuture<'a, BlobHandle>;

    /// Reads a blob's payload.
    fn get<'a>(&'a self, handle: &'a BlobHandle) -> BlobFuture<'a, Vec<u8>>;

    /// Lists every blob in a container, oldest first.
    fn list<'a>(&'a self, container: &'a str) -> BlobFuture<'a, Vec<BlobEntry>>;

    /// Deletes a blob.
    fn delete<'a>(&'a self, handle: &'a BlobHandle) -> BlobFuture<'a, ()>;

    /// Names of all containers that currently hold blobs.
    fn containers(&self) -> BlobFuture<'_, Vec<String>>;

    /// Largest payload accepted by [`put`](Self::put).
    fn max_blob_size(&self) -> u64;
}

/// Rejects payloads that exceed the backend limit.
pub(crate) fn check_size(len: usize, limit: u64) -> Result<(), BlobStoreError> {
    let size = len as u64;
    if size > limit {
        return Err(BlobStoreError::BlobTooLarge { size, limit });
    }
    Ok(())
}
