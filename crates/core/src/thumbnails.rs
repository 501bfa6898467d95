//! Best-effort thumbnail prefetch.
//!
//! A fixed set of workers pulls files from a shared queue, fetches preview
//! bytes through a [`ThumbnailSource`] and writes them to a
//! [`ThumbnailCache`] directory. Failures are logged and dropped. The pool
//! is independent of the transfer queue and may run beside it.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tvault_blob_store::BlobStore;
use tvault_protocol::FileRecord;
use tvault_scheduler::pipeline;
use tvault_transfer::ContentTransform;

use crate::error::VaultError;

/// Boxed future returned by [`ThumbnailSource::fetch`].
pub type PreviewFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, VaultError>> + Send + 'a>>;

/// Produces preview bytes for a file.
pub trait ThumbnailSource: Send + Sync {
    /// Returns `None` for files that have no preview.
    fn fetch<'a>(&'a self, record: &'a FileRecord) -> PreviewFuture<'a>;
}

/// Uses the whole stored image as its own preview.
pub struct BlobPreviewSource {
    store: Arc<dyn BlobStore>,
    transform: Arc<dyn ContentTransform>,
    max_preview_bytes: u64,
}

impl BlobPreviewSource {
    pub fn new(
        store: Arc<dyn BlobStore>,
        transform: Arc<dyn ContentTransform>,
        max_preview_bytes: u64,
    ) -> Self {
        Self {
            store,
            transform,
            max_preview_bytes,
        }
    }
}

impl ThumbnailSource for BlobPreviewSource {
    fn fetch<'a>(&'a self, record: &'a FileRecord) -> PreviewFuture<'a> {
        Box::pin(async move {
            if !record.mime_type.starts_with("image/") || record.size > self.max_preview_bytes {
                return Ok(None);
            }
            let data = pipeline::fetch_file(
                self.store.as_ref(),
                record,
                self.transform.as_ref(),
                &CancellationToken::new(),
                |_| {},
            )
            .await?;
            Ok(Some(data))
        })
    }
}

/// Directory of cached previews, one file per stored file id.
#[derive(Debug, Clone)]
pub struct ThumbnailCache {
    dir: PathBuf,
}

impl ThumbnailCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache file of `record`: hashed id plus an extension from the mime type.
    pub fn path_for(&self, record: &FileRecord) -> PathBuf {
        let ext = mime_to_ext(&record.mime_type);
        self.dir.join(format!("{}{ext}", hash_key(&record.id)))
    }

    pub async fn contains(&self, record: &FileRecord) -> bool {
        tokio::fs::metadata(self.path_for(record))
            .await
            .is_ok_and(|m| m.is_file())
    }

    pub async fn get(&self, record: &FileRecord) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(record)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn put(&self, record: &FileRecord, data: &[u8]) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(record);
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }

    /// Removes every cached preview.
    pub async fn clear(&self) -> std::io::Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
        Ok(())
    }

    /// Total bytes on disk.
    pub async fn size(&self) -> u64 {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return 0;
        };
        let mut total = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            match entry.metadata().await {
                Ok(meta) if meta.is_file() => total += meta.len(),
                _ => {}
            }
        }
        total
    }
}

/// First 16 bytes of SHA-256 as 32 hex characters.
pub fn hash_key(key: &str) -> String {
    let hash = Sha256::digest(key.as_bytes());
    hex::encode(&hash[..16])
}

fn mime_to_ext(mime: &str) -> &'static str {
    match mime {
        "image/png" => ".png",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        "image/jpeg" => ".jpg",
        _ => ".bin",
    }
}

/// Count of queued plus in-progress records.
#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// Fixed-size prefetch worker pool.
///
/// Must be created inside a tokio runtime. Dropping it stops the workers.
pub struct ThumbnailPrefetcher {
    queue: mpsc::UnboundedSender<FileRecord>,
    pending: Arc<Pending>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl ThumbnailPrefetcher {
    pub fn new(source: Arc<dyn ThumbnailSource>, cache: ThumbnailCache, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let pending = Arc::new(Pending::default());
        let shutdown = CancellationToken::new();

        let workers = (0..workers.max(1))
            .map(|n| {
                tokio::spawn(worker(
                    n,
                    rx.clone(),
                    source.clone(),
                    cache.clone(),
                    pending.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        Self {
            queue: tx,
            pending,
            shutdown,
            workers,
        }
    }

    /// Queues records for prefetch. Returns how many were accepted.
    pub fn prefetch<I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = FileRecord>,
    {
        let mut queued = 0;
        for record in records {
            self.pending.add();
            if self.queue.send(record).is_err() {
                self.pending.done();
                break;
            }
            queued += 1;
        }
        queued
    }

    /// Records queued or being fetched.
    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    /// Waits until every queued record has been handled.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.pending.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.get() == 0 || self.shutdown.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Stops the workers. Queued records are dropped.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.pending.idle.notify_waiters();
    }
}

impl Drop for ThumbnailPrefetcher {
    fn drop(&mut self) {
        self.shutdown();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn worker(
    n: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<FileRecord>>>,
    source: Arc<dyn ThumbnailSource>,
    cache: ThumbnailCache,
    pending: Arc<Pending>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            record = async { queue.lock().await.recv().await } => record,
        };
        let Some(record) = next else {
            break;
        };

        if let Err(e) = prefetch_one(source.as_ref(), &cache, record.clone()).await {
            warn!(worker = n, file = %record.name, error = %e, "thumbnail prefetch failed");
        }
        pending.done();
    }
    debug!(worker = n, "thumbnail worker stopped");
}

async fn prefetch_one(
    source: &dyn ThumbnailSource,
    cache: &ThumbnailCache,
    record: FileRecord,
) -> Result<(), VaultError> {
    if cache.contains(&record).await {
        return Ok(());
    }
    let Some(data) = source.fetch(&record).await? else {
        return Ok(());
    };

    let path = cache.put(&record, &data).await?;
    debug!(path = %path.display(), "thumbnail cached");
    Ok(())
}
