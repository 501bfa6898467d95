//! The vault: one handle over metadata, transfers, recovery and previews.
//!
//! When the metadata document cannot be read on open, the vault is
//! blocked: browsing and organizing fail with
//! [`VaultError::MetadataUnavailable`] until [`Vault::rebuild_metadata`]
//! succeeds or [`Vault::decline_rebuild`] starts over from an empty
//! document.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tvault_blob_store::BlobStore;
use tvault_metadata::{
    FolderRemoval, FolderStats, Listing, MetadataError, MetadataStore, StorageStats,
};
use tvault_protocol::{
    FileRecord, FolderPath, MetadataDocument, MigrationProgress, PathError, ProgressStatus,
    validate_name,
};
use tvault_scheduler::pipeline;
use tvault_scheduler::{TransferBoard, TransferEvent, TransferItem, TransferScheduler};
use tvault_transfer::{ContentTransform, Passthrough};

use crate::config::VaultConfig;
use crate::error::VaultError;
use crate::migrate::{self, MigrationReport};
use crate::notify::{Notification, NotificationQueue};
use crate::reconcile::{self, RebuildReport};
use crate::thumbnails::{BlobPreviewSource, ThumbnailCache, ThumbnailPrefetcher, ThumbnailSource};

/// Outcome of [`Vault::delete_files`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkDeleteReport {
    pub deleted: usize,
    /// `(file id, error)` for every file that could not be deleted.
    pub failed: Vec<(String, String)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Vault handle. Must be opened inside a tokio runtime.
pub struct Vault {
    config: VaultConfig,
    store: Arc<dyn BlobStore>,
    metadata: Arc<MetadataStore>,
    scheduler: TransferScheduler,
    blocked: AtomicBool,
    board: Arc<Mutex<TransferBoard>>,
    notifications: Arc<Mutex<NotificationQueue>>,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
    forwarder: JoinHandle<()>,
    preview: Arc<BlobPreviewSource>,
    thumbnail_cache: ThumbnailCache,
    prefetcher: ThumbnailPrefetcher,
    shutdown: CancellationToken,
}

impl Vault {
    /// Opens a vault over `store` with plain (untransformed) content.
    pub async fn open(store: Arc<dyn BlobStore>, config: VaultConfig) -> Result<Self, VaultError> {
        Self::open_with_transform(store, config, Arc::new(Passthrough)).await
    }

    /// Opens a vault whose encrypted files go through `transform`.
    pub async fn open_with_transform(
        store: Arc<dyn BlobStore>,
        config: VaultConfig,
        transform: Arc<dyn ContentTransform>,
    ) -> Result<Self, VaultError> {
        let metadata = Arc::new(MetadataStore::new(store.clone(), config.metadata_config()));

        let blocked = match metadata.load().await {
            Ok(()) => false,
            Err(MetadataError::MetadataCorrupt(reason)) => {
                warn!(reason = %reason, "metadata unreadable, vault blocked until rebuilt");
                true
            }
            Err(e) => return Err(e.into()),
        };

        let mut scheduler = TransferScheduler::new(
            store.clone(),
            metadata.clone(),
            transform.clone(),
            config.scheduler_config(),
        );

        let board = Arc::new(Mutex::new(TransferBoard::new()));
        let notifications = Arc::new(Mutex::new(NotificationQueue::new()));
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let forwarder = match scheduler.take_events() {
            Some(rx) => tokio::spawn(forward_events(
                rx,
                board.clone(),
                notifications.clone(),
                events_tx,
            )),
            None => tokio::spawn(async {}),
        };

        let preview = Arc::new(BlobPreviewSource::new(
            store.clone(),
            transform,
            config.max_preview_bytes,
        ));
        let thumbnail_cache = ThumbnailCache::new(config.thumbnail_cache_dir.clone());
        let prefetcher = ThumbnailPrefetcher::new(
            preview.clone(),
            thumbnail_cache.clone(),
            config.thumbnail_workers,
        );

        info!(blocked, "vault opened");
        Ok(Self {
            config,
            store,
            metadata,
            scheduler,
            blocked: AtomicBool::new(blocked),
            board,
            notifications,
            events_rx: Some(events_rx),
            forwarder,
            preview,
            thumbnail_cache,
            prefetcher,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// `true` while the metadata document is unavailable.
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<(), VaultError> {
        if self.is_blocked() {
            return Err(VaultError::MetadataUnavailable);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Browse
    // -----------------------------------------------------------------------

    pub async fn list(&self, folder: &FolderPath, recursive: bool) -> Result<Listing, VaultError> {
        self.ensure_available()?;
        Ok(self.metadata.list(folder, recursive).await?)
    }

    pub async fn folder_stats(&self, path: &FolderPath) -> Result<FolderStats, VaultError> {
        self.ensure_available()?;
        Ok(self.metadata.folder_stats(path).await?)
    }

    pub async fn storage_stats(&self) -> Result<StorageStats, VaultError> {
        self.ensure_available()?;
        Ok(self.metadata.storage_stats().await)
    }

    pub async fn get_file(&self, id: &str) -> Result<Option<FileRecord>, VaultError> {
        self.ensure_available()?;
        Ok(self.metadata.get_file(id).await)
    }

    // -----------------------------------------------------------------------
    // Organize
    // -----------------------------------------------------------------------

    pub async fn create_folder(
        &self,
        parent: &FolderPath,
        name: &str,
    ) -> Result<FolderPath, VaultError> {
        self.ensure_available()?;
        Ok(self.metadata.create_folder(parent, name).await?)
    }

    /// Removes the record, then its blobs. Blob deletion is best effort; a
    /// leftover blob only comes back through a rebuild.
    pub async fn delete_file(&self, id: &str) -> Result<FileRecord, VaultError> {
        self.ensure_available()?;
        let record = self.metadata.delete_file(id).await?;
        pipeline::discard(self.store.as_ref(), &record.chunks).await;
        Ok(record)
    }

    /// Deletes several files, collecting failures instead of stopping.
    pub async fn delete_files(&self, ids: &[String]) -> Result<BulkDeleteReport, VaultError> {
        self.ensure_available()?;
        let mut report = BulkDeleteReport::default();
        for id in ids {
            match self.delete_file(id).await {
                Ok(_) => report.deleted += 1,
                Err(e) => {
                    warn!(id = %id, error = %e, "bulk delete: file not deleted");
                    report.failed.push((id.clone(), e.to_string()));
                }
            }
        }
        lock(&self.notifications).bulk_delete_finished(&report);
        Ok(report)
    }

    /// Deletes a folder subtree and the blobs of every file in it.
    pub async fn delete_folder(&self, path: &FolderPath) -> Result<FolderRemoval, VaultError> {
        self.ensure_available()?;
        let removal = self.metadata.delete_folder(path).await?;
        for record in &removal.files {
            pipeline::discard(self.store.as_ref(), &record.chunks).await;
        }
        Ok(removal)
    }

    /// Moves a file to another folder. The chunks are re-uploaded so their
    /// captions name the new folder and a rebuild keeps the file there.
    pub async fn move_file(&self, id: &str, folder: &FolderPath) -> Result<FileRecord, VaultError> {
        self.ensure_available()?;
        migrate::move_to_folder(
            self.store.as_ref(),
            &self.metadata,
            id,
            folder,
            &self.config.default_container,
            self.config.max_chunk_size,
            &self.shutdown,
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Transfers
    // -----------------------------------------------------------------------

    pub async fn enqueue_upload(
        &self,
        source: &Path,
        folder: &FolderPath,
        encrypt: bool,
    ) -> Result<String, VaultError> {
        self.ensure_available()?;
        Ok(self.scheduler.enqueue_upload(source, folder, encrypt).await?)
    }

    pub async fn enqueue_download(
        &self,
        file_id: &str,
        destination: &Path,
    ) -> Result<String, VaultError> {
        self.ensure_available()?;
        Ok(self.scheduler.enqueue_download(file_id, destination).await?)
    }

    /// Queues a download of every file under `folder`, recreating the
    /// subfolder layout below `destination`. Returns the transfer ids.
    pub async fn enqueue_folder_download(
        &self,
        folder: &FolderPath,
        destination: &Path,
    ) -> Result<Vec<String>, VaultError> {
        let listing = self.list(folder, true).await?;
        // Resolve every target first so a bad name queues nothing.
        let targets = listing
            .files
            .iter()
            .map(|record| Ok((record, local_path(destination, folder, record)?)))
            .collect::<Result<Vec<_>, PathError>>()?;
        let mut ids = Vec::with_capacity(targets.len());
        for (record, target) in &targets {
            ids.push(self.scheduler.enqueue_download(&record.id, target).await?);
        }
        info!(folder = %folder, files = ids.len(), "folder download queued");
        Ok(ids)
    }

    /// Snapshot of the transfer queue.
    pub fn transfers(&self) -> Vec<TransferItem> {
        self.scheduler.list()
    }

    /// The queue as rebuilt from events (what a subscriber sees).
    pub fn transfer_board(&self) -> Vec<TransferItem> {
        lock(&self.board).items().to_vec()
    }

    pub fn cancel_transfer(&self, id: &str) -> bool {
        self.scheduler.cancel(id)
    }

    pub fn cancel_all_transfers(&self) -> usize {
        self.scheduler.cancel_all()
    }

    pub fn clear_finished_transfers(&self) -> usize {
        self.scheduler.clear_finished()
    }

    /// Waits until no transfer is pending or active.
    pub async fn wait_for_transfers(&self) {
        self.scheduler.wait_idle().await;
    }

    /// Takes the transfer event stream. Can only be called once.
    pub fn take_transfer_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    // -----------------------------------------------------------------------
    // Recovery and migration
    // -----------------------------------------------------------------------

    /// Rebuilds the metadata document from blob captions and unblocks the
    /// vault.
    pub async fn rebuild_metadata(&self) -> Result<RebuildReport, VaultError> {
        let report = reconcile::rebuild(self.store.as_ref(), &self.metadata).await?;
        self.blocked.store(false, Ordering::SeqCst);
        lock(&self.notifications).rebuild_finished(&report);
        Ok(report)
    }

    /// Gives up on the unreadable document and starts from an empty one.
    pub async fn decline_rebuild(&self) -> Result<(), VaultError> {
        if !self.is_blocked() {
            return Ok(());
        }
        self.metadata.replace(MetadataDocument::default()).await?;
        self.blocked.store(false, Ordering::SeqCst);
        warn!("rebuild declined, starting from an empty document");
        Ok(())
    }

    /// Moves files into their folders' containers.
    pub async fn migrate_to_folder_containers(
        &self,
        progress: Option<mpsc::Sender<MigrationProgress>>,
    ) -> Result<MigrationReport, VaultError> {
        self.ensure_available()?;
        let report = migrate::migrate_to_folder_containers(
            self.store.clone(),
            &self.metadata,
            &self.config.default_container,
            self.config.max_chunk_size,
            progress,
            &self.shutdown,
        )
        .await;
        lock(&self.notifications).migration_finished(&report);
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Thumbnails
    // -----------------------------------------------------------------------

    /// Queues previews for the images directly inside `folder`.
    pub async fn prefetch_thumbnails(&self, folder: &FolderPath) -> Result<usize, VaultError> {
        let listing = self.list(folder, false).await?;
        let images = listing
            .files
            .into_iter()
            .filter(|f| f.mime_type.starts_with("image/"));
        Ok(self.prefetcher.prefetch(images))
    }

    pub async fn wait_for_thumbnails(&self) {
        self.prefetcher.wait_idle().await;
    }

    /// Preview bytes of a file, from the cache or fetched on demand.
    pub async fn thumbnail(&self, id: &str) -> Result<Option<Vec<u8>>, VaultError> {
        let Some(record) = self.get_file(id).await? else {
            return Err(MetadataError::NotFound(format!("file {id}")).into());
        };
        if let Some(cached) = self.thumbnail_cache.get(&record).await? {
            return Ok(Some(cached));
        }
        let Some(data) = self.preview.fetch(&record).await? else {
            return Ok(None);
        };
        if let Err(e) = self.thumbnail_cache.put(&record, &data).await {
            debug!(file = %record.name, error = %e, "could not cache thumbnail");
        }
        Ok(Some(data))
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.notifications).iter().cloned().collect()
    }

    pub fn dismiss_notification(&self, id: u64) -> bool {
        lock(&self.notifications).dismiss(id)
    }

    /// Removes and returns every pending notification.
    pub fn take_notifications(&self) -> Vec<Notification> {
        lock(&self.notifications).drain()
    }

    /// Stops transfers, prefetch workers and any running migration.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.scheduler.shutdown();
        self.prefetcher.shutdown();
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        self.shutdown();
        self.forwarder.abort();
    }
}

/// Local path for `record` when downloading the subtree at `root`.
///
/// Every pushed segment must be a plain name, so the result always stays
/// under `destination`.
fn local_path(
    destination: &Path,
    root: &FolderPath,
    record: &FileRecord,
) -> Result<PathBuf, PathError> {
    let relative = record
        .folder
        .as_str()
        .strip_prefix(root.as_str())
        .unwrap_or_default();
    let mut path = destination.to_path_buf();
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        push_name(&mut path, segment)?;
    }
    push_name(&mut path, &record.name)?;
    Ok(path)
}

fn push_name(path: &mut PathBuf, name: &str) -> Result<(), PathError> {
    validate_name(name)?;
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {
            path.push(name);
            Ok(())
        }
        _ => Err(PathError::InvalidName(name.to_string())),
    }
}

/// Keeps the board current, raises a notification per failed item and
/// passes every event on to the vault's subscriber.
async fn forward_events(
    mut rx: mpsc::Receiver<TransferEvent>,
    board: Arc<Mutex<TransferBoard>>,
    notifications: Arc<Mutex<NotificationQueue>>,
    tx: mpsc::Sender<TransferEvent>,
) {
    while let Some(event) = rx.recv().await {
        let failure = match &event {
            TransferEvent::Progress(p) if p.status == ProgressStatus::Error => {
                Some((p.id.clone(), p.error.clone().unwrap_or_default()))
            }
            _ => None,
        };

        let name = {
            let mut board = lock(&board);
            board.apply(event.clone());
            failure
                .as_ref()
                .and_then(|(id, _)| board.get(id).map(|i| i.name.clone()))
        };
        if let (Some((_, error)), Some(name)) = (failure, name) {
            lock(&notifications).transfer_failed(&name, &error);
        }

        if tx.try_send(event).is_err() {
            debug!("vault transfer event dropped");
        }
    }
}
