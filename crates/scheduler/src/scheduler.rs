//! Transfer queue driver.
//!
//! A single driver task owns the decision of what runs. Each pass takes a
//! snapshot of the queue, asks [`advance`] what to do and, on
//! [`Step::Start`], marks the item active and spawns its job. Jobs run as
//! their own tasks with their own [`CancellationToken`]; removing an item
//! cancels the token and wakes the driver, which can start the next item
//! straight away even if the removed job is still finishing a chunk.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Map;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tvault_blob_store::BlobStore;
use tvault_metadata::MetadataStore;
use tvault_protocol::{
    ChunkDescriptor, FileRecord, FolderPath, ProgressStatus, TransferKind, TransferProgress,
    TransferStatus, percent,
};
use tvault_transfer::{ChunkReader, ContentTransform, DEFAULT_MAX_CHUNK_SIZE};

use crate::error::SchedulerError;
use crate::fsm::{Step, advance};
use crate::pipeline;
use crate::types::{TransferEvent, TransferItem, TransferJob};

/// Default capacity of the event channel.
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Container new uploads are stored in.
    pub default_container: String,
    /// Upper bound for chunk size; the backend limit applies on top.
    pub max_chunk_size: u64,
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_container: "inbox".into(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

#[derive(Default)]
struct Queue {
    items: Vec<TransferItem>,
    cancels: HashMap<String, CancellationToken>,
}

struct Shared {
    queue: Mutex<Queue>,
    /// Wakes the driver.
    wake: Notify,
    /// Signalled whenever an item settles or leaves the queue.
    changed: Notify,
    store: Arc<dyn BlobStore>,
    metadata: Arc<MetadataStore>,
    transform: Arc<dyn ContentTransform>,
    config: SchedulerConfig,
    events: mpsc::Sender<TransferEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes an event without waiting. Progress is last-writer-wins,
    /// so a full channel only drops intermediate updates.
    fn emit(&self, event: TransferEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!(error = %e, "transfer event dropped");
        }
    }

    fn progress_of(item: &TransferItem, status: ProgressStatus) -> TransferProgress {
        TransferProgress {
            id: item.id.clone(),
            file_id: item.file_id.clone(),
            kind: item.kind,
            status,
            progress: percent(item.current_bytes, item.total_bytes),
            current: item.current_bytes,
            total: item.total_bytes,
            error: item.error.clone(),
        }
    }

    /// Records bytes moved by the active item. Updates for items that are
    /// gone or no longer active are dropped.
    fn report(&self, id: &str, current: u64) {
        let progress = {
            let mut queue = self.lock();
            let Some(item) = queue.items.iter_mut().find(|i| i.id == id) else {
                return;
            };
            if item.status != TransferStatus::Active {
                return;
            }
            item.current_bytes = item.current_bytes.max(current.min(item.total_bytes));
            let status = match item.kind {
                TransferKind::Upload => ProgressStatus::Uploading,
                TransferKind::Download => ProgressStatus::Downloading,
            };
            Self::progress_of(item, status)
        };
        self.emit(TransferEvent::Progress(progress));
    }

    fn set_total(&self, id: &str, total: u64) {
        if let Some(item) = self.lock().items.iter_mut().find(|i| i.id == id) {
            item.total_bytes = total;
        }
    }

    /// Moves a finished job's item to its terminal state.
    fn finish(&self, id: &str, result: Result<Option<String>, SchedulerError>) {
        let progress = {
            let mut queue = self.lock();
            queue.cancels.remove(id);
            let Some(item) = queue.items.iter_mut().find(|i| i.id == id) else {
                debug!(id, "finished transfer was already removed");
                return;
            };
            match result {
                Ok(file_id) => {
                    item.status = TransferStatus::Completed;
                    item.current_bytes = item.total_bytes;
                    if file_id.is_some() {
                        item.file_id = file_id;
                    }
                    info!(id, name = %item.name, "transfer completed");
                    Self::progress_of(item, ProgressStatus::Completed)
                }
                Err(e) => {
                    item.status = TransferStatus::Error;
                    item.error = Some(e.to_string());
                    error!(id, name = %item.name, error = %e, "transfer failed");
                    Self::progress_of(item, ProgressStatus::Error)
                }
            }
        };
        self.emit(TransferEvent::Progress(progress));
        self.changed.notify_waiters();
    }
}

/// Serial transfer queue.
///
/// Must be created inside a tokio runtime; the driver task is spawned on
/// construction and stopped on drop.
pub struct TransferScheduler {
    shared: Arc<Shared>,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
    shutdown: CancellationToken,
    driver: JoinHandle<()>,
}

impl TransferScheduler {
    pub fn new(
        store: Arc<dyn BlobStore>,
        metadata: Arc<MetadataStore>,
        transform: Arc<dyn ContentTransform>,
        config: SchedulerConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wake: Notify::new(),
            changed: Notify::new(),
            store,
            metadata,
            transform,
            config,
            events: events_tx,
        });
        let shutdown = CancellationToken::new();
        let driver = tokio::spawn(drive(shared.clone(), shutdown.clone()));

        Self {
            shared,
            events_rx: Some(events_rx),
            shutdown,
            driver,
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    fn push(&self, item: TransferItem) -> String {
        let id = item.id.clone();
        {
            let mut queue = self.shared.lock();
            queue.cancels.insert(id.clone(), CancellationToken::new());
            queue.items.push(item.clone());
        }
        debug!(id = %id, name = %item.name, kind = ?item.kind, "transfer queued");
        self.shared.emit(TransferEvent::Queued(item));
        self.shared.wake.notify_one();
        id
    }

    /// Queues an upload of a local file into `folder`.
    pub async fn enqueue_upload(
        &self,
        source: &Path,
        folder: &FolderPath,
        encrypt: bool,
    ) -> Result<String, SchedulerError> {
        if !self.shared.metadata.contains_folder(folder).await {
            return Err(SchedulerError::NotFound(format!("folder {folder}")));
        }
        let meta = tokio::fs::metadata(source).await?;
        if !meta.is_file() {
            return Err(SchedulerError::NotFound(format!(
                "{} is not a file",
                source.display()
            )));
        }
        let name = file_name(source)?;
        let item = TransferItem::new(
            name,
            meta.len(),
            TransferJob::Upload {
                source: source.to_path_buf(),
                folder: folder.clone(),
                encrypt,
            },
        );
        Ok(self.push(item))
    }

    /// Queues a download of a stored file to `destination`.
    pub async fn enqueue_download(
        &self,
        file_id: &str,
        destination: &Path,
    ) -> Result<String, SchedulerError> {
        let record = self
            .shared
            .metadata
            .get_file(file_id)
            .await
            .ok_or_else(|| SchedulerError::NotFound(format!("file {file_id}")))?;
        let item = TransferItem::new(
            record.name,
            record.size,
            TransferJob::Download {
                file_id: file_id.to_string(),
                destination: destination.to_path_buf(),
            },
        );
        Ok(self.push(item))
    }

    /// Snapshot of the queue in FIFO order.
    pub fn list(&self) -> Vec<TransferItem> {
        self.shared.lock().items.clone()
    }

    pub fn get(&self, id: &str) -> Option<TransferItem> {
        self.shared.lock().items.iter().find(|i| i.id == id).cloned()
    }

    /// Removes an item. A running job stops before its next chunk.
    ///
    /// Returns `false` if the id is unknown.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = {
            let mut queue = self.shared.lock();
            let before = queue.items.len();
            queue.items.retain(|i| i.id != id);
            if let Some(token) = queue.cancels.remove(id) {
                token.cancel();
            }
            queue.items.len() != before
        };
        if removed {
            info!(id, "transfer cancelled");
            self.after_removal(vec![id.to_string()]);
        }
        removed
    }

    /// Removes every pending and active item. Finished items stay.
    pub fn cancel_all(&self) -> usize {
        let removed: Vec<String> = {
            let mut queue = self.shared.lock();
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut queue.items)
                .into_iter()
                .partition(|i| !i.status.is_terminal());
            queue.items = kept;
            for item in &gone {
                if let Some(token) = queue.cancels.remove(&item.id) {
                    token.cancel();
                }
            }
            gone.into_iter().map(|i| i.id).collect()
        };
        let count = removed.len();
        if count > 0 {
            info!(count, "all transfers cancelled");
            self.after_removal(removed);
        }
        count
    }

    /// Drops completed and failed items.
    pub fn clear_finished(&self) -> usize {
        let removed: Vec<String> = {
            let mut queue = self.shared.lock();
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut queue.items)
                .into_iter()
                .partition(|i| i.status.is_terminal());
            queue.items = kept;
            gone.into_iter().map(|i| i.id).collect()
        };
        let count = removed.len();
        for id in removed {
            self.shared.emit(TransferEvent::Removed { id });
        }
        count
    }

    fn after_removal(&self, ids: Vec<String>) {
        for id in ids {
            self.shared.emit(TransferEvent::Removed { id });
        }
        self.shared.wake.notify_one();
        self.shared.changed.notify_waiters();
    }

    /// `true` when nothing is pending or active.
    pub fn is_idle(&self) -> bool {
        advance(&self.shared.lock().items) == Step::Idle
    }

    /// Waits until nothing is pending or active.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stops the driver and cancels every job.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for token in self.shared.lock().cancels.values() {
            token.cancel();
        }
    }
}

impl Drop for TransferScheduler {
    fn drop(&mut self) {
        self.shutdown();
        self.driver.abort();
    }
}

fn file_name(path: &Path) -> Result<String, SchedulerError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| SchedulerError::NotFound(format!("no file name in {}", path.display())))
}

async fn drive(shared: Arc<Shared>, shutdown: CancellationToken) {
    debug!("transfer driver started");
    loop {
        let step = advance(&shared.lock().items);
        match step {
            Step::Start(id) => {
                start(&shared, &id);
                continue;
            }
            Step::Busy(_) | Step::Idle => {}
        }

        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("transfer driver stopped");
}

fn start(shared: &Arc<Shared>, id: &str) {
    let (job, cancel, progress) = {
        let mut queue = shared.lock();
        let Some(cancel) = queue.cancels.get(id).cloned() else {
            return;
        };
        let Some(item) = queue.items.iter_mut().find(|i| i.id == id) else {
            return;
        };
        item.status = TransferStatus::Active;
        item.error = None;
        (
            item.job.clone(),
            cancel,
            Shared::progress_of(item, ProgressStatus::Starting),
        )
    };
    shared.emit(TransferEvent::Progress(progress));

    let shared = shared.clone();
    let id = id.to_string();
    tokio::spawn(async move {
        let result = run_job(&shared, &id, job, &cancel).await;
        shared.finish(&id, result);
        shared.wake.notify_one();
    });
}

async fn run_job(
    shared: &Shared,
    id: &str,
    job: TransferJob,
    cancel: &CancellationToken,
) -> Result<Option<String>, SchedulerError> {
    match job {
        TransferJob::Upload {
            source,
            folder,
            encrypt,
        } => run_upload(shared, id, &source, folder, encrypt, cancel)
            .await
            .map(Some),
        TransferJob::Download {
            file_id,
            destination,
        } => run_download(shared, id, &file_id, &destination, cancel)
            .await
            .map(|()| None),
    }
}

async fn run_upload(
    shared: &Shared,
    id: &str,
    source: &Path,
    folder: FolderPath,
    encrypt: bool,
    cancel: &CancellationToken,
) -> Result<String, SchedulerError> {
    let store = shared.store.as_ref();
    let chunk_size =
        pipeline::effective_chunk_size(shared.config.max_chunk_size, store.max_blob_size());
    let container = shared.config.default_container.as_str();

    let mut template = ChunkDescriptor {
        file_id: uuid::Uuid::new_v4().to_string(),
        name: file_name(source)?,
        size: 0,
        index: 0,
        total: 0,
        mime_type: mime_guess::from_path(source)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
        folder,
        created_at: chrono::Utc::now().timestamp(),
        encrypted: encrypt,
        revision: 0,
    };

    // 1. Chunk and store
    let mut stored = Vec::new();
    let report = |n| shared.report(id, n);
    let result = if encrypt {
        let plain = tokio::fs::read(source).await?;
        template.size = plain.len() as u64;
        let encoded = shared.transform.encode(plain)?;
        shared.set_total(id, encoded.len() as u64);
        let reader = ChunkReader::from_bytes(encoded, chunk_size)?;
        pipeline::upload_chunks(store, container, &template, reader, cancel, &mut stored, report)
            .await
    } else {
        let reader = pipeline::open_file(source, chunk_size).await?;
        template.size = reader.total_size();
        shared.set_total(id, template.size);
        pipeline::upload_chunks(store, container, &template, reader, cancel, &mut stored, report)
            .await
    };

    if let Err(e) = result.and_then(|()| pipeline::check_cancelled(cancel)) {
        warn!(file = %template.name, stored = stored.len(), "upload aborted, discarding stored chunks");
        pipeline::discard(store, &stored).await;
        return Err(e);
    }

    // 2. Record
    let chunks = stored.len();
    let record = FileRecord {
        id: template.file_id.clone(),
        name: template.name,
        size: template.size,
        folder: template.folder,
        mime_type: template.mime_type,
        created_at: template.created_at,
        chunks: stored,
        encrypted: encrypt,
        revision: 0,
        extra: Map::new(),
    };
    shared
        .metadata
        .add_file(record)
        .await
        .map_err(|source| SchedulerError::RecordNotSaved { chunks, source })?;

    Ok(template.file_id)
}

async fn run_download(
    shared: &Shared,
    id: &str,
    file_id: &str,
    destination: &Path,
    cancel: &CancellationToken,
) -> Result<(), SchedulerError> {
    let record = shared
        .metadata
        .get_file(file_id)
        .await
        .ok_or_else(|| SchedulerError::NotFound(format!("file {file_id}")))?;
    shared.set_total(id, record.size);

    pipeline::download_to(
        shared.store.as_ref(),
        &record,
        shared.transform.as_ref(),
        destination,
        cancel,
        |n| shared.report(id, n),
    )
    .await?;

    info!(file = %record.name, dest = %destination.display(), "download written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use tokio::sync::Semaphore;
    use tvault_blob_store::{BlobEntry, BlobFuture, Fault, MemoryStore};
    use tvault_metadata::MetadataConfig;
    use tvault_protocol::BlobHandle;
    use tvault_transfer::{Passthrough, TransferError};

    /// Holds puts whose caption mentions `gated` until a permit is added.
    struct GatedStore {
        inner: MemoryStore,
        gated: String,
        gate: Semaphore,
        /// Gets a permit each time a gated put starts waiting.
        reached: Semaphore,
    }

    impl GatedStore {
        fn new(inner: MemoryStore, gated: &str) -> Self {
            Self {
                inner,
                gated: gated.into(),
                gate: Semaphore::new(0),
                reached: Semaphore::new(0),
            }
        }
    }

    impl BlobStore for GatedStore {
        fn put<'a>(
            &'a self,
            container: &'a str,
            data: Vec<u8>,
            caption: &'a str,
        ) -> BlobFuture<'a, BlobHandle> {
            Box::pin(async move {
                if caption.contains(&self.gated) {
                    self.reached.add_permits(1);
                    let permit = self.gate.acquire().await.unwrap();
                    permit.forget();
                }
                self.inner.put(container, data, caption).await
            })
        }

        fn get<'a>(&'a self, handle: &'a BlobHandle) -> BlobFuture<'a, Vec<u8>> {
            self.inner.get(handle)
        }

        fn list<'a>(&'a self, container: &'a str) -> BlobFuture<'a, Vec<BlobEntry>> {
            self.inner.list(container)
        }

        fn delete<'a>(&'a self, handle: &'a BlobHandle) -> BlobFuture<'a, ()> {
            self.inner.delete(handle)
        }

        fn containers(&self) -> BlobFuture<'_, Vec<String>> {
            self.inner.containers()
        }

        fn max_blob_size(&self) -> u64 {
            self.inner.max_blob_size()
        }
    }

    /// Flips every byte; enough to prove the transform runs both ways.
    struct Invert;

    impl ContentTransform for Invert {
        fn encode(&self, plain: Vec<u8>) -> Result<Vec<u8>, TransferError> {
            Ok(plain.into_iter().map(|b| !b).collect())
        }

        fn decode(&self, stored: Vec<u8>) -> Result<Vec<u8>, TransferError> {
            self.encode(stored)
        }
    }

    struct Fixture {
        store: Arc<dyn BlobStore>,
        metadata: Arc<MetadataStore>,
        scheduler: TransferScheduler,
        dir: tempfile::TempDir,
    }

    async fn fixture_with(
        store: Arc<dyn BlobStore>,
        transform: Arc<dyn ContentTransform>,
        max_chunk_size: u64,
    ) -> Fixture {
        let metadata = Arc::new(MetadataStore::new(store.clone(), MetadataConfig::default()));
        metadata.load().await.unwrap();
        let scheduler = TransferScheduler::new(
            store.clone(),
            metadata.clone(),
            transform,
            SchedulerConfig {
                max_chunk_size,
                event_buffer: 1024,
                ..SchedulerConfig::default()
            },
        );
        Fixture {
            store,
            metadata,
            scheduler,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    async fn fixture(store: Arc<dyn BlobStore>) -> Fixture {
        fixture_with(store, Arc::new(Passthrough), 4).await
    }

    impl Fixture {
        fn write(&self, name: &str, data: &[u8]) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, data).unwrap();
            path
        }

        async fn upload(&self, name: &str, data: &[u8]) -> String {
            let path = self.write(name, data);
            self.scheduler
                .enqueue_upload(&path, &FolderPath::root(), false)
                .await
                .unwrap()
        }

        async fn settle(&self) {
            tokio::time::timeout(Duration::from_secs(5), self.scheduler.wait_idle())
                .await
                .expect("queue did not drain");
        }

        async fn wait_status(&self, id: &str, status: TransferStatus) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.scheduler.get(id).map(|i| i.status) != Some(status) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("status never reached");
        }
    }

    fn drain(rx: &mut mpsc::Receiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn scaled_five_over_two_upload_makes_three_chunks() {
        let backend = Arc::new(MemoryStore::with_max_blob_size(2_000));
        let mut f = fixture_with(backend.clone(), Arc::new(Passthrough), 2_000).await;
        let mut rx = f.scheduler.take_events().unwrap();

        let data = vec![7u8; 5_000];
        let id = f.upload("big.bin", &data).await;
        f.settle().await;

        let item = f.scheduler.get(&id).unwrap();
        assert_eq!(item.status, TransferStatus::Completed);
        assert_eq!(item.total_bytes, 5_000);
        assert_eq!(item.current_bytes, 5_000);

        let record = f
            .metadata
            .get_file(item.file_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(record.chunks.len(), 3);
        assert_eq!(record.size, 5_000);
        assert_eq!(backend.blob_count("inbox"), 3);

        let statuses: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                TransferEvent::Queued(i) => Some(format!("{:?}", i.status)),
                TransferEvent::Progress(p) => Some(format!("{:?}", p.status)),
                TransferEvent::Removed { .. } => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec!["Pending", "Starting", "Uploading", "Uploading", "Uploading", "Completed"]
        );
    }

    #[tokio::test]
    async fn runs_in_fifo_order_one_at_a_time() {
        let mut f = fixture(Arc::new(MemoryStore::new())).await;
        let mut rx = f.scheduler.take_events().unwrap();

        let a = f.upload("a.txt", b"aaaaaaaaa").await;
        let b = f.upload("b.txt", b"bbbbb").await;
        let c = f.upload("c.txt", b"c").await;
        f.settle().await;

        let mut started = Vec::new();
        let mut running: Option<String> = None;
        for event in drain(&mut rx) {
            let TransferEvent::Progress(p) = event else {
                continue;
            };
            match p.status {
                ProgressStatus::Starting => {
                    assert!(running.is_none(), "two items active at once");
                    running = Some(p.id.clone());
                    started.push(p.id);
                }
                ProgressStatus::Completed | ProgressStatus::Error => {
                    assert_eq!(running.take().as_deref(), Some(p.id.as_str()));
                }
                _ => {}
            }
        }
        assert_eq!(started, vec![a, b, c]);
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let mut f = fixture(Arc::new(MemoryStore::new())).await;
        let mut rx = f.scheduler.take_events().unwrap();

        let id = f.upload("m.bin", &[1u8; 37]).await;
        f.settle().await;

        let currents: Vec<u64> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                TransferEvent::Progress(p) if p.id == id => Some(p.current),
                _ => None,
            })
            .collect();
        assert!(currents.len() > 2);
        assert!(currents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(currents.last(), Some(&37));
    }

    #[tokio::test]
    async fn cancelling_active_item_lets_next_one_run() {
        let gated = Arc::new(GatedStore::new(MemoryStore::new(), "stuck.bin"));
        let f = fixture(gated.clone()).await;

        let stuck = f.upload("stuck.bin", b"0123456789").await;
        let next = f.upload("next.bin", b"abc").await;
        f.wait_status(&stuck, TransferStatus::Active).await;

        assert!(f.scheduler.cancel(&stuck));
        f.settle().await;

        assert!(f.scheduler.get(&stuck).is_none());
        assert_eq!(
            f.scheduler.get(&next).unwrap().status,
            TransferStatus::Completed
        );
        assert_eq!(f.metadata.files().await.len(), 1);
    }

    #[tokio::test]
    async fn cancel_during_last_chunk_leaves_no_file() {
        let gated = Arc::new(GatedStore::new(MemoryStore::new(), "late.bin"));
        let f = fixture(gated.clone()).await;

        let id = f.upload("late.bin", b"abc").await;
        gated.reached.acquire().await.unwrap().forget();

        // The only chunk is already with the store when the cancel lands.
        assert!(f.scheduler.cancel(&id));
        gated.gate.add_permits(1);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stored = gated.inner.put_log().iter().any(|(c, _)| c == "inbox");
                if stored && gated.inner.blob_count("inbox") == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stored chunk was not discarded");

        assert!(f.metadata.files().await.is_empty());
        assert_eq!(gated.inner.blob_count("metadata"), 0);
    }

    #[tokio::test]
    async fn cancel_all_then_new_work_proceeds() {
        let gated = Arc::new(GatedStore::new(MemoryStore::new(), "stuck.bin"));
        let f = fixture(gated).await;

        let stuck = f.upload("stuck.bin", b"0123456789").await;
        f.upload("p1.bin", b"1").await;
        f.upload("p2.bin", b"2").await;
        f.wait_status(&stuck, TransferStatus::Active).await;

        assert_eq!(f.scheduler.cancel_all(), 3);
        assert!(f.scheduler.list().is_empty());

        let fresh = f.upload("fresh.bin", b"fresh").await;
        f.settle().await;
        assert_eq!(
            f.scheduler.get(&fresh).unwrap().status,
            TransferStatus::Completed
        );
    }

    #[tokio::test]
    async fn failed_item_does_not_block_the_queue() {
        let backend = Arc::new(MemoryStore::new());
        let f = fixture(backend.clone()).await;

        // A stored file whose only chunk has vanished.
        let h = backend.insert_raw("inbox", b"gone".to_vec(), "");
        f.metadata
            .add_file(FileRecord {
                id: "ghost".into(),
                name: "ghost.txt".into(),
                size: 4,
                folder: FolderPath::root(),
                mime_type: "text/plain".into(),
                created_at: 0,
                chunks: vec![h.clone()],
                encrypted: false,
                revision: 0,
                extra: Map::new(),
            })
            .await
            .unwrap();
        backend.delete(&h).await.unwrap();

        let dest = f.dir.path().join("ghost.txt");
        let broken = f.scheduler.enqueue_download("ghost", &dest).await.unwrap();
        let fine = f.upload("fine.txt", b"fine").await;
        f.settle().await;

        let broken = f.scheduler.get(&broken).unwrap();
        assert_eq!(broken.status, TransferStatus::Error);
        assert!(broken.error.unwrap().contains("not found"));
        assert_eq!(
            f.scheduler.get(&fine).unwrap().status,
            TransferStatus::Completed
        );
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn upload_then_download_roundtrips() {
        let f = fixture(Arc::new(MemoryStore::new())).await;
        let data: Vec<u8> = (0..=255).collect();

        let up = f.upload("bytes.bin", &data).await;
        f.settle().await;
        let file_id = f.scheduler.get(&up).unwrap().file_id.unwrap();
        assert_eq!(
            f.metadata.get_file(&file_id).await.unwrap().mime_type,
            "application/octet-stream"
        );

        let dest = f.dir.path().join("copy.bin");
        f.scheduler.enqueue_download(&file_id, &dest).await.unwrap();
        f.settle().await;

        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn encrypted_upload_stores_transformed_bytes() {
        let backend = Arc::new(MemoryStore::new());
        let f = fixture_with(backend.clone(), Arc::new(Invert), 1024).await;

        let path = f.write("secret.txt", b"plain text");
        let up = f
            .scheduler
            .enqueue_upload(&path, &FolderPath::root(), true)
            .await
            .unwrap();
        f.settle().await;

        let file_id = f.scheduler.get(&up).unwrap().file_id.unwrap();
        let record = f.metadata.get_file(&file_id).await.unwrap();
        assert!(record.encrypted);
        assert_eq!(record.mime_type, "text/plain");
        let stored = f.store.get(&record.chunks[0]).await.unwrap();
        assert_ne!(stored, b"plain text");

        let dest = f.dir.path().join("secret.out");
        f.scheduler.enqueue_download(&file_id, &dest).await.unwrap();
        f.settle().await;
        assert_eq!(std::fs::read(&dest).unwrap(), b"plain text");
    }

    #[tokio::test]
    async fn record_failure_keeps_chunks_and_points_to_rebuild() {
        let backend = Arc::new(MemoryStore::new());
        let f = fixture(backend.clone()).await;
        // Three chunk puts succeed, the metadata write fails.
        backend.fail_puts_after(3, Fault::Backend("offline".into()));

        let id = f.upload("doc.txt", b"0123456789").await;
        f.settle().await;

        let item = f.scheduler.get(&id).unwrap();
        assert_eq!(item.status, TransferStatus::Error);
        assert!(item.error.unwrap().contains("rebuild"));
        assert_eq!(backend.blob_count("inbox"), 3);
        assert!(f.metadata.files().await.is_empty());
    }

    #[tokio::test]
    async fn failed_chunk_put_discards_earlier_chunks() {
        let backend = Arc::new(MemoryStore::new());
        let f = fixture(backend.clone()).await;
        backend.fail_puts_after(1, Fault::RateLimited);

        let id = f.upload("doc.txt", b"0123456789").await;
        f.settle().await;

        let item = f.scheduler.get(&id).unwrap();
        assert_eq!(item.status, TransferStatus::Error);
        assert!(item.error.unwrap().contains("rate limited"));
        assert_eq!(backend.blob_count("inbox"), 0);
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_targets() {
        let f = fixture(Arc::new(MemoryStore::new())).await;
        let path = f.write("x.txt", b"x");

        assert!(matches!(
            f.scheduler
                .enqueue_upload(&path, &FolderPath::parse("/nope").unwrap(), false)
                .await,
            Err(SchedulerError::NotFound(_))
        ));
        assert!(matches!(
            f.scheduler
                .enqueue_download("missing", &f.dir.path().join("m"))
                .await,
            Err(SchedulerError::NotFound(_))
        ));
        assert!(f.scheduler.list().is_empty());
    }

    #[tokio::test]
    async fn clear_finished_keeps_pending_work() {
        let gated = Arc::new(GatedStore::new(MemoryStore::new(), "stuck.bin"));
        let f = fixture(gated).await;

        let done = f.upload("done.bin", b"d").await;
        f.settle().await;
        let stuck = f.upload("stuck.bin", b"s").await;
        f.wait_status(&stuck, TransferStatus::Active).await;

        assert_eq!(f.scheduler.clear_finished(), 1);
        assert!(f.scheduler.get(&done).is_none());
        assert!(f.scheduler.get(&stuck).is_some());
    }
}
