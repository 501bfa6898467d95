//! Chunk pipelines between local bytes and the blob store.
//!
//! Chunks move one at a time: read, put, report; or get, write, report.
//! Cancellation is checked before every chunk, so a chunk already handed
//! to the store is never interrupted.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tvault_blob_store::BlobStore;
use tvault_protocol::{BlobHandle, ChunkDescriptor, FileRecord};
use tvault_transfer::{ChunkJoiner, ChunkReader, ContentTransform, TransferError};

use crate::error::SchedulerError;

/// Chunk size actually used: the configured size, capped by the backend.
pub fn effective_chunk_size(configured: u64, backend_limit: u64) -> u64 {
    configured.min(backend_limit).max(1)
}

/// Descriptor of chunk 0 of `record`; callers fill in `index` and `total`.
pub fn descriptor_for(record: &FileRecord) -> ChunkDescriptor {
    ChunkDescriptor {
        file_id: record.id.clone(),
        name: record.name.clone(),
        size: record.size,
        index: 0,
        total: 0,
        mime_type: record.mime_type.clone(),
        folder: record.folder.clone(),
        created_at: record.created_at,
        encrypted: record.encrypted,
        revision: record.revision,
    }
}

pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<(), SchedulerError> {
    if cancel.is_cancelled() {
        Err(SchedulerError::Cancelled)
    } else {
        Ok(())
    }
}

/// Runs blocking file work off the async threads.
async fn blocking<T, F>(f: F) -> Result<T, SchedulerError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SchedulerError::Task(format!("task join error: {e}")))
}

/// Opens a local file for chunked reading.
pub async fn open_file(
    path: &Path,
    chunk_size: u64,
) -> Result<ChunkReader<std::fs::File>, SchedulerError> {
    let path = path.to_path_buf();
    Ok(blocking(move || ChunkReader::open(&path, chunk_size)).await??)
}

/// Puts every chunk of `reader` into `container`.
///
/// Each blob gets `template` as caption with its own `index` and the
/// overall `total`. Handles are appended to `stored` as soon as a put
/// succeeds, so on error the caller still knows which blobs exist.
/// `on_chunk` receives the cumulative byte count after each chunk.
pub async fn upload_chunks<R, F>(
    store: &dyn BlobStore,
    container: &str,
    template: &ChunkDescriptor,
    mut reader: ChunkReader<R>,
    cancel: &CancellationToken,
    stored: &mut Vec<BlobHandle>,
    mut on_chunk: F,
) -> Result<(), SchedulerError>
where
    R: Read + Send + 'static,
    F: FnMut(u64),
{
    let chunk_total = reader.chunk_total();
    let total = u32::try_from(chunk_total).map_err(|_| SchedulerError::TooManyChunks(chunk_total))?;

    loop {
        check_cancelled(cancel)?;

        let (back, next) = blocking(move || {
            let chunk = reader.next_chunk();
            (reader, chunk)
        })
        .await?;
        reader = back;
        let Some(chunk) = next? else {
            break;
        };

        let caption = ChunkDescriptor {
            index: chunk.index,
            total,
            ..template.clone()
        }
        .to_caption()?;

        let handle = store.put(container, chunk.data, &caption).await?;
        debug!(
            file = %template.name,
            chunk = chunk.index,
            of = total,
            handle = %handle,
            "chunk stored"
        );
        stored.push(handle);
        on_chunk(reader.offset());
    }

    Ok(())
}

/// Fetches the chunks of `handles` in order into `writer`, checking the
/// running total against `expected_size`.
async fn fetch_into<W>(
    store: &dyn BlobStore,
    handles: &[BlobHandle],
    expected_size: u64,
    writer: W,
    cancel: &CancellationToken,
    mut on_chunk: impl FnMut(u64),
) -> Result<W, SchedulerError>
where
    W: Write + Send + 'static,
{
    let mut joiner = ChunkJoiner::new(writer, expected_size);
    for handle in handles {
        check_cancelled(cancel)?;
        let data = store.get(handle).await?;
        joiner = blocking(move || {
            joiner.push(&data)?;
            Ok::<_, TransferError>(joiner)
        })
        .await??;
        on_chunk(joiner.written());
    }
    Ok(blocking(move || joiner.finish()).await??)
}

/// Fetches the stored bytes of a file without reversing any transform.
///
/// Plain files are checked against the declared size. Encrypted files are
/// checked after decoding, by [`fetch_file`].
pub async fn fetch_stored(
    store: &dyn BlobStore,
    record: &FileRecord,
    cancel: &CancellationToken,
    mut on_chunk: impl FnMut(u64),
) -> Result<Vec<u8>, SchedulerError> {
    if !record.encrypted {
        let capacity = usize::try_from(record.size).unwrap_or(0);
        return fetch_into(
            store,
            &record.chunks,
            record.size,
            Vec::with_capacity(capacity),
            cancel,
            on_chunk,
        )
        .await;
    }

    let mut stored = Vec::new();
    for handle in &record.chunks {
        check_cancelled(cancel)?;
        stored.extend_from_slice(&store.get(handle).await?);
        on_chunk(stored.len() as u64);
    }
    Ok(stored)
}

/// Fetches and decodes a whole file into memory.
pub async fn fetch_file(
    store: &dyn BlobStore,
    record: &FileRecord,
    transform: &dyn ContentTransform,
    cancel: &CancellationToken,
    on_chunk: impl FnMut(u64),
) -> Result<Vec<u8>, SchedulerError> {
    let stored = fetch_stored(store, record, cancel, on_chunk).await?;
    if !record.encrypted {
        return Ok(stored);
    }
    let plain = transform.decode(stored)?;
    if plain.len() as u64 != record.size {
        return Err(TransferError::ChunkMismatch(format!(
            "decoded {} bytes, declared size is {}",
            plain.len(),
            record.size
        ))
        .into());
    }
    Ok(plain)
}

/// `<destination>.part`
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut raw = destination.as_os_str().to_owned();
    raw.push(".part");
    PathBuf::from(raw)
}

/// Downloads a file to `destination`.
///
/// Bytes go to `<destination>.part`, which is renamed into place only once
/// the whole file checked out. A failed download removes the partial file.
pub async fn download_to(
    store: &dyn BlobStore,
    record: &FileRecord,
    transform: &dyn ContentTransform,
    destination: &Path,
    cancel: &CancellationToken,
    on_chunk: impl FnMut(u64),
) -> Result<(), SchedulerError> {
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let part = partial_path(destination);

    let result = async {
        if record.encrypted {
            let plain = fetch_file(store, record, transform, cancel, on_chunk).await?;
            tokio::fs::write(&part, plain).await?;
        } else {
            let file = tokio::fs::File::create(&part).await?.into_std().await;
            let file = fetch_into(store, &record.chunks, record.size, file, cancel, on_chunk).await?;
            blocking(move || file.sync_all()).await??;
        }
        tokio::fs::rename(&part, destination).await?;
        Ok::<_, SchedulerError>(())
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&part).await;
    }
    result
}

/// Deletes blobs, logging instead of failing.
pub async fn discard(store: &dyn BlobStore, handles: &[BlobHandle]) {
    for handle in handles {
        if let Err(e) = store.delete(handle).await {
            warn!(handle = %handle, error = %e, "failed to delete blob");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tvault_blob_store::MemoryStore;
    use tvault_protocol::FolderPath;
    use tvault_transfer::Passthrough;

    fn template(size: u64) -> ChunkDescriptor {
        ChunkDescriptor {
            file_id: "f1".into(),
            name: "data.bin".into(),
            size,
            index: 0,
            total: 0,
            mime_type: "application/octet-stream".into(),
            folder: FolderPath::root(),
            created_at: 1,
            encrypted: false,
            revision: 0,
        }
    }

    fn record_for(template: &ChunkDescriptor, chunks: Vec<BlobHandle>) -> FileRecord {
        FileRecord {
            id: template.file_id.clone(),
            name: template.name.clone(),
            size: template.size,
            folder: template.folder.clone(),
            mime_type: template.mime_type.clone(),
            created_at: template.created_at,
            chunks,
            encrypted: false,
            revision: 0,
            extra: Default::default(),
        }
    }

    #[test]
    fn chunk_size_is_capped_by_backend() {
        assert_eq!(effective_chunk_size(10, 4), 4);
        assert_eq!(effective_chunk_size(3, 4), 3);
        assert_eq!(effective_chunk_size(0, 4), 1);
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/tmp/movie.mkv")),
            PathBuf::from("/tmp/movie.mkv.part")
        );
    }

    #[tokio::test]
    async fn captions_carry_index_and_total() {
        let store = MemoryStore::new();
        let data: Vec<u8> = (0..10).collect();
        let reader = ChunkReader::from_bytes(data, 4).unwrap();
        let mut stored = Vec::new();
        let mut seen = Vec::new();

        upload_chunks(
            &store,
            "inbox",
            &template(10),
            reader,
            &CancellationToken::new(),
            &mut stored,
            |n| seen.push(n),
        )
        .await
        .unwrap();

        assert_eq!(stored.len(), 3);
        assert_eq!(seen, vec![4, 8, 10]);
        let listed = store.list("inbox").await.unwrap();
        let descriptors: Vec<_> = listed
            .iter()
            .map(|e| ChunkDescriptor::parse(&e.caption).unwrap())
            .collect();
        assert_eq!(
            descriptors.iter().map(|d| (d.index, d.total)).collect::<Vec<_>>(),
            vec![(0, 3), (1, 3), (2, 3)]
        );
    }

    #[tokio::test]
    async fn cancelled_upload_stores_nothing() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stored = Vec::new();

        let err = upload_chunks(
            &store,
            "inbox",
            &template(3),
            ChunkReader::from_bytes(vec![1, 2, 3], 2).unwrap(),
            &cancel,
            &mut stored,
            |_| {},
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SchedulerError::Cancelled));
        assert!(stored.is_empty());
        assert_eq!(store.blob_count("inbox"), 0);
    }

    #[tokio::test]
    async fn fetch_detects_size_mismatch() {
        let store = MemoryStore::new();
        let h = store.put("inbox", vec![1, 2, 3], "").await.unwrap();
        let mut record = record_for(&template(5), vec![h]);
        record.size = 5;

        let err = fetch_file(&store, &record, &Passthrough, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Transfer(TransferError::ChunkMismatch(_))
        ));
    }

    #[tokio::test]
    async fn download_writes_file_and_removes_part() {
        let store = MemoryStore::new();
        let h1 = store.put("inbox", b"hello ".to_vec(), "").await.unwrap();
        let h2 = store.put("inbox", b"world".to_vec(), "").await.unwrap();
        let record = record_for(&template(11), vec![h1, h2]);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out").join("greeting.txt");
        download_to(&store, &record, &Passthrough, &dest, &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn failed_download_leaves_no_partial_file() {
        let store = MemoryStore::new();
        let h1 = store.put("inbox", b"hello ".to_vec(), "").await.unwrap();
        let missing = BlobHandle::new("inbox", 99);
        let record = record_for(&template(11), vec![h1, missing]);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("greeting.txt");
        let err = download_to(&store, &record, &Passthrough, &dest, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulerError::Store(_)));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }
}
