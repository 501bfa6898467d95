//! Migration of files into per-folder containers.
//!
//! Each file is moved on its own: fetch the stored bytes, re-chunk them
//! into the target container, point the record at the new blobs and only
//! then delete the old ones. A file that fails anywhere before the record
//! is updated keeps its original chunks, and any blobs already written for
//! it are removed again.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tvault_blob_store::BlobStore;
use tvault_metadata::{MetadataError, MetadataStore};
use tvault_protocol::{
    BlobHandle, ChunkDescriptor, FileRecord, FolderPath, MigrationProgress, percent,
};
use tvault_scheduler::SchedulerError;
use tvault_scheduler::pipeline::{self, descriptor_for, effective_chunk_size};
use tvault_transfer::ChunkReader;

use crate::error::VaultError;

/// Prefix of per-folder container names.
const FOLDER_CONTAINER_PREFIX: &str = "folder:";

/// Outcome of a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub migrated: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl MigrationReport {
    pub fn total(&self) -> usize {
        self.migrated + self.failed + self.skipped
    }
}

/// Container that files in `folder` belong to.
///
/// Root stays in the default container.
pub fn target_container(folder: &FolderPath, default_container: &str) -> String {
    if folder.is_root() {
        default_container.to_string()
    } else {
        format!("{FOLDER_CONTAINER_PREFIX}{folder}")
    }
}

/// Moves every file that is not in its folder's container.
///
/// A cancelled run stops before the next file and reports what it did so
/// far. The file being moved when cancellation is observed counts as failed.
pub async fn migrate_to_folder_containers(
    store: Arc<dyn BlobStore>,
    metadata: &MetadataStore,
    default_container: &str,
    max_chunk_size: u64,
    progress: Option<mpsc::Sender<MigrationProgress>>,
    cancel: &CancellationToken,
) -> MigrationReport {
    let files = metadata.files().await;
    let total = files.len();
    let chunk_size = effective_chunk_size(max_chunk_size, store.max_blob_size());
    let mut report = MigrationReport::default();

    info!(files = total, "migration started");

    for (index, record) in files.iter().enumerate() {
        if cancel.is_cancelled() {
            info!(done = index, total, "migration cancelled");
            break;
        }

        if let Some(tx) = &progress {
            let update = MigrationProgress {
                current: index + 1,
                total,
                file: record.name.clone(),
                progress: percent(index as u64, total as u64),
            };
            if tx.send(update).await.is_err() {
                debug!("migration progress receiver dropped");
            }
        }

        let target = target_container(&record.folder, default_container);
        if record.chunks.iter().all(|h| h.container == target) {
            report.skipped += 1;
            continue;
        }

        match move_file(store.as_ref(), metadata, record, &target, chunk_size, cancel).await {
            Ok(()) => {
                info!(file = %record.name, container = %target, "file migrated");
                report.migrated += 1;
            }
            Err(e) => {
                warn!(file = %record.name, error = %e, "migration failed, file left in place");
                report.failed += 1;
            }
        }
    }

    info!(
        migrated = report.migrated,
        failed = report.failed,
        skipped = report.skipped,
        "migration finished"
    );
    report
}

/// Moves a file to `folder`, re-uploading its chunks so their captions
/// carry the new folder and a bumped revision.
///
/// A file sitting in its old folder's container follows it into the new
/// folder's container; any other file keeps its container. Files without
/// chunks only change in metadata. If anything fails before the record is
/// updated, the file keeps its folder and chunks.
pub async fn move_to_folder(
    store: &dyn BlobStore,
    metadata: &MetadataStore,
    id: &str,
    folder: &FolderPath,
    default_container: &str,
    max_chunk_size: u64,
    cancel: &CancellationToken,
) -> Result<FileRecord, VaultError> {
    let record = metadata
        .get_file(id)
        .await
        .ok_or_else(|| MetadataError::NotFound(format!("file {id}")))?;
    if !metadata.contains_folder(folder).await {
        return Err(MetadataError::NotFound(format!("folder {folder}")).into());
    }
    if &record.folder == folder {
        return Ok(record);
    }
    if record.chunks.is_empty() {
        return Ok(metadata.move_file(id, folder).await?);
    }

    let old_target = target_container(&record.folder, default_container);
    let container = if record.chunks.iter().all(|h| h.container == old_target) {
        target_container(folder, default_container)
    } else {
        record.chunks[0].container.clone()
    };

    // 1. Copy the chunks under captions naming the new folder
    let revision = record.revision.saturating_add(1);
    let template = ChunkDescriptor {
        folder: folder.clone(),
        revision,
        ..descriptor_for(&record)
    };
    let chunk_size = effective_chunk_size(max_chunk_size, store.max_blob_size());
    let stored = copy_chunks(store, &record, &template, &container, chunk_size, cancel).await?;

    // 2. Move the record onto the copies
    let moved = match metadata.move_and_relocate(id, folder, stored.clone(), revision).await {
        Ok(moved) => moved,
        Err(e) => {
            pipeline::discard(store, &stored).await;
            return Err(e.into());
        }
    };

    // 3. Drop the originals
    pipeline::discard(store, &record.chunks).await;
    debug!(
        file = %moved.name,
        container = %container,
        revision = moved.revision,
        "chunks re-captioned"
    );
    Ok(moved)
}

async fn move_file(
    store: &dyn BlobStore,
    metadata: &MetadataStore,
    record: &FileRecord,
    target: &str,
    chunk_size: u64,
    cancel: &CancellationToken,
) -> Result<(), SchedulerError> {
    // 1. Copy the chunks into the target container
    let template = descriptor_for(record);
    let stored = copy_chunks(store, record, &template, target, chunk_size, cancel).await?;

    // 2. Point the record at the new blobs
    if let Err(e) = metadata.relocate_file(&record.id, stored.clone()).await {
        pipeline::discard(store, &stored).await;
        return Err(e.into());
    }

    // 3. Drop the originals
    pipeline::discard(store, &record.chunks).await;
    Ok(())
}

/// Re-chunks the stored bytes of `record` into `container` with `template`
/// as caption. Blobs already written are removed again on failure.
async fn copy_chunks(
    store: &dyn BlobStore,
    record: &FileRecord,
    template: &ChunkDescriptor,
    container: &str,
    chunk_size: u64,
    cancel: &CancellationToken,
) -> Result<Vec<BlobHandle>, SchedulerError> {
    // Stored bytes as they are; encrypted files stay encrypted.
    let data = pipeline::fetch_stored(store, record, cancel, |_| {}).await?;
    let reader = ChunkReader::from_bytes(data, chunk_size)?;
    let mut stored: Vec<BlobHandle> = Vec::new();
    let uploaded =
        pipeline::upload_chunks(store, container, template, reader, cancel, &mut stored, |_| {})
            .await;
    if let Err(e) = uploaded {
        pipeline::discard(store, &stored).await;
        return Err(e);
    }
    Ok(stored)
}
