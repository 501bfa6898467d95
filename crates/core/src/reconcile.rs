//! Reconciliation: rebuilding the metadata document from blob captions.
//!
//! Every chunk blob carries a [`ChunkDescriptor`] in its caption, so the
//! file set can be recovered from the store alone. Groups with missing or
//! conflicting chunks are reported and left out; nothing is reconstructed
//! partially.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Map;
use tracing::{debug, info, warn};
use tvault_blob_store::{BlobEntry, BlobStore, BlobStoreError};
use tvault_metadata::{FolderTree, MetadataStore};
use tvault_protocol::{
    CURRENT_VERSION, ChunkDescriptor, FileRecord, MetadataDocument, validate_name,
};

use crate::error::VaultError;
use crate::migrate::target_container;

/// Why a chunk group was left out of a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteReason {
    /// Some index in `0..total` has no blob.
    MissingChunks,
    /// Some index has more than one blob.
    DuplicateChunks,
    /// Descriptors disagree, an index is out of range, or the blob sizes do
    /// not add up to the declared size.
    Inconsistent,
    /// The file name is not a single plain path segment.
    InvalidName,
}

/// A file whose chunks could not be assembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncompleteFile {
    pub file_id: String,
    pub name: String,
    pub container: String,
    pub total: u32,
    /// Blobs found for the file.
    pub present: usize,
    pub reason: IncompleteReason,
}

/// Outcome of a rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub discovered: usize,
    pub incomplete: Vec<IncompleteFile>,
    /// Blobs without a descriptor, plus redundant copies of files that were
    /// found complete in more than one container.
    pub ignored_blobs: usize,
}

/// Blobs of one `(container, file_id, revision)` group.
type Group = Vec<(ChunkDescriptor, BlobEntry)>;

/// Scans every container except `metadata_container` and assembles the
/// complete files found there.
///
/// Records come back ordered by creation time, then container and id.
pub async fn scan(
    store: &dyn BlobStore,
    metadata_container: &str,
    default_container: &str,
) -> Result<(Vec<FileRecord>, RebuildReport), BlobStoreError> {
    let mut report = RebuildReport::default();
    let mut groups: BTreeMap<(String, String, u32), Group> = BTreeMap::new();

    let containers: BTreeSet<String> = store.containers().await?.into_iter().collect();
    for container in containers.iter().filter(|c| *c != metadata_container) {
        let entries = store.list(container).await?;
        debug!(container = %container, blobs = entries.len(), "scanning container");
        for entry in entries {
            match ChunkDescriptor::parse(&entry.caption) {
                Some(descriptor) => groups
                    .entry((
                        container.clone(),
                        descriptor.file_id.clone(),
                        descriptor.revision,
                    ))
                    .or_default()
                    .push((descriptor, entry)),
                None => report.ignored_blobs += 1,
            }
        }
    }

    // Complete copies per file id, in container order.
    let mut complete: BTreeMap<String, Vec<FileRecord>> = BTreeMap::new();
    for ((container, file_id, _), group) in groups {
        match assemble(group) {
            Ok(record) => complete.entry(file_id).or_default().push(record),
            Err(incomplete) => {
                warn!(
                    file = %incomplete.name,
                    file_id = %file_id,
                    container = %container,
                    present = incomplete.present,
                    total = incomplete.total,
                    reason = ?incomplete.reason,
                    "skipping incomplete file"
                );
                report.incomplete.push(incomplete);
            }
        }
    }

    let mut records = Vec::with_capacity(complete.len());
    for (file_id, mut copies) in complete {
        let keep = pick_copy(&copies, default_container);
        let record = copies.swap_remove(keep);
        for redundant in &copies {
            debug!(
                file_id = %file_id,
                container = ?redundant.container(),
                "ignoring redundant copy"
            );
            report.ignored_blobs += redundant.chunks.len();
        }
        records.push(record);
    }

    records.sort_by(|a, b| {
        (a.created_at, a.container(), &a.id).cmp(&(b.created_at, b.container(), &b.id))
    });
    report.discovered = records.len();
    Ok((records, report))
}

/// Index of the copy to keep: the highest revision, preferring the copy in
/// its folder's container, then the first container in name order.
fn pick_copy(copies: &[FileRecord], default_container: &str) -> usize {
    let newest = copies.iter().map(|r| r.revision).max().unwrap_or_default();
    let in_target = copies.iter().position(|r| {
        r.revision == newest
            && r.container() == Some(target_container(&r.folder, default_container).as_str())
    });
    in_target
        .or_else(|| copies.iter().position(|r| r.revision == newest))
        .unwrap_or_default()
}

/// Validates one group and turns it into a record.
fn assemble(mut group: Group) -> Result<FileRecord, IncompleteFile> {
    group.sort_by(|a, b| (a.0.index, &a.1.handle).cmp(&(b.0.index, &b.1.handle)));

    let (first, first_entry) = &group[0];
    let incomplete = |reason| IncompleteFile {
        file_id: first.file_id.clone(),
        name: first.name.clone(),
        container: first_entry.handle.container.clone(),
        total: first.total,
        present: group.len(),
        reason,
    };

    let consistent = group.iter().all(|(d, _)| {
        d.size == first.size
            && d.name == first.name
            && d.total == first.total
            && d.encrypted == first.encrypted
    });
    if first.total == 0 || !consistent || group.iter().any(|(d, _)| d.index >= first.total) {
        return Err(incomplete(IncompleteReason::Inconsistent));
    }
    if validate_name(&first.name).is_err() {
        return Err(incomplete(IncompleteReason::InvalidName));
    }
    if group.windows(2).any(|w| w[0].0.index == w[1].0.index) {
        return Err(incomplete(IncompleteReason::DuplicateChunks));
    }
    if group.len() != first.total as usize {
        return Err(incomplete(IncompleteReason::MissingChunks));
    }
    // Encrypted payloads differ in length from the plain size.
    if !first.encrypted && group.iter().map(|(_, e)| e.size).sum::<u64>() != first.size {
        return Err(incomplete(IncompleteReason::Inconsistent));
    }

    Ok(FileRecord {
        id: first.file_id.clone(),
        name: first.name.clone(),
        size: first.size,
        folder: first.folder.clone(),
        mime_type: first.mime_type.clone(),
        created_at: first.created_at,
        chunks: group.iter().map(|(_, e)| e.handle.clone()).collect(),
        encrypted: first.encrypted,
        revision: first.revision,
        extra: Map::new(),
    })
}

/// Rebuilds the metadata document from the store and replaces the current
/// one with it.
///
/// Folders that held no files are not recoverable and disappear.
pub async fn rebuild(
    store: &dyn BlobStore,
    metadata: &MetadataStore,
) -> Result<RebuildReport, VaultError> {
    let config = metadata.config();
    let (files, report) = scan(store, &config.container, &config.default_container).await?;

    let tree = FolderTree::from_paths(files.iter().map(|f| &f.folder));
    let doc = MetadataDocument {
        version: CURRENT_VERSION.into(),
        folders: tree.iter().cloned().collect(),
        files,
        extra: Map::new(),
    };
    metadata.replace(doc).await?;

    info!(
        discovered = report.discovered,
        incomplete = report.incomplete.len(),
        ignored = report.ignored_blobs,
        "metadata rebuilt"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tvault_blob_store::MemoryStore;
    use tvault_metadata::MetadataConfig;
    use tvault_protocol::FolderPath;

    fn descriptor(id: &str, folder: &str, size: u64, total: u32) -> ChunkDescriptor {
        ChunkDescriptor {
            file_id: id.into(),
            name: format!("{id}.bin"),
            size,
            index: 0,
            total,
            mime_type: "application/octet-stream".into(),
            folder: FolderPath::parse(folder).unwrap(),
            created_at: 10,
            encrypted: false,
            revision: 0,
        }
    }

    /// Puts the listed chunk indices of a file whose chunks are 2 bytes each.
    fn put_chunks(store: &MemoryStore, container: &str, d: &ChunkDescriptor, indices: &[u32]) {
        for &index in indices {
            let caption = ChunkDescriptor { index, ..d.clone() }.to_caption().unwrap();
            let len = (d.size - u64::from(index) * 2).min(2) as usize;
            store.insert_raw(container, vec![index as u8; len], &caption);
        }
    }

    fn metadata_for(store: &Arc<MemoryStore>) -> MetadataStore {
        MetadataStore::new(store.clone(), MetadataConfig::default())
    }

    #[tokio::test]
    async fn rebuild_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        put_chunks(&store, "inbox", &descriptor("a", "/Photos/2024", 5, 3), &[2, 0, 1]);
        put_chunks(&store, "folder:/Docs", &descriptor("b", "/Docs", 2, 1), &[0]);
        store.insert_raw("inbox", b"not ours".to_vec(), "📁 Holiday");

        let metadata = metadata_for(&store);
        let first = rebuild(store.as_ref(), &metadata).await.unwrap();
        let files_first = metadata.files().await;
        let second = rebuild(store.as_ref(), &metadata).await.unwrap();
        let files_second = metadata.files().await;

        assert_eq!(first, second);
        assert_eq!(first.discovered, 2);
        assert_eq!(first.ignored_blobs, 1);
        assert_eq!(files_first, files_second);

        let a = metadata.get_file("a").await.unwrap();
        let indices: Vec<u64> = a.chunks.iter().map(|h| h.id).collect();
        assert_eq!(indices, vec![2, 3, 1], "chunks follow descriptor index order");
        assert!(metadata.contains_folder(&FolderPath::parse("/Photos").unwrap()).await);
        assert!(metadata.contains_folder(&FolderPath::parse("/Photos/2024").unwrap()).await);
    }

    #[tokio::test]
    async fn missing_chunk_is_reported_not_rebuilt() {
        let store = Arc::new(MemoryStore::new());
        put_chunks(&store, "inbox", &descriptor("gap", "/", 6, 3), &[0, 2]);
        put_chunks(&store, "inbox", &descriptor("ok", "/", 2, 1), &[0]);

        let metadata = metadata_for(&store);
        let report = rebuild(store.as_ref(), &metadata).await.unwrap();

        assert_eq!(report.discovered, 1);
        assert_eq!(
            report.incomplete,
            vec![IncompleteFile {
                file_id: "gap".into(),
                name: "gap.bin".into(),
                container: "inbox".into(),
                total: 3,
                present: 2,
                reason: IncompleteReason::MissingChunks,
            }]
        );
        assert!(metadata.get_file("gap").await.is_none());
        assert!(metadata.get_file("ok").await.is_some());
    }

    #[tokio::test]
    async fn duplicate_and_inconsistent_groups_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        put_chunks(&store, "inbox", &descriptor("dup", "/", 2, 1), &[0, 0]);
        // Declared 9 bytes, stored 2.
        put_chunks(&store, "inbox", &descriptor("short", "/", 2, 1), &[0]);
        let caption = ChunkDescriptor {
            size: 9,
            ..descriptor("short", "/", 2, 1)
        };
        put_chunks(&store, "other", &caption, &[0]);

        let (files, report) = scan(store.as_ref(), "metadata", "inbox").await.unwrap();
        let reasons: Vec<_> = report
            .incomplete
            .iter()
            .map(|i| (i.file_id.as_str(), i.container.as_str(), i.reason))
            .collect();
        assert_eq!(
            reasons,
            vec![
                ("dup", "inbox", IncompleteReason::DuplicateChunks),
                ("short", "other", IncompleteReason::Inconsistent),
            ]
        );
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].container(), Some("inbox"));
    }

    #[tokio::test]
    async fn names_that_escape_their_folder_are_not_rebuilt() {
        let store = Arc::new(MemoryStore::new());
        for (id, name) in [("up", "../escaped.txt"), ("abs", "/etc/passwd")] {
            let d = ChunkDescriptor {
                name: name.into(),
                ..descriptor(id, "/A", 2, 1)
            };
            put_chunks(&store, "inbox", &d, &[0]);
        }
        put_chunks(&store, "inbox", &descriptor("ok", "/A", 2, 1), &[0]);

        let (files, report) = scan(store.as_ref(), "metadata", "inbox").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].id, "ok");
        let reasons: Vec<_> = report
            .incomplete
            .iter()
            .map(|i| (i.file_id.as_str(), i.reason))
            .collect();
        assert_eq!(
            reasons,
            vec![
                ("abs", IncompleteReason::InvalidName),
                ("up", IncompleteReason::InvalidName),
            ]
        );
    }

    #[tokio::test]
    async fn copy_in_target_container_wins() {
        let store = Arc::new(MemoryStore::new());
        let d = descriptor("a", "/Photos", 2, 1);
        put_chunks(&store, "inbox", &d, &[0]);
        put_chunks(&store, "folder:/Photos", &d, &[0]);

        let (files, report) = scan(store.as_ref(), "metadata", "inbox").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].container(), Some("folder:/Photos"));
        assert_eq!(report.ignored_blobs, 1);
    }

    #[tokio::test]
    async fn newest_revision_wins_over_leftover_copies() {
        let store = Arc::new(MemoryStore::new());
        // Moved inside the inbox; the old blob was never cleaned up.
        let old = descriptor("a", "/A", 2, 1);
        put_chunks(&store, "inbox", &old, &[0]);
        let moved = ChunkDescriptor {
            folder: FolderPath::parse("/B").unwrap(),
            revision: 1,
            ..old
        };
        put_chunks(&store, "inbox", &moved, &[0]);
        // Moved between folder containers.
        let old = descriptor("b", "/A", 2, 1);
        put_chunks(&store, "folder:/A", &old, &[0]);
        let moved = ChunkDescriptor {
            folder: FolderPath::parse("/C").unwrap(),
            revision: 3,
            ..old
        };
        put_chunks(&store, "folder:/C", &moved, &[0]);

        let (files, report) = scan(store.as_ref(), "metadata", "inbox").await.unwrap();
        let placed: Vec<_> = files
            .iter()
            .map(|f| (f.id.as_str(), f.folder.as_str(), f.revision))
            .collect();
        assert_eq!(placed, vec![("b", "/C", 3), ("a", "/B", 1)]);
        assert_eq!(report.ignored_blobs, 2);
        assert!(report.incomplete.is_empty());
    }

    #[tokio::test]
    async fn rebuild_replaces_existing_metadata() {
        let store = Arc::new(MemoryStore::new());
        let metadata = metadata_for(&store);
        metadata
            .create_folder(&FolderPath::root(), "Empty")
            .await
            .unwrap();
        put_chunks(&store, "inbox", &descriptor("a", "/", 2, 1), &[0]);

        rebuild(store.as_ref(), &metadata).await.unwrap();

        assert!(!metadata.contains_folder(&FolderPath::parse("/Empty").unwrap()).await);
        assert_eq!(metadata.files().await.len(), 1);
        assert_eq!(store.blob_count("metadata"), 1);
    }
}
