//! Single-writer metadata store.
//!
//! Every mutation clones the in-memory catalog, applies the change, writes
//! the full document as a new blob and only then swaps the catalog in. A
//! failure at any step leaves the previous state untouched.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tvault_blob_store::BlobStore;
use tvault_protocol::{
    BlobHandle, CURRENT_VERSION, FileRecord, FolderPath, METADATA_TAG, MetadataDocument,
    validate_name,
};

use crate::error::MetadataError;
use crate::folder_tree::FolderTree;

/// Where the document lives and how legacy entries are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataConfig {
    /// Container holding the tagged document blobs.
    pub container: String,
    /// Container assumed for legacy single-message files.
    pub default_container: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            container: "metadata".into(),
            default_container: "inbox".into(),
        }
    }
}

/// Result of [`MetadataStore::list`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct Listing {
    pub folders: Vec<FolderPath>,
    pub files: Vec<FileRecord>,
}

/// Aggregate size of a folder subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FolderStats {
    pub file_count: usize,
    pub total_size: u64,
}

/// Totals across the whole store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub total_files: usize,
    pub total_size: u64,
    pub folder_count: usize,
}

/// What a folder deletion removed.
#[derive(Debug, Clone, Default)]
pub struct FolderRemoval {
    pub folders: Vec<FolderPath>,
    pub files: Vec<FileRecord>,
}

#[derive(Debug, Clone)]
struct Catalog {
    version: String,
    tree: FolderTree,
    files: Vec<FileRecord>,
    extra: Map<String, Value>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION.into(),
            tree: FolderTree::new(),
            files: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl Catalog {
    fn from_document(doc: MetadataDocument) -> Result<Self, MetadataError> {
        let mut tree = FolderTree::from_paths(&doc.folders);
        let mut seen = std::collections::HashSet::new();
        for file in &doc.files {
            if !seen.insert(file.id.as_str()) {
                return Err(MetadataError::MetadataCorrupt(format!(
                    "file id {} appears more than once",
                    file.id
                )));
            }
            for added in tree.insert(file.folder.clone()) {
                debug!(folder = %added, "restored folder referenced by a file");
            }
        }
        Ok(Self {
            version: doc.version,
            tree,
            files: doc.files,
            extra: doc.extra,
        })
    }

    fn to_document(&self) -> MetadataDocument {
        MetadataDocument {
            version: self.version.clone(),
            folders: self.tree.iter().cloned().collect(),
            files: self.files.clone(),
            extra: self.extra.clone(),
        }
    }

    fn position(&self, id: &str) -> Result<usize, MetadataError> {
        self.files
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| MetadataError::NotFound(format!("file {id}")))
    }

    fn require_folder(&self, path: &FolderPath) -> Result<(), MetadataError> {
        if self.tree.contains(path) {
            Ok(())
        } else {
            Err(MetadataError::NotFound(format!("folder {path}")))
        }
    }
}

#[derive(Default)]
struct State {
    catalog: Catalog,
    /// Blob holding the currently persisted document.
    current: Option<BlobHandle>,
    /// Superseded or unreadable document blobs, deleted after the next write.
    stale: Vec<BlobHandle>,
}

/// The metadata store.
pub struct MetadataStore {
    store: Arc<dyn BlobStore>,
    config: MetadataConfig,
    state: Mutex<State>,
}

impl MetadataStore {
    /// Creates a store holding an empty document. Call [`load`](Self::load)
    /// to read the persisted one.
    pub fn new(store: Arc<dyn BlobStore>, config: MetadataConfig) -> Self {
        Self {
            store,
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &MetadataConfig {
        &self.config
    }

    /// Reads the newest tagged document from the metadata container.
    ///
    /// An empty container yields an empty document. A document that cannot
    /// be parsed fails with [`MetadataError::MetadataCorrupt`]; the in-memory
    /// state is then empty and the unreadable blob is cleaned up by the next
    /// successful write.
    pub async fn load(&self) -> Result<(), MetadataError> {
        let mut state = self.state.lock().await;

        let entries = self.store.list(&self.config.container).await?;
        let mut tagged: Vec<BlobHandle> = entries
            .into_iter()
            .filter(|e| e.caption.trim() == METADATA_TAG)
            .map(|e| e.handle)
            .collect();

        let Some(latest) = tagged.pop() else {
            info!(container = %self.config.container, "no metadata document yet, starting empty");
            *state = State::default();
            return Ok(());
        };

        let bytes = self.store.get(&latest).await?;
        let parsed = MetadataDocument::parse(&bytes, &self.config.default_container)
            .map_err(|e| MetadataError::MetadataCorrupt(e.to_string()))
            .and_then(Catalog::from_document);

        match parsed {
            Ok(catalog) => {
                info!(
                    handle = %latest,
                    files = catalog.files.len(),
                    folders = catalog.tree.len(),
                    "metadata loaded"
                );
                state.catalog = catalog;
                state.current = Some(latest);
                state.stale = tagged;
                Ok(())
            }
            Err(e) => {
                warn!(handle = %latest, error = %e, "metadata document unreadable");
                tagged.push(latest);
                *state = State {
                    stale: tagged,
                    ..State::default()
                };
                Err(e)
            }
        }
    }

    /// Clones the catalog, applies `f`, persists, then commits.
    async fn mutate<T, F>(&self, f: F) -> Result<T, MetadataError>
    where
        F: FnOnce(&mut Catalog) -> Result<T, MetadataError>,
    {
        let mut state = self.state.lock().await;
        let mut next = state.catalog.clone();
        let out = f(&mut next)?;
        self.persist(&mut state, &next).await?;
        state.catalog = next;
        Ok(out)
    }

    async fn persist(&self, state: &mut State, catalog: &Catalog) -> Result<(), MetadataError> {
        let bytes = catalog
            .to_document()
            .to_json()
            .map_err(|e| MetadataError::Encode(e.to_string()))?;
        let size = bytes.len();

        let handle = self
            .store
            .put(&self.config.container, bytes, METADATA_TAG)
            .await?;
        debug!(handle = %handle, bytes = size, "metadata persisted");

        let mut superseded = std::mem::take(&mut state.stale);
        superseded.extend(state.current.replace(handle));
        for old in superseded {
            if let Err(e) = self.store.delete(&old).await {
                warn!(handle = %old, error = %e, "failed to delete superseded metadata blob");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Creates `parent/name` and returns its path.
    pub async fn create_folder(
        &self,
        parent: &FolderPath,
        name: &str,
    ) -> Result<FolderPath, MetadataError> {
        let path = parent.join(name)?;
        self.mutate(|cat| {
            cat.require_folder(parent)?;
            let clashes_with_file = cat
                .files
                .iter()
                .any(|f| &f.folder == parent && f.name == path.name());
            if cat.tree.contains(&path) || clashes_with_file {
                return Err(MetadataError::AlreadyExists(path.to_string()));
            }
            cat.tree.insert(path.clone());
            Ok(())
        })
        .await?;

        info!(folder = %path, "folder created");
        Ok(path)
    }

    /// Appends a file record, creating its folder (and ancestors) if needed.
    pub async fn add_file(&self, record: FileRecord) -> Result<(), MetadataError> {
        validate_name(&record.name)?;
        let id = record.id.clone();
        let name = record.name.clone();
        self.mutate(move |cat| {
            if cat.files.iter().any(|f| f.id == record.id) {
                return Err(MetadataError::DuplicateId(record.id));
            }
            for added in cat.tree.insert(record.folder.clone()) {
                debug!(folder = %added, "created missing folder for new file");
            }
            cat.files.push(record);
            Ok(())
        })
        .await?;

        info!(file = %name, id = %id, "file added");
        Ok(())
    }

    /// Removes a file record and returns it.
    pub async fn delete_file(&self, id: &str) -> Result<FileRecord, MetadataError> {
        let removed = self
            .mutate(|cat| {
                let pos = cat.position(id)?;
                Ok(cat.files.remove(pos))
            })
            .await?;
        info!(file = %removed.name, id = %id, "file deleted");
        Ok(removed)
    }

    /// Removes a folder, every folder below it and every file inside them.
    pub async fn delete_folder(&self, path: &FolderPath) -> Result<FolderRemoval, MetadataError> {
        if path.is_root() {
            return Err(MetadataError::RootFolder);
        }
        let removal = self
            .mutate(|cat| {
                cat.require_folder(path)?;
                let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut cat.files)
                    .into_iter()
                    .partition(|f| f.folder.is_within(path));
                cat.files = kept;
                let folders = cat.tree.remove_subtree(path);
                Ok(FolderRemoval {
                    folders,
                    files: gone,
                })
            })
            .await?;

        info!(
            folder = %path,
            folders = removal.folders.len(),
            files = removal.files.len(),
            "folder deleted"
        );
        Ok(removal)
    }

    /// Moves a file record to another known folder.
    pub async fn move_file(
        &self,
        id: &str,
        folder: &FolderPath,
    ) -> Result<FileRecord, MetadataError> {
        let moved = self
            .mutate(|cat| {
                cat.require_folder(folder)?;
                let pos = cat.position(id)?;
                cat.files[pos].folder = folder.clone();
                Ok(cat.files[pos].clone())
            })
            .await?;
        info!(file = %moved.name, folder = %folder, "file moved");
        Ok(moved)
    }

    /// Points a file record at new chunk blobs.
    pub async fn relocate_file(
        &self,
        id: &str,
        chunks: Vec<BlobHandle>,
    ) -> Result<FileRecord, MetadataError> {
        self.mutate(move |cat| {
            let pos = cat.position(id)?;
            cat.files[pos].chunks = chunks;
            Ok(cat.files[pos].clone())
        })
        .await
    }

    /// Moves a file record and points it at new chunk blobs in one write.
    ///
    /// `revision` is the revision the new chunks were captioned with.
    pub async fn move_and_relocate(
        &self,
        id: &str,
        folder: &FolderPath,
        chunks: Vec<BlobHandle>,
        revision: u32,
    ) -> Result<FileRecord, MetadataError> {
        let moved = self
            .mutate(move |cat| {
                cat.require_folder(folder)?;
                let pos = cat.position(id)?;
                let file = &mut cat.files[pos];
                file.folder = folder.clone();
                file.chunks = chunks;
                file.revision = revision;
                Ok(file.clone())
            })
            .await?;
        info!(
            file = %moved.name,
            folder = %folder,
            chunks = moved.chunks.len(),
            "file moved with new chunks"
        );
        Ok(moved)
    }

    /// Replaces the whole document.
    pub async fn replace(&self, doc: MetadataDocument) -> Result<(), MetadataError> {
        let catalog = Catalog::from_document(doc)?;
        let files = catalog.files.len();
        self.mutate(move |cat| {
            *cat = catalog;
            Ok(())
        })
        .await?;
        info!(files, "metadata replaced");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Lists a folder.
    ///
    /// Non-recursive: direct child folders and the files directly inside.
    /// Recursive: every descendant folder and every file in the subtree.
    /// Files keep insertion order.
    pub async fn list(
        &self,
        folder: &FolderPath,
        recursive: bool,
    ) -> Result<Listing, MetadataError> {
        let state = self.state.lock().await;
        let cat = &state.catalog;
        cat.require_folder(folder)?;

        let listing = if recursive {
            Listing {
                folders: cat.tree.descendants(folder).cloned().collect(),
                files: cat
                    .files
                    .iter()
                    .filter(|f| f.folder.is_within(folder))
                    .cloned()
                    .collect(),
            }
        } else {
            Listing {
                folders: cat.tree.children(folder).cloned().collect(),
                files: cat
                    .files
                    .iter()
                    .filter(|f| &f.folder == folder)
                    .cloned()
                    .collect(),
            }
        };
        Ok(listing)
    }

    /// File count and byte total for a folder and everything below it.
    pub async fn folder_stats(&self, path: &FolderPath) -> Result<FolderStats, MetadataError> {
        let state = self.state.lock().await;
        state.catalog.require_folder(path)?;
        Ok(state
            .catalog
            .files
            .iter()
            .filter(|f| f.folder.is_within(path))
            .fold(FolderStats::default(), |acc, f| FolderStats {
                file_count: acc.file_count + 1,
                total_size: acc.total_size + f.size,
            }))
    }

    pub async fn storage_stats(&self) -> StorageStats {
        let state = self.state.lock().await;
        let cat = &state.catalog;
        StorageStats {
            total_files: cat.files.len(),
            total_size: cat.files.iter().map(|f| f.size).sum(),
            folder_count: cat.tree.len(),
        }
    }

    pub async fn get_file(&self, id: &str) -> Option<FileRecord> {
        let state = self.state.lock().await;
        state.catalog.files.iter().find(|f| f.id == id).cloned()
    }

    /// All file records in insertion order.
    pub async fn files(&self) -> Vec<FileRecord> {
        self.state.lock().await.catalog.files.clone()
    }

    pub async fn contains_folder(&self, path: &FolderPath) -> bool {
        self.state.lock().await.catalog.tree.contains(path)
    }

    /// Snapshot of the document as it would be persisted.
    pub async fn document(&self) -> MetadataDocument {
        self.state.lock().await.catalog.to_document()
    }
}
