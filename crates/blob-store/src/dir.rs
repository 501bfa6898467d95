//! Directory-backed blob store.
//!
//! Layout under the root:
//!
//! ```text
//! <hex(container)>/
//!     next_id          last id handed out, so ids survive deletes and restarts
//!     <id>.blob        payload
//!     <id>.caption     caption text
//! ```

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::debug;
use tvault_protocol::BlobHandle;

use crate::{BlobEntry, BlobFuture, BlobStore, BlobStoreError, DEFAULT_MAX_BLOB_SIZE, check_size};

const NEXT_ID_FILE: &str = "next_id";
const BLOB_EXT: &str = "blob";
const CAPTION_EXT: &str = "caption";

/// [`BlobStore`] persisted in a local directory.
pub struct DirStore {
    root: PathBuf,
    max_blob_size: u64,
    /// Serializes id allocation.
    alloc: Mutex<()>,
}

impl DirStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, BlobStoreError> {
        Self::open_with_limit(root, DEFAULT_MAX_BLOB_SIZE).await
    }

    pub async fn open_with_limit(
        root: impl Into<PathBuf>,
        max_blob_size: u64,
    ) -> Result<Self, BlobStoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "opened directory blob store");
        Ok(Self {
            root,
            max_blob_size,
            alloc: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> PathBuf {
        self.root.join(hex::encode(container.as_bytes()))
    }

    fn blob_path(&self, handle: &BlobHandle) -> PathBuf {
        self.container_dir(&handle.container)
            .join(format!("{}.{BLOB_EXT}", handle.id))
    }

    fn caption_path(&self, handle: &BlobHandle) -> PathBuf {
        self.container_dir(&handle.container)
            .join(format!("{}.{CAPTION_EXT}", handle.id))
    }

    async fn allocate_id(&self, dir: &Path) -> Result<u64, BlobStoreError> {
        let counter = dir.join(NEXT_ID_FILE);
        let last = match tokio::fs::read_to_string(&counter).await {
            Ok(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|e| BlobStoreError::Backend(format!("corrupt id counter: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let id = last + 1;
        write_atomic(&counter, id.to_string().as_bytes()).await?;
        Ok(id)
    }
}

/// Writes through a temp file and renames, so readers never see partial data.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), BlobStoreError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

impl BlobStore for DirStore {
    fn put<'a>(
        &'a self,
        container: &'a str,
        data: Vec<u8>,
        caption: &'a str,
    ) -> BlobFuture<'a, BlobHandle> {
        Box::pin(async move {
            check_size(data.len(), self.max_blob_size)?;

            let dir = self.container_dir(container);
            tokio::fs::create_dir_all(&dir).await?;

            let _guard = self.alloc.lock().await;
            let id = self.allocate_id(&dir).await?;
            let handle = BlobHandle::new(container, id);

            // Caption first: a blob file without caption is never listed.
            write_atomic(&self.caption_path(&handle), caption.as_bytes()).await?;
            write_atomic(&self.blob_path(&handle), &data).await?;
            Ok(handle)
        })
    }

    fn get<'a>(&'a self, handle: &'a BlobHandle) -> BlobFuture<'a, Vec<u8>> {
        Box::pin(async move {
            match tokio::fs::read(self.blob_path(handle)).await {
                Ok(data) => Ok(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(BlobStoreError::NotFound(handle.clone()))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn list<'a>(&'a self, container: &'a str) -> BlobFuture<'a, Vec<BlobEntry>> {
        Box::pin(async move {
            let dir = self.container_dir(container);
            let mut rd = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };

            let mut entries = Vec::new();
            while let Some(entry) = rd.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXT) {
                    continue;
                }
                let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
                else {
                    continue;
                };

                let handle = BlobHandle::new(container, id);
                let caption = tokio::fs::read_to_string(self.caption_path(&handle))
                    .await
                    .unwrap_or_default();
                let size = entry.metadata().await?.len();
                entries.push(BlobEntry {
                    handle,
                    caption,
                    size,
                });
            }

            entries.sort_by_key(|e| e.handle.id);
            Ok(entries)
        })
    }

    fn delete<'a>(&'a self, handle: &'a BlobHandle) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.blob_path(handle)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(BlobStoreError::NotFound(handle.clone()));
                }
                Err(e) => return Err(e.into()),
            }
            let _ = tokio::fs::remove_file(self.caption_path(handle)).await;
            Ok(())
        })
    }

    fn containers(&self) -> BlobFuture<'_, Vec<String>> {
        Box::pin(async move {
            let mut rd = tokio::fs::read_dir(&self.root).await?;
            let mut names = Vec::new();
            while let Some(entry) = rd.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let Some(name) = entry
                    .file_name()
                    .to_str()
                    .and_then(|s| hex::decode(s).ok())
                    .and_then(|b| String::from_utf8(b).ok())
                else {
                    continue;
                };
                if !self.list(&name).await?.is_empty() {
                    names.push(name);
                }
            }
            names.sort();
            Ok(names)
        })
    }

    fn max_blob_size(&self) -> u64 {
        self.max_blob_size
    }
}
