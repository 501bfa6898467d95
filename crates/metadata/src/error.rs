//! Error types for metadata operations.

use tvault_blob_store::BlobStoreError;
use tvault_protocol::PathError;

/// Errors produced by the metadata store.
///
/// A failed operation never leaves a partial mutation behind.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate file id: {0}")]
    DuplicateId(String),

    #[error("metadata document is corrupt: {0}")]
    MetadataCorrupt(String),

    #[error("the root folder cannot be deleted")]
    RootFolder,

    #[error("failed to encode metadata: {0}")]
    Encode(String),

    #[error("blob store error: {0}")]
    Store(#[from] BlobStoreError),
}

impl From<PathError> for MetadataError {
    fn from(e: PathError) -> Self {
        Self::InvalidName(e.to_string())
    }
}
