//! Error types for vault operations.

use tvault_blob_store::BlobStoreError;
use tvault_metadata::MetadataError;
use tvault_protocol::PathError;
use tvault_scheduler::SchedulerError;
use tvault_transfer::TransferError;

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("blob store error: {0}")]
    Store(#[from] BlobStoreError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    Path(#[from] PathError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The metadata document could not be read; rebuild it or start empty.
    #[error("metadata is unavailable until it is rebuilt or the rebuild is declined")]
    MetadataUnavailable,
}
