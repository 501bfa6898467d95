//! Scheduler error types.
//!
//! These never escape the driver: a failing job stores the message on its
//! item and the queue moves on.

use tvault_blob_store::BlobStoreError;
use tvault_metadata::MetadataError;
use tvault_transfer::TransferError;

/// Errors produced while queueing or running a transfer.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("transfer failed: {0}")]
    Store(#[from] BlobStoreError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("failed to encode chunk descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0} chunks exceed the per-file chunk limit")]
    TooManyChunks(u64),

    #[error(
        "{chunks} chunk(s) were stored but the file record could not be saved ({source}); \
         run a rebuild to recover the file"
    )]
    RecordNotSaved { chunks: usize, source: MetadataError },

    #[error("background task failed: {0}")]
    Task(String),

    #[error("cancelled")]
    Cancelled,
}
