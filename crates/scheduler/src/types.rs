//! Queue entries and the events published about them.

use std::path::PathBuf;

use serde::Serialize;
use tvault_protocol::{FolderPath, TransferKind, TransferProgress, TransferStatus};

/// What a queued transfer does once it becomes active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransferJob {
    /// Chunk a local file and store it under `folder`.
    Upload {
        source: PathBuf,
        folder: FolderPath,
        encrypt: bool,
    },
    /// Fetch a stored file and write it to `destination`.
    Download {
        file_id: String,
        destination: PathBuf,
    },
}

/// One queued upload or download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferItem {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub kind: TransferKind,
    pub status: TransferStatus,
    pub current_bytes: u64,
    pub total_bytes: u64,
    /// Stored file id: known up front for downloads, set on completion for uploads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub job: TransferJob,
}

impl TransferItem {
    pub(crate) fn new(name: String, size: u64, job: TransferJob) -> Self {
        let (kind, file_id) = match &job {
            TransferJob::Upload { .. } => (TransferKind::Upload, None),
            TransferJob::Download { file_id, .. } => (TransferKind::Download, Some(file_id.clone())),
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            size,
            kind,
            status: TransferStatus::Pending,
            current_bytes: 0,
            total_bytes: size,
            file_id,
            error: None,
            job,
        }
    }
}

/// Event published by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// An item entered the queue.
    Queued(TransferItem),
    /// Status or byte count of an item changed.
    Progress(TransferProgress),
    /// An item was cancelled or cleared.
    Removed { id: String },
}

impl TransferEvent {
    /// Id of the item this event is about.
    pub fn item_id(&self) -> &str {
        match self {
            Self::Queued(item) => &item.id,
            Self::Progress(p) => &p.id,
            Self::Removed { id } => id,
        }
    }
}
