//! Transfer state and progress payloads emitted to callers.

use serde::{Deserialize, Serialize};

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Upload,
    Download,
}

/// Lifecycle state of a queued transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Active,
    Completed,
    Error,
}

impl TransferStatus {
    /// `true` for `Completed` and `Error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Status carried in a progress payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Starting,
    Uploading,
    Downloading,
    Completed,
    Error,
}

/// Progress of one upload or download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    /// Transfer item id.
    pub id: String,
    /// Stored file id (downloads always, uploads once completed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    pub kind: TransferKind,
    pub status: ProgressStatus,
    /// Percentage, 0-100.
    pub progress: u8,
    pub current: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Progress of a migration run, one update per file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationProgress {
    /// One-based index of the file being processed.
    pub current: usize,
    pub total: usize,
    pub file: String,
    pub progress: u8,
}

/// Integer percentage of `current` over `total`, clamped to 0-100.
///
/// An empty total counts as done.
pub fn percent(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (current as u128 * 100 / total as u128).min(100);
    pct as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_clamps_and_handles_zero() {
        assert_eq!(percent(0, 10), 0);
        assert_eq!(percent(5, 10), 50);
        assert_eq!(percent(20, 10), 100);
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(2_000_000_000, 5_000_000_000), 40);
    }

    #[test]
    fn progress_field_names() {
        let p = TransferProgress {
            id: "t1".into(),
            file_id: Some("f1".into()),
            kind: TransferKind::Download,
            status: ProgressStatus::Downloading,
            progress: 50,
            current: 5,
            total: 10,
            error: None,
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["fileId"], "f1");
        assert_eq!(json["kind"], "download");
        assert_eq!(json["status"], "downloading");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Error.is_terminal());
        assert!(!TransferStatus::Active.is_terminal());
        assert!(!TransferStatus::Pending.is_terminal());
    }
}
