//! User-facing notifications.
//!
//! A single failed item gets a transient entry naming it; bulk operations
//! get one aggregate entry with counts. Display and dismissal timing belong
//! to the front end.

use serde::Serialize;

use crate::migrate::MigrationReport;
use crate::reconcile::RebuildReport;
use crate::vault::BulkDeleteReport;

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Success,
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: u64,
    pub level: Level,
    pub title: String,
    pub message: Option<String>,
    /// Single-item entries are transient; aggregates stay until dismissed.
    pub transient: bool,
}

/// In-memory notification queue with monotonic ids.
#[derive(Debug, Clone, Default)]
pub struct NotificationQueue {
    entries: Vec<Notification>,
    next_id: u64,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an entry and returns its id.
    pub fn push(
        &mut self,
        level: Level,
        title: impl Into<String>,
        message: Option<String>,
        transient: bool,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Notification {
            id,
            level,
            title: title.into(),
            message,
            transient,
        });
        id
    }

    /// A transfer item ended in error.
    pub fn transfer_failed(&mut self, name: &str, error: &str) -> u64 {
        self.push(
            Level::Error,
            format!("Transfer failed: {name}"),
            Some(error.to_string()),
            true,
        )
    }

    pub fn migration_finished(&mut self, report: &MigrationReport) -> u64 {
        let level = if report.failed > 0 {
            Level::Warning
        } else {
            Level::Success
        };
        self.push(
            level,
            "Migration finished",
            Some(format!(
                "{} migrated, {} failed, {} skipped",
                report.migrated, report.failed, report.skipped
            )),
            false,
        )
    }

    pub fn bulk_delete_finished(&mut self, report: &BulkDeleteReport) -> u64 {
        let level = if report.failed.is_empty() {
            Level::Success
        } else {
            Level::Warning
        };
        self.push(
            level,
            "Files deleted",
            Some(format!(
                "{} deleted, {} failed",
                report.deleted,
                report.failed.len()
            )),
            false,
        )
    }

    pub fn rebuild_finished(&mut self, report: &RebuildReport) -> u64 {
        let level = if report.incomplete.is_empty() {
            Level::Success
        } else {
            Level::Warning
        };
        self.push(
            level,
            "Metadata rebuilt",
            Some(format!(
                "{} files recovered, {} incomplete",
                report.discovered,
                report.incomplete.len()
            )),
            false,
        )
    }

    /// Removes an entry. Returns `true` if it was present.
    pub fn dismiss(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|n| n.id != id);
        self.entries.len() != before
    }

    pub fn get(&self, id: u64) -> Option<&Notification> {
        self.entries.iter().find(|n| n.id == id)
    }

    /// Entries oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }

    /// Removes and returns every entry.
    pub fn drain(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
