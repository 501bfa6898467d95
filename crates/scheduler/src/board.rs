//! Consumer-side view of the transfer queue, rebuilt from events.

use tvault_protocol::{ProgressStatus, TransferProgress, TransferStatus};

use crate::types::{TransferEvent, TransferItem};

/// Transfer list as seen by a subscriber.
///
/// Events about ids the board does not hold (an item removed while its
/// job was still reporting) are ignored.
#[derive(Debug, Default)]
pub struct TransferBoard {
    items: Vec<TransferItem>,
}

impl TransferBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one event. Returns `false` if it was ignored.
    pub fn apply(&mut self, event: TransferEvent) -> bool {
        match event {
            TransferEvent::Queued(item) => {
                if self.items.iter().any(|i| i.id == item.id) {
                    return false;
                }
                self.items.push(item);
                true
            }
            TransferEvent::Progress(progress) => self.update(progress),
            TransferEvent::Removed { id } => {
                let before = self.items.len();
                self.items.retain(|i| i.id != id);
                self.items.len() != before
            }
        }
    }

    fn update(&mut self, progress: TransferProgress) -> bool {
        let Some(item) = self.items.iter_mut().find(|i| i.id == progress.id) else {
            return false;
        };
        item.status = match progress.status {
            ProgressStatus::Starting | ProgressStatus::Uploading | ProgressStatus::Downloading => {
                TransferStatus::Active
            }
            ProgressStatus::Completed => TransferStatus::Completed,
            ProgressStatus::Error => TransferStatus::Error,
        };
        item.current_bytes = item.current_bytes.max(progress.current);
        item.total_bytes = progress.total;
        if progress.file_id.is_some() {
            item.file_id = progress.file_id;
        }
        item.error = progress.error;
        true
    }

    pub fn items(&self) -> &[TransferItem] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&TransferItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Items still pending or active.
    pub fn in_flight(&self) -> usize {
        self.items.iter().filter(|i| !i.status.is_terminal()).count()
    }
}
