//! Scheduling decision.
//!
//! The queue holds no "processing" flag: whether something is running is
//! read off item statuses. An active item that was removed simply stops
//! being in the snapshot, so the next pass is free to start another one.

use tvault_protocol::TransferStatus;

use crate::types::TransferItem;

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// An item is running; wait for it.
    Busy(String),
    /// Activate this pending item.
    Start(String),
    /// Nothing to do.
    Idle,
}

/// Picks the next step for a queue snapshot in queue order.
pub fn advance(items: &[TransferItem]) -> Step {
    if let Some(active) = items.iter().find(|i| i.status == TransferStatus::Active) {
        return Step::Busy(active.id.clone());
    }
    items
        .iter()
        .find(|i| i.status == TransferStatus::Pending)
        .map(|i| Step::Start(i.id.clone()))
        .unwrap_or(Step::Idle)
}
