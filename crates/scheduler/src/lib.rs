//! Transfer scheduler.
//!
//! Uploads and downloads are queued as [`TransferItem`]s and run strictly
//! one at a time, in FIFO order. Which item runs next is decided by the pure
//! [`advance`] function over a snapshot of the queue; the driver only
//! carries that decision out. Progress is published as [`TransferEvent`]s.
//!
//! The chunk pipelines in [`pipeline`] are shared with migration.

pub mod board;
pub mod error;
pub mod fsm;
pub mod pipeline;
pub mod scheduler;
pub mod types;

pub use board::TransferBoard;
pub use error::SchedulerError;
pub use fsm::{Step, advance};
pub use scheduler::{SchedulerConfig, TransferScheduler};
pub use types::{TransferEvent, TransferItem, TransferJob};
