//! Vault: the operation surface over the metadata store, the transfer
//! scheduler and the blob store.
//!
//! # Operations
//!
//! - **Browse**: list, folder and storage stats
//! - **Organize**: create/delete folders, delete/move files
//! - **Transfer**: queue uploads and downloads, cancel, clear
//! - **Recover**: rebuild metadata from blob captions
//! - **Migrate**: move files into per-folder containers
//! - **Thumbnails**: best-effort preview prefetch into a disk cache

pub mod config;
pub mod error;
pub mod migrate;
pub mod notify;
pub mod reconcile;
pub mod thumbnails;
pub mod vault;

pub use config::{ConfigError, VaultConfig};
pub use error::VaultError;
pub use migrate::{
    MigrationReport, migrate_to_folder_containers, move_to_folder, target_container,
};
pub use notify::{Level, Notification, NotificationQueue};
pub use reconcile::{IncompleteFile, IncompleteReason, RebuildReport, rebuild, scan};
pub use thumbnails::{
    BlobPreviewSource, PreviewFuture, ThumbnailCache, ThumbnailPrefetcher, ThumbnailSource, hash_key,
};
pub use vault::{BulkDeleteReport, Vault};
