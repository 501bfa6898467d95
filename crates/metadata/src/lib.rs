//! Metadata store for the virtual file system.
//!
//! Holds the folder tree and the file records, and persists the whole
//! [`MetadataDocument`](tvault_protocol::MetadataDocument) through the blob
//! store after every mutation.
//!
//! # Operations
//!
//! - **Load**: find the newest tagged document blob and parse it
//! - **Folders**: create, delete (cascading), stats
//! - **Files**: add, delete, move, relocate, list

pub mod error;
pub mod folder_tree;
pub mod store;

pub use error::MetadataError;
pub use folder_tree::FolderTree;
pub use store::{
    FolderRemoval, FolderStats, Listing, MetadataConfig, MetadataStore, StorageStats,
};
