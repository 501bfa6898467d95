//! Shared data model for the tvault storage engine.
//!
//! Everything that crosses a crate boundary or gets persisted lives here:
//! normalized folder paths, remote blob handles, file records, the metadata
//! document with its versioned parser, the chunk descriptor carried in blob
//! captions, and the progress payloads emitted to callers.

pub mod descriptor;
pub mod document;
pub mod handle;
pub mod path;
pub mod progress;

pub use descriptor::{CHUNK_TAG, ChunkDescriptor, METADATA_TAG};
pub use document::{CURRENT_VERSION, DocumentError, FileRecord, MetadataDocument};
pub use handle::{BlobHandle, HandleParseError};
pub use path::{FolderPath, PathError, validate_name};
pub use progress::{
    MigrationProgress, ProgressStatus, TransferKind, TransferProgress, TransferStatus, percent,
};
