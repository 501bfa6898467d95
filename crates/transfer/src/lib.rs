//! Chunking engine: splits byte streams into size-bounded chunks and
//! reassembles them.
//!
//! Boundaries are purely size-based. A stream whose length is an exact
//! multiple of the chunk size never gets a trailing empty chunk, and an
//! empty stream produces no chunks at all. Nothing in this crate talks to
//! the remote store.

mod chunked;
mod transform;

pub use chunked::{Chunk, ChunkJoiner, ChunkReader, chunk_count, join, split};
pub use transform::{ContentTransform, Passthrough};

/// Default chunk size: 2 GiB, the backend's per-blob ceiling.
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk mismatch: {0}")]
    ChunkMismatch(String),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("content transform failed: {0}")]
    Transform(String),
}
