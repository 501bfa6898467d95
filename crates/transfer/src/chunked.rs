use std::io::{Cursor, Read, Write};
use std::path::Path;

use crate::TransferError;

/// Number of chunks needed for `size` bytes: `ceil(size / chunk_size)`.
///
/// Returns 0 for an empty stream.
pub fn chunk_count(size: u64, chunk_size: u64) -> Result<u64, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunkSize);
    }
    Ok(size.div_ceil(chunk_size))
}

/// Splits an in-memory buffer into chunks of at most `chunk_size` bytes.
pub fn split(data: &[u8], chunk_size: usize) -> Result<std::slice::Chunks<'_, u8>, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunkSize);
    }
    Ok(data.chunks(chunk_size))
}

/// Concatenates chunks in order, checking them against the declared size.
pub fn join<I>(chunks: I, expected_size: u64) -> Result<Vec<u8>, TransferError>
where
    I: IntoIterator<Item = Vec<u8>>,
{
    let capacity = usize::try_from(expected_size).unwrap_or(0);
    let mut joiner = ChunkJoiner::new(Vec::with_capacity(capacity), expected_size);
    for chunk in chunks {
        joiner.push(&chunk)?;
    }
    joiner.finish()
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// A chunk of file data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based sequence number.
    pub index: u32,
    /// Byte offset within the stream.
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Reads a stream of known length in fixed-size chunks.
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: u64,
    offset: u64,
    index: u32,
    total_size: u64,
}

impl ChunkReader<std::fs::File> {
    /// Opens `path` for chunked reading.
    pub fn open(path: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let total_size = file.metadata()?.len();
        Self::new(file, total_size, chunk_size)
    }
}

impl ChunkReader<Cursor<Vec<u8>>> {
    /// Chunks an owned buffer.
    pub fn from_bytes(data: Vec<u8>, chunk_size: u64) -> Result<Self, TransferError> {
        let total_size = data.len() as u64;
        Self::new(Cursor::new(data), total_size, chunk_size)
    }
}

impl<R: Read> ChunkReader<R> {
    /// Wraps `reader`, which must yield exactly `total_size` bytes.
    pub fn new(reader: R, total_size: u64, chunk_size: u64) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }
        Ok(Self {
            reader,
            chunk_size,
            offset: 0,
            index: 0,
            total_size,
        })
    }

    /// Reads the next chunk. Returns `None` once `total_size` bytes were read.
    ///
    /// A stream that ends early is an I/O error (`UnexpectedEof`).
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(None);
        }

        let read_size = remaining.min(self.chunk_size) as usize;
        let mut buf = vec![0u8; read_size];
        self.reader.read_exact(&mut buf)?;

        let chunk = Chunk {
            index: self.index,
            offset: self.offset,
            data: buf,
        };
        self.offset += read_size as u64;
        self.index += 1;
        Ok(Some(chunk))
    }

    /// Number of chunks this reader yields in total.
    pub fn chunk_total(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }

    /// Current byte offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total stream size in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes remaining to read.
    pub fn remaining(&self) -> u64 {
        self.total_size - self.offset
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = Result<Chunk, TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

// ---------------------------------------------------------------------------
// ChunkJoiner
// ---------------------------------------------------------------------------

/// Reassembles chunks, in order, into a writer.
///
/// The running total may never exceed the declared size, and must match it
/// exactly when [`finish`](Self::finish) is called.
pub struct ChunkJoiner<W> {
    writer: W,
    expected_size: u64,
    written: u64,
    chunks: u32,
}

impl<W: Write> ChunkJoiner<W> {
    pub fn new(writer: W, expected_size: u64) -> Self {
        Self {
            writer,
            expected_size,
            written: 0,
            chunks: 0,
        }
    }

    /// Appends the next chunk.
    pub fn push(&mut self, data: &[u8]) -> Result<(), TransferError> {
        let after = self.written + data.len() as u64;
        if after > self.expected_size {
            return Err(TransferError::ChunkMismatch(format!(
                "chunk {} brings total to {after} bytes, declared size is {}",
                self.chunks, self.expected_size
            )));
        }
        self.writer.write_all(data)?;
        self.written = after;
        self.chunks += 1;
        Ok(())
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Verifies the total and returns the writer.
    pub fn finish(mut self) -> Result<W, TransferError> {
        if self.written != self.expected_size {
            return Err(TransferError::ChunkMismatch(format!(
                "{} chunks hold {} bytes, declared size is {}",
                self.chunks, self.written, self.expected_size
            )));
        }
        self.writer.flush()?;
        Ok(self.writer)
    }
}
