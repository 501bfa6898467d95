//! Content transform applied before chunking and after reassembly.
//!
//! Encryption plugs in here. The engine only ever sees whole buffers, so a
//! transform is free to change the length.

use crate::TransferError;

/// Reversible byte transform for file content.
pub trait ContentTransform: Send + Sync {
    /// Applied to the plain file before it is split.
    fn encode(&self, plain: Vec<u8>) -> Result<Vec<u8>, TransferError>;

    /// Applied to the joined stored bytes.
    fn decode(&self, stored: Vec<u8>) -> Result<Vec<u8>, TransferError>;
}

/// Leaves content untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl ContentTransform for Passthrough {
    fn encode(&self, plain: Vec<u8>) -> Result<Vec<u8>, TransferError> {
        Ok(plain)
    }

    fn decode(&self, stored: Vec<u8>) -> Result<Vec<u8>, TransferError> {
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_is_identity() {
        let t = Passthrough;
        let data = b"hello".to_vec();
        assert_eq!(t.decode(t.encode(data.clone()).unwrap()).unwrap(), data);
    }
}
