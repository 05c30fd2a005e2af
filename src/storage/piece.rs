//! Piece assembly module
//!
//! In-memory buffers that collect a piece's blocks until it can be
//! hashed.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use anyhow::Result;
use sha1::{Digest, Sha1};

use tracing::warn;

use crate::error::TorrentError;

/// Check `data` against a recorded SHA1 piece hash
pub fn hash_matches(data: &[u8], expected: &[u8; 20]) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().as_slice() == expected
}

/// Hash `data` on the blocking pool and hand it back with the verdict.
/// A missing hash never matches.
pub async fn verify_piece(data: Vec<u8>, expected: Option<[u8; 20]>) -> (bool, Vec<u8>) {
    let Some(expected) = expected else { return (false, data) };
    match tokio::task::spawn_blocking(move || (hash_matches(&data, &expected), data)).await {
        Ok(verdict) => verdict,
        Err(e) => {
            warn!("Hashing task failed: {}", e);
            (false, Vec::new())
        }
    }
}

/// Assembly buffer for one piece
#[derive(Debug, Clone)]
pub struct PieceBuffer {
    /// Piece index
    pub index: u32,
    data: Vec<u8>,
    received: Vec<bool>,
    block_size: u32,
    contributors: BTreeSet<SocketAddr>,
}

impl PieceBuffer {
    /// Create an empty buffer for a piece of `length` bytes
    pub fn new(index: u32, length: u32, block_size: u32) -> Self {
        Self {
            index,
            data: vec![0u8; length as usize],
            received: vec![false; length.div_ceil(block_size) as usize],
            block_size,
            contributors: BTreeSet::new(),
        }
    }

    /// Copy a block into place. Returns false if that block was already
    /// present.
    pub fn add_block(&mut self, begin: u32, block: &[u8], peer: SocketAddr) -> Result<bool> {
        let end = begin as usize + block.len();
        if begin % self.block_size != 0 || end > self.data.len() {
            return Err(TorrentError::protocol_error_with_source(
                format!("Block does not fit piece {}", self.index),
                format!("begin {} length {} piece length {}", begin, block.len(), self.data.len()),
            ).into());
        }

        let slot = (begin / self.block_size) as usize;
        if self.received[slot] {
            return Ok(false);
        }
        self.data[begin as usize..end].copy_from_slice(block);
        self.received[slot] = true;
        self.contributors.insert(peer);
        Ok(true)
    }

    /// Check if all blocks are present
    pub fn is_complete(&self) -> bool {
        self.received.iter().all(|r| *r)
    }

    /// Number of blocks received so far
    pub fn received_blocks(&self) -> usize {
        self.received.iter().filter(|r| **r).count()
    }

    /// Piece length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consume the buffer, yielding the piece bytes and the peers that
    /// supplied them
    pub fn into_parts(self) -> (Vec<u8>, Vec<SocketAddr>) {
        (self.data, self.contributors.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, n], 6881))
    }

    #[tokio::test]
    async fn test_verify_piece_off_thread() {
        let data = b"some piece data".to_vec();
        let hash: [u8; 20] = Sha1::digest(&data).into();

        let (ok, back) = verify_piece(data.clone(), Some(hash)).await;
        assert!(ok);
        assert_eq!(back, data);

        let (ok, back) = verify_piece(b"other".to_vec(), Some(hash)).await;
        assert!(!ok);
        assert_eq!(back, b"other");
        assert!(!verify_piece(data, None).await.0);
    }

    #[test]
    fn test_assembly_out_of_order() {
        let mut piece = PieceBuffer::new(0, 10, 4);
        assert!(piece.add_block(8, b"ij", peer(1)).unwrap());
        assert!(piece.add_block(0, b"abcd", peer(2)).unwrap());
        assert!(!piece.is_complete());
        assert!(piece.add_block(4, b"efgh", peer(1)).unwrap());
        assert!(piece.is_complete());

        let (data, contributors) = piece.into_parts();
        assert_eq!(data, b"abcdefghij");
        assert_eq!(contributors, vec![peer(1), peer(2)]);
    }

    #[test]
    fn test_duplicate_block_ignored() {
        let mut piece = PieceBuffer::new(0, 4, 4);
        assert!(piece.add_block(0, b"abcd", peer(1)).unwrap());
        assert!(!piece.add_block(0, b"zzzz", peer(2)).unwrap());
        let (data, contributors) = piece.into_parts();
        assert_eq!(data, b"abcd");
        assert_eq!(contributors.len(), 1);
    }

    #[test]
    fn test_block_out_of_bounds() {
        let mut piece = PieceBuffer::new(0, 6, 4);
        assert!(piece.add_block(4, b"abcd", peer(1)).is_err());
        assert!(piece.add_block(2, b"ab", peer(1)).is_err());
    }

    #[test]
    fn test_hash_matches() {
        let expected: [u8; 20] = Sha1::digest(b"hello").into();
        assert!(hash_matches(b"hello", &expected));
        assert!(!hash_matches(b"hellp", &expected));
    }
}
