//! Torrent information structures
//!
//! [`TorrentInfo`] is the immutable, resolved view of a torrent: its
//! identity, piece hashes and the layout mapping pieces onto files.

use std::path::PathBuf;

use anyhow::Result;
use sha1::{Digest, Sha1};

use crate::error::TorrentError;

/// One file of the torrent's on-disk layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path components relative to the output directory. For multi-file
    /// torrents the first component is the torrent name.
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
    /// Byte offset of this file within the concatenated torrent content
    pub offset: u64,
}

impl TorrentFile {
    /// Relative path of the file as a `PathBuf`
    pub fn relative_path(&self) -> PathBuf {
        self.path.iter().collect()
    }

    /// Offset one past the last byte of this file
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// A contiguous region of one file covered by a torrent byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    /// Index into [`TorrentInfo::files`]
    pub file_index: usize,
    /// Offset inside that file
    pub file_offset: u64,
    /// Number of bytes
    pub length: u64,
}

/// Resolved torrent metadata
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// SHA1 hash of the bencoded info dictionary
    pub info_hash: [u8; 20],
    /// Torrent name
    pub name: String,
    /// Size of each piece in bytes (the last piece may be shorter)
    pub piece_length: u64,
    /// Piece hashes, one per piece
    pub pieces: Vec<[u8; 20]>,
    /// Files in layout order with cumulative offsets
    pub files: Vec<TorrentFile>,
    /// Sum of all file lengths
    pub total_length: u64,
    /// Tracker announce URLs in tier order, without duplicates
    pub trackers: Vec<String>,
    /// Whether the descriptor used the multi-file layout
    pub multi_file: bool,
}

impl TorrentInfo {
    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Check if this is a multi-file torrent
    pub fn is_multi_file(&self) -> bool {
        self.multi_file
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Generate info hash from info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Parse piece hashes from the concatenated `pieces` field
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::invalid_descriptor_with_source(
                "Pieces field length must be a multiple of 20",
                format!("got {}", pieces_bytes.len()),
            ).into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Get piece hash for a specific piece index
    pub fn piece_hash(&self, index: u32) -> Option<[u8; 20]> {
        self.pieces.get(index as usize).copied()
    }

    /// Byte offset of a piece within the torrent content
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length
    }

    /// Length of a piece; the last piece holds the remainder
    pub fn piece_len(&self, index: u32) -> u32 {
        let start = self.piece_offset(index);
        let end = (start + self.piece_length).min(self.total_length);
        end.saturating_sub(start) as u32
    }

    /// Get byte range `[start, end)` for a specific piece
    pub fn piece_range(&self, index: u32) -> Option<(u64, u64)> {
        if index as usize >= self.pieces.len() {
            return None;
        }
        let start = self.piece_offset(index);
        Some((start, start + self.piece_len(index) as u64))
    }

    /// Number of blocks a piece splits into
    pub fn block_count(&self, index: u32, block_size: u32) -> u32 {
        self.piece_len(index).div_ceil(block_size)
    }

    /// Length of the block at `offset` within a piece
    pub fn block_len(&self, index: u32, offset: u32, block_size: u32) -> u32 {
        self.piece_len(index).saturating_sub(offset).min(block_size)
    }

    /// Map a torrent byte range onto the files it covers.
    ///
    /// Zero-length files never appear in the result.
    pub fn file_slices(&self, offset: u64, length: u64) -> Vec<FileSlice> {
        let end = offset + length;
        self.files
            .iter()
            .enumerate()
            .filter(|(_, file)| file.length > 0 && file.offset < end && file.end() > offset)
            .map(|(file_index, file)| {
                let start = offset.max(file.offset);
                let stop = end.min(file.end());
                FileSlice {
                    file_index,
                    file_offset: start - file.offset,
                    length: stop - start,
                }
            })
            .collect()
    }
}
