//! Piece bitfield
//!
//! MSB-first bit set sized to a torrent's piece count, as carried by the
//! `bitfield` wire message.

use anyhow::Result;

use crate::error::TorrentError;

/// Set of piece indexes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    /// Empty bitfield for `len` pieces
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u8; len.div_ceil(8)],
            len,
        }
    }

    /// Bitfield with every piece set
    pub fn full(len: usize) -> Self {
        let mut field = Self::new(len);
        for index in 0..len {
            field.set(index);
        }
        field
    }

    /// Build from wire bytes, rejecting wrong sizes and set spare bits
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        if bytes.len() != len.div_ceil(8) {
            return Err(TorrentError::protocol_error_with_source(
                "Bitfield has wrong size",
                format!("expected {} bytes, got {}", len.div_ceil(8), bytes.len()),
            ).into());
        }

        let spare = bytes.len() * 8 - len;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if bytes[bytes.len() - 1] & mask != 0 {
                return Err(TorrentError::protocol_error("Bitfield has spare bits set").into());
            }
        }

        Ok(Self { bits: bytes.to_vec(), len })
    }

    /// Number of pieces tracked
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether piece `index` is set
    pub fn has(&self, index: usize) -> bool {
        index < self.len && self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Set piece `index`; returns false if it was out of range
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[index / 8] |= 0x80 >> (index % 8);
        true
    }

    /// Number of set pieces
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Whether every piece is set
    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }

    /// Indexes of set pieces
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.has(i))
    }

    /// Raw wire bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msb_first() {
        let field = Bitfield::from_bytes(&[0b1100_0000], 3).unwrap();
        assert!(field.has(0));
        assert!(field.has(1));
        assert!(!field.has(2));
        assert!(!field.has(7));
        assert_eq!(field.count(), 2);
    }

    #[test]
    fn test_set_and_complete() {
        let mut field = Bitfield::new(10);
        assert_eq!(field.as_bytes().len(), 2);
        for i in 0..10 {
            assert!(field.set(i));
        }
        assert!(!field.set(10));
        assert!(field.is_complete());
        assert_eq!(field, Bitfield::full(10));
        assert_eq!(field.as_bytes(), &[0xff, 0xc0]);
    }

    #[test]
    fn test_rejects_bad_wire_bytes() {
        assert!(Bitfield::from_bytes(&[0xff], 10).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0xff], 10).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0xc0], 10).is_ok());
    }

    #[test]
    fn test_iter_set() {
        let field = Bitfield::from_bytes(&[0b1010_0000], 4).unwrap();
        assert_eq!(field.iter_set().collect::<Vec<_>>(), vec![0, 2]);
    }
}
