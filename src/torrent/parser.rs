//! Torrent descriptor parser
//!
//! Decodes a bencoded `.torrent` descriptor into a [`TorrentInfo`].
//! The info-hash is computed over the exact bytes of the `info`
//! dictionary as they appear in the input, so the dictionary's span is
//! located with a small scanner before the structured decode.

use std::path::{Component, Path};

use anyhow::Result;
use serde::Deserialize;
use serde_bencode::value::Value;
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::torrent::info::{TorrentFile, TorrentInfo};

/// Nesting limit for the span scanner
const MAX_DEPTH: usize = 64;

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    #[serde(default)]
    announce: Option<String>,
    #[serde(default, rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    info: RawInfo,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(rename = "piece length")]
    piece_length: i64,
    pieces: Value,
    #[serde(default)]
    length: Option<i64>,
    #[serde(default)]
    files: Option<Vec<RawFile>>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    length: i64,
    path: Vec<String>,
}

/// Parser for torrent descriptors
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a complete `.torrent` descriptor
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent descriptor from {} bytes", data.len());
        trace!("Descriptor data (first 64 bytes): {:?}", &data[..data.len().min(64)]);

        let (start, end) = Self::info_dict_span(data)?;
        debug!("Info dictionary spans bytes {}..{}", start, end);

        let raw: RawMetainfo = serde_bencode::from_bytes(data).map_err(|e| {
            error!("Failed to decode torrent descriptor: {}", e);
            TorrentError::invalid_descriptor_with_source("Failed to decode torrent descriptor", e.to_string())
        })?;

        let mut trackers = Vec::new();
        if let Some(announce) = raw.announce {
            push_unique(&mut trackers, announce);
        }
        for tier in raw.announce_list.unwrap_or_default() {
            for url in tier {
                push_unique(&mut trackers, url);
            }
        }
        debug!("Collected {} tracker URLs", trackers.len());

        let info_hash = TorrentInfo::generate_info_hash(&data[start..end]);
        Self::build_info(raw.info, info_hash, trackers)
    }

    /// Parse a bare bencoded info dictionary, as obtained from metadata
    /// exchange or any other out-of-band source.
    pub fn parse_info_dict(data: &[u8], trackers: Vec<String>) -> Result<TorrentInfo> {
        debug!("Parsing bare info dictionary from {} bytes", data.len());
        let end = value_end(data, 0, 0)?;
        if end != data.len() || data.first() != Some(&b'd') {
            return Err(TorrentError::invalid_descriptor("Info dictionary has trailing data or wrong type").into());
        }

        let raw: RawInfo = serde_bencode::from_bytes(data).map_err(TorrentError::from)?;
        let info_hash = TorrentInfo::generate_info_hash(data);
        Self::build_info(raw, info_hash, trackers)
    }

    fn build_info(raw: RawInfo, info_hash: [u8; 20], trackers: Vec<String>) -> Result<TorrentInfo> {
        if raw.piece_length <= 0 || raw.piece_length > u32::MAX as i64 {
            error!("Invalid piece length: {}", raw.piece_length);
            return Err(TorrentError::invalid_descriptor_with_source(
                "Invalid piece length",
                format!("got {}", raw.piece_length),
            ).into());
        }
        let piece_length = raw.piece_length as u64;

        let pieces = match raw.pieces {
            Value::Bytes(bytes) => TorrentInfo::parse_piece_hashes(&bytes)?,
            _ => return Err(TorrentError::invalid_descriptor("pieces must be a byte string").into()),
        };

        check_component(&raw.name)?;

        let (files, multi_file) = match (raw.length, raw.files) {
            (Some(length), None) => {
                let length = non_negative(length, "length")?;
                (vec![TorrentFile { path: vec![raw.name.clone()], length, offset: 0 }], false)
            }
            (None, Some(raw_files)) => {
                if raw_files.is_empty() {
                    return Err(TorrentError::invalid_descriptor("files list is empty").into());
                }
                let mut offset = 0u64;
                let mut files = Vec::with_capacity(raw_files.len());
                for file in raw_files {
                    if file.path.is_empty() {
                        return Err(TorrentError::invalid_descriptor("file path is empty").into());
                    }
                    for component in &file.path {
                        check_component(component)?;
                    }
                    let length = non_negative(file.length, "files.length")?;
                    let mut path = Vec::with_capacity(file.path.len() + 1);
                    path.push(raw.name.clone());
                    path.extend(file.path);
                    files.push(TorrentFile { path, length, offset });
                    offset += length;
                }
                (files, true)
            }
            (Some(_), Some(_)) => {
                return Err(TorrentError::invalid_descriptor("both length and files are present").into());
            }
            (None, None) => {
                return Err(TorrentError::invalid_descriptor("neither length nor files is present").into());
            }
        };

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        if total_length == 0 {
            return Err(TorrentError::invalid_descriptor("torrent has no content").into());
        }

        let expected = total_length.div_ceil(piece_length);
        if pieces.len() as u64 != expected {
            error!("Piece hash count mismatch: expected {}, got {}", expected, pieces.len());
            return Err(TorrentError::invalid_descriptor_with_source(
                "Piece hash count does not match content length",
                format!("expected {}, got {}", expected, pieces.len()),
            ).into());
        }

        info!(
            "Parsed torrent '{}': {} bytes, {} pieces of {} bytes, {} files",
            raw.name,
            total_length,
            pieces.len(),
            piece_length,
            files.len()
        );

        Ok(TorrentInfo {
            info_hash,
            name: raw.name,
            piece_length,
            pieces,
            files,
            total_length,
            trackers,
            multi_file,
        })
    }

    /// Locate the `info` value inside the root dictionary
    fn info_dict_span(data: &[u8]) -> Result<(usize, usize)> {
        if data.first() != Some(&b'd') {
            return Err(TorrentError::invalid_descriptor("Root must be a dictionary").into());
        }

        let mut idx = 1;
        while data.get(idx) != Some(&b'e') {
            if idx >= data.len() {
                return Err(TorrentError::invalid_descriptor("Unterminated root dictionary").into());
            }
            let (key, key_end) = string_at(data, idx)?;
            let value_stop = value_end(data, key_end, 1)?;
            if key == b"info" {
                if data.get(key_end) != Some(&b'd') {
                    return Err(TorrentError::invalid_descriptor("info must be a dictionary").into());
                }
                return Ok((key_end, value_stop));
            }
            idx = value_stop;
        }

        warn!("Descriptor has no info dictionary");
        Err(TorrentError::invalid_descriptor("Missing info dictionary").into())
    }
}

fn push_unique(list: &mut Vec<String>, url: String) {
    if !url.is_empty() && !list.contains(&url) {
        list.push(url);
    }
}

fn non_negative(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| {
        anyhow::Error::from(TorrentError::invalid_descriptor_with_source("Negative length", field.to_string()))
    })
}

/// Reject path components that could escape the output directory
fn check_component(component: &str) -> Result<()> {
    let mut components = Path::new(component).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !component.contains(['/', '\\']) => Ok(()),
        _ => {
            error!("Unsafe path component in descriptor: {:?}", component);
            Err(TorrentError::invalid_descriptor_with_source("Unsafe path component", component.to_string()).into())
        }
    }
}

/// Read a byte string starting at `idx`, returning it and the index after it
fn string_at(data: &[u8], idx: usize) -> Result<(&[u8], usize)> {
    let colon = data[idx..]
        .iter()
        .position(|&b| b == b':')
        .map(|p| p + idx)
        .ok_or_else(|| TorrentError::invalid_descriptor("Unterminated string length"))?;
    let length: usize = std::str::from_utf8(&data[idx..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TorrentError::invalid_descriptor("Invalid string length"))?;
    let start = colon + 1;
    let end = start
        .checked_add(length)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| TorrentError::invalid_descriptor("String runs past end of data"))?;
    Ok((&data[start..end], end))
}

/// Index one past the bencoded value starting at `idx`
fn value_end(data: &[u8], idx: usize, depth: usize) -> Result<usize> {
    if depth > MAX_DEPTH {
        return Err(TorrentError::invalid_descriptor("Nesting too deep").into());
    }

    match data.get(idx) {
        None => Err(TorrentError::invalid_descriptor("Unexpected end of data").into()),
        Some(b'i') => {
            let end = data[idx..]
                .iter()
                .position(|&b| b == b'e')
                .ok_or_else(|| TorrentError::invalid_descriptor("Unterminated integer"))?;
            Ok(idx + end + 1)
        }
        Some(b'l') | Some(b'd') => {
            let mut pos = idx + 1;
            loop {
                match data.get(pos) {
                    Some(b'e') => return Ok(pos + 1),
                    Some(_) => pos = value_end(data, pos, depth + 1)?,
                    None => return Err(TorrentError::invalid_descriptor("Unterminated container").into()),
                }
            }
        }
        Some(b'0'..=b'9') => string_at(data, idx).map(|(_, end)| end),
        Some(byte) => Err(TorrentError::invalid_descriptor_with_source(
            "Unknown bencode type",
            format!("byte 0x{:02x} at {}", byte, idx),
        ).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{build_torrent, build_torrent_with, FixtureFile};

    #[test]
    fn test_value_end_scalars() {
        assert_eq!(value_end(b"i42e", 0, 0).unwrap(), 4);
        assert_eq!(value_end(b"4:spam", 0, 0).unwrap(), 6);
        assert_eq!(value_end(b"l4:spami7ee", 0, 0).unwrap(), 11);
        assert!(value_end(b"5:spam", 0, 0).is_err());
        assert!(value_end(b"x", 0, 0).is_err());
    }

    #[test]
    fn test_parse_single_file() {
        let content = vec![7u8; 40_000];
        let fixture = build_torrent("single.bin", &content, 16384);
        let info = TorrentParser::parse_bytes(&fixture.bytes).unwrap();

        assert_eq!(info.name, "single.bin");
        assert_eq!(info.total_length, 40_000);
        assert_eq!(info.piece_count(), 3);
        assert!(!info.is_multi_file());
        assert_eq!(info.files[0].path, vec!["single.bin"]);
        assert_eq!(info.info_hash, fixture.info_hash);
        assert_eq!(info.trackers, vec!["http://tracker.test/announce".to_string()]);
    }

    #[test]
    fn test_parse_multi_file_offsets() {
        let files = vec![
            FixtureFile::new(&["a.bin"], vec![1u8; 1000]),
            FixtureFile::new(&["sub", "b.bin"], vec![2u8; 3000]),
        ];
        let fixture = build_torrent_with("album", &files, 1024, &[]);
        let info = TorrentParser::parse_bytes(&fixture.bytes).unwrap();

        assert!(info.is_multi_file());
        assert_eq!(info.files.len(), 2);
        assert_eq!(info.files[1].path, vec!["album", "sub", "b.bin"]);
        assert_eq!(info.files[1].offset, 1000);
        assert_eq!(info.total_length, 4000);
        assert_eq!(info.piece_count(), 4);
    }

    #[test]
    fn test_info_hash_matches_info_span() {
        let fixture = build_torrent("x", &[9u8; 100], 64);
        let (start, end) = TorrentParser::info_dict_span(&fixture.bytes).unwrap();
        assert_eq!(TorrentInfo::generate_info_hash(&fixture.bytes[start..end]), fixture.info_hash);
        let bare = TorrentParser::parse_info_dict(&fixture.bytes[start..end], vec![]).unwrap();
        assert_eq!(bare.info_hash, fixture.info_hash);
    }

    #[test]
    fn test_reject_piece_count_mismatch() {
        let mut fixture = build_torrent("x", &[9u8; 100], 64);
        // Rebuild with the content length changed so hashes no longer line up
        fixture.bytes = String::from_utf8_lossy(&fixture.bytes)
            .replace("6:lengthi100e", "6:lengthi300e")
            .into_bytes();
        let err = TorrentParser::parse_bytes(&fixture.bytes).unwrap_err();
        let err = err.downcast_ref::<TorrentError>().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidDescriptor);
    }

    #[test]
    fn test_reject_parent_dir_component() {
        let files = vec![FixtureFile::new(&["..", "evil"], vec![1u8; 10])];
        let fixture = build_torrent_with("album", &files, 16, &[]);
        assert!(TorrentParser::parse_bytes(&fixture.bytes).is_err());
    }

    #[test]
    fn test_reject_non_dictionary() {
        assert!(TorrentParser::parse_bytes(b"l4:spame").is_err());
        assert!(TorrentParser::parse_bytes(b"d8:announce3:urle").is_err());
        assert!(TorrentParser::parse_bytes(b"").is_err());
    }

    #[test]
    fn test_announce_list_deduplicated() {
        let fixture = build_torrent_with(
            "x",
            &[FixtureFile::new(&["f"], vec![0u8; 10])],
            16,
            &["http://tracker.test/announce", "udp://other.test:6969"],
        );
        let info = TorrentParser::parse_bytes(&fixture.bytes).unwrap();
        assert_eq!(info.trackers, vec![
            "http://tracker.test/announce".to_string(),
            "udp://other.test:6969".to_string(),
        ]);
    }
}
