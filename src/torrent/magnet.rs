//! Magnet link parser
//!
//! Handles parsing of `magnet:?` URIs into the info-hash plus the hints
//! (trackers, exact sources) used to resolve the full metadata.

use anyhow::Result;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TorrentError;

/// Parsed magnet link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    /// SHA1 info hash from the `xt` parameter
    pub info_hash: [u8; 20],
    /// Display name (`dn`)
    pub display_name: Option<String>,
    /// Tracker URLs (`tr`)
    pub trackers: Vec<String>,
    /// Exact source URLs pointing at a descriptor (`xs`)
    pub exact_sources: Vec<String>,
    /// Total content size in bytes (`xl`)
    pub total_size: Option<u64>,
}

/// Parser for magnet links
pub struct MagnetParser;

impl MagnetParser {
    /// Parse a magnet link string
    ///
    /// # Example
    /// ```ignore
    /// let magnet = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&dn=Big+Buck+Bunny";
    /// let link = MagnetParser::parse(magnet)?;
    /// ```
    pub fn parse(magnet_uri: &str) -> Result<MagnetLink> {
        info!("Parsing magnet link: {}", magnet_uri);

        let url = Url::parse(magnet_uri.trim()).map_err(|e| {
            warn!("Invalid magnet URL format: {}", e);
            TorrentError::invalid_source_with_source("Invalid magnet URL format", e.to_string())
        })?;

        if url.scheme() != "magnet" {
            warn!("URL is not a magnet link: scheme is '{}'", url.scheme());
            return Err(TorrentError::invalid_source("URL is not a magnet link").into());
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers: Vec<String> = Vec::new();
        let mut exact_sources = Vec::new();
        let mut total_size = None;

        for (key, value) in url.query_pairs().into_owned() {
            debug!("Processing parameter: {} = {}", key, value);

            match key.as_str() {
                "xt" => {
                    if let Some(hash) = Self::extract_info_hash(&value)? {
                        info_hash = Some(hash);
                    }
                }
                "dn" => display_name = Some(value),
                "tr" => {
                    if !trackers.contains(&value) {
                        trackers.push(value);
                    }
                }
                "xs" => exact_sources.push(value),
                "xl" => match value.parse::<u64>() {
                    Ok(size) => total_size = Some(size),
                    Err(_) => warn!("Invalid xl parameter value: {}", value),
                },
                _ => debug!("Ignoring unknown parameter: {}", key),
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            warn!("Magnet link missing required info hash (xt parameter)");
            TorrentError::invalid_source("Magnet link must contain an info hash (xt=urn:btih:<hash>)")
        })?;

        info!(
            "Parsed magnet link: info_hash={}, name={}, trackers={}",
            hex::encode(info_hash),
            display_name.as_deref().unwrap_or("(none)"),
            trackers.len()
        );

        Ok(MagnetLink {
            info_hash,
            display_name,
            trackers,
            exact_sources,
            total_size,
        })
    }

    /// Extract info hash from an `xt` value of the form `urn:btih:<hash>`,
    /// where the hash is 40 hex characters or 32 base32 characters.
    fn extract_info_hash(xt_value: &str) -> Result<Option<[u8; 20]>> {
        let Some(hash_str) = xt_value.strip_prefix("urn:btih:") else {
            debug!("xt parameter is not a BitTorrent info hash: {}", xt_value);
            return Ok(None);
        };

        let decoded = match hash_str.len() {
            40 => hex::decode(hash_str).ok(),
            32 => decode_base32(hash_str),
            other => {
                warn!("Info hash has invalid length: {}", other);
                None
            }
        };

        match decoded {
            Some(bytes) if bytes.len() == 20 => {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&bytes);
                Ok(Some(hash))
            }
            _ => Err(TorrentError::invalid_source_with_source(
                "Malformed info hash",
                hash_str.to_string(),
            ).into()),
        }
    }

    /// Check if a string looks like a magnet link
    pub fn is_magnet_link(input: &str) -> bool {
        input.trim().starts_with("magnet:")
    }
}

/// RFC 4648 base32 without padding, case-insensitive
fn decode_base32(input: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u64 = 0;
    let mut bits = 0u32;

    for c in input.bytes() {
        let value = match c.to_ascii_uppercase() {
            b @ b'A'..=b'Z' => b - b'A',
            b @ b'2'..=b'7' => b - b'2' + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | value as u64;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BIG_BUCK_BUNNY_MAGNET: &str = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&dn=Big+Buck+Bunny&tr=udp%3A%2F%2Fexplodie.org%3A6969&tr=udp%3A%2F%2Ftracker.opentrackr.org%3A1337&tr=wss%3A%2F%2Ftracker.btorrent.xyz&xs=https%3A%2F%2Fwebtorrent.io%2Ftorrents%2Fbig-buck-bunny.torrent";

    #[test]
    fn test_parse_big_buck_bunny_magnet() {
        let link = MagnetParser::parse(BIG_BUCK_BUNNY_MAGNET).unwrap();
        assert_eq!(hex::encode(link.info_hash), "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c");
        assert_eq!(link.display_name, Some("Big Buck Bunny".to_string()));
        assert_eq!(link.trackers.len(), 3);
        assert_eq!(link.exact_sources, vec!["https://webtorrent.io/torrents/big-buck-bunny.torrent".to_string()]);
    }

    #[test]
    fn test_parse_base32_info_hash() {
        // Same hash as above, base32 encoded
        let magnet = "magnet:?xt=urn:btih:3WBFL3G4PSSV7MF37AJSHWDQMLNR63I4";
        let link = MagnetParser::parse(magnet).unwrap();
        assert_eq!(hex::encode(link.info_hash), "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c");
    }

    #[test]
    fn test_duplicate_trackers_collapsed() {
        let magnet = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&tr=http://t1&tr=http://t1&tr=http://t2";
        let link = MagnetParser::parse(magnet).unwrap();
        assert_eq!(link.trackers, vec!["http://t1".to_string(), "http://t2".to_string()]);
    }

    #[test]
    fn test_parse_magnet_with_size() {
        let magnet = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&xl=1234567890";
        let link = MagnetParser::parse(magnet).unwrap();
        assert_eq!(link.total_size, Some(1234567890));
    }

    #[test]
    fn test_missing_info_hash_is_invalid_source() {
        let err = MagnetParser::parse("magnet:?dn=Test").unwrap_err();
        let err = err.downcast_ref::<TorrentError>().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidSource);
    }

    #[test]
    fn test_parse_invalid_scheme() {
        assert!(MagnetParser::parse("http:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c").is_err());
        assert!(MagnetParser::parse("not-a-magnet-link").is_err());
    }

    #[test]
    fn test_extract_info_hash_invalid_length() {
        assert!(MagnetParser::extract_info_hash("urn:btih:dd8255ecdc7ca55f").is_err());
        assert!(MagnetParser::extract_info_hash("urn:sha1:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c").unwrap().is_none());
    }

    #[test]
    fn test_is_magnet_link() {
        assert!(MagnetParser::is_magnet_link("  magnet:?xt=urn:btih:abc  "));
        assert!(!MagnetParser::is_magnet_link("http://example.com"));
        assert!(!MagnetParser::is_magnet_link("example.torrent"));
    }
}
