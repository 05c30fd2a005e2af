//! Metadata resolution
//!
//! Turns a user-supplied source (descriptor bytes, a filesystem path, an
//! HTTP(S) URL or a magnet URI) into a [`TorrentInfo`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::TorrentError;
use crate::torrent::info::TorrentInfo;
use crate::torrent::magnet::{MagnetLink, MagnetParser};
use crate::torrent::parser::TorrentParser;

/// Upper bound on a descriptor fetched over HTTP
#[cfg(feature = "download")]
const MAX_DESCRIPTOR_SIZE: usize = 16 * 1024 * 1024;

/// Where a torrent's metadata comes from
#[derive(Debug, Clone)]
pub enum TorrentSource {
    /// Raw descriptor bytes
    Bytes(Vec<u8>),
    /// Path to a descriptor on disk
    Path(PathBuf),
    /// HTTP(S) URL serving a descriptor
    Url(Url),
    /// Magnet URI
    Magnet(MagnetLink),
}

impl TorrentSource {
    /// Classify a textual source: `magnet:` URIs, `http(s)://` URLs, and
    /// anything else as a filesystem path.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TorrentError::invalid_source("Empty torrent source").into());
        }

        if MagnetParser::is_magnet_link(input) {
            return Ok(TorrentSource::Magnet(MagnetParser::parse(input)?));
        }

        let lower = input.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let url = Url::parse(input).map_err(TorrentError::from)?;
            return Ok(TorrentSource::Url(url));
        }

        if let Some((scheme, _)) = input.split_once("://") {
            warn!("Unsupported source scheme: {}", scheme);
            return Err(TorrentError::invalid_source_with_source("Unsupported source scheme", scheme.to_string()).into());
        }

        Ok(TorrentSource::Path(PathBuf::from(input)))
    }

    /// Short description for logging
    pub fn describe(&self) -> String {
        match self {
            TorrentSource::Bytes(bytes) => format!("<{} descriptor bytes>", bytes.len()),
            TorrentSource::Path(path) => path.display().to_string(),
            TorrentSource::Url(url) => url.to_string(),
            TorrentSource::Magnet(link) => format!("magnet {}", hex::encode(link.info_hash)),
        }
    }
}

impl std::str::FromStr for TorrentSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        TorrentSource::parse(s)
    }
}

impl From<PathBuf> for TorrentSource {
    fn from(path: PathBuf) -> Self {
        TorrentSource::Path(path)
    }
}

impl From<Vec<u8>> for TorrentSource {
    fn from(bytes: Vec<u8>) -> Self {
        TorrentSource::Bytes(bytes)
    }
}

/// Metadata exchange capability for magnet links.
///
/// Implementations return the bencoded info dictionary; the resolver
/// checks it against the magnet's info-hash.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    async fn fetch_info_dict(&self, link: &MagnetLink) -> Result<Vec<u8>>;
}

/// Outcome of loading a source without network metadata exchange
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Metadata is fully known
    Ready(TorrentInfo),
    /// Only the magnet link is known; metadata must be fetched
    Pending(MagnetLink),
}

impl Resolution {
    /// Info-hash identifying the torrent
    pub fn info_hash(&self) -> [u8; 20] {
        match self {
            Resolution::Ready(info) => info.info_hash,
            Resolution::Pending(link) => link.info_hash,
        }
    }
}

/// Resolves sources into torrent metadata
#[derive(Clone, Default)]
pub struct MetadataResolver {
    #[cfg(feature = "download")]
    client: reqwest::Client,
    fetcher: Option<Arc<dyn MetadataFetcher>>,
}

impl std::fmt::Debug for MetadataResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataResolver")
            .field("fetcher", &self.fetcher.is_some())
            .finish()
    }
}

impl MetadataResolver {
    /// Create a resolver without a metadata-exchange capability
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a metadata-exchange capability used for magnet links
    pub fn with_fetcher(mut self, fetcher: Arc<dyn MetadataFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Resolve a source all the way to [`TorrentInfo`]
    pub async fn resolve(&self, source: TorrentSource) -> Result<TorrentInfo> {
        match self.load(source).await? {
            Resolution::Ready(info) => Ok(info),
            Resolution::Pending(link) => self.resolve_magnet(&link).await,
        }
    }

    /// Load a descriptor source, leaving magnet links pending
    pub async fn load(&self, source: TorrentSource) -> Result<Resolution> {
        info!("Loading torrent source: {}", source.describe());
        match source {
            TorrentSource::Bytes(bytes) => Ok(Resolution::Ready(TorrentParser::parse_bytes(&bytes)?)),
            TorrentSource::Path(path) => {
                let bytes = tokio::fs::read(&path).await.map_err(|e| {
                    error!("Failed to read torrent file '{}': {}", path.display(), e);
                    TorrentError::io_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
                })?;
                debug!("Read {} bytes from {}", bytes.len(), path.display());
                Ok(Resolution::Ready(TorrentParser::parse_bytes(&bytes)?))
            }
            TorrentSource::Url(url) => {
                let bytes = self.fetch_descriptor(&url).await?;
                Ok(Resolution::Ready(TorrentParser::parse_bytes(&bytes)?))
            }
            TorrentSource::Magnet(link) => Ok(Resolution::Pending(link)),
        }
    }

    /// Obtain metadata for a magnet link from its exact sources, then
    /// from the metadata-exchange capability.
    pub async fn resolve_magnet(&self, link: &MagnetLink) -> Result<TorrentInfo> {
        let hash_hex = hex::encode(link.info_hash);
        info!("Resolving metadata for magnet {}", hash_hex);

        for source in &link.exact_sources {
            let url = match Url::parse(source) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => url,
                _ => {
                    debug!("Skipping unsupported exact source: {}", source);
                    continue;
                }
            };

            let parsed = match self.fetch_descriptor(&url).await {
                Ok(bytes) => TorrentParser::parse_bytes(&bytes),
                Err(e) => Err(e),
            };
            match parsed {
                Ok(info) if info.info_hash == link.info_hash => {
                    info!("Resolved magnet {} from exact source {}", hash_hex, url);
                    return Ok(merge_trackers(info, &link.trackers));
                }
                Ok(info) => warn!(
                    "Exact source {} has info hash {}, expected {}",
                    url,
                    info.info_hash_hex(),
                    hash_hex
                ),
                Err(e) => warn!("Exact source {} failed: {}", url, e),
            }
        }

        if let Some(fetcher) = &self.fetcher {
            match fetcher.fetch_info_dict(link).await {
                Ok(bytes) => match TorrentParser::parse_info_dict(&bytes, link.trackers.clone()) {
                    Ok(info) if info.info_hash == link.info_hash => {
                        info!("Resolved magnet {} via metadata exchange", hash_hex);
                        return Ok(info);
                    }
                    Ok(info) => warn!("Fetched metadata has info hash {}, expected {}", info.info_hash_hex(), hash_hex),
                    Err(e) => warn!("Fetched metadata is invalid: {}", e),
                },
                Err(e) => warn!("Metadata exchange failed for {}: {}", hash_hex, e),
            }
        }

        error!("Could not resolve metadata for magnet {}", hash_hex);
        Err(TorrentError::unresolved_metadata("No source could supply the torrent metadata", &link.info_hash).into())
    }

    #[cfg(feature = "download")]
    async fn fetch_descriptor(&self, url: &Url) -> Result<Vec<u8>> {
        info!("Fetching torrent descriptor from {}", url);
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(TorrentError::from)?;
        let bytes = response.bytes().await.map_err(TorrentError::from)?;
        if bytes.len() > MAX_DESCRIPTOR_SIZE {
            return Err(TorrentError::invalid_descriptor_with_source(
                "Descriptor too large",
                format!("{} bytes", bytes.len()),
            ).into());
        }
        debug!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }

    #[cfg(not(feature = "download"))]
    async fn fetch_descriptor(&self, url: &Url) -> Result<Vec<u8>> {
        Err(TorrentError::invalid_source_with_source("HTTP support is disabled", url.to_string()).into())
    }
}

fn merge_trackers(mut info: TorrentInfo, extra: &[String]) -> TorrentInfo {
    for url in extra {
        if !info.trackers.contains(url) {
            info.trackers.push(url.clone());
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::build_torrent;

    struct StaticFetcher(Vec<u8>);

    #[async_trait]
    impl MetadataFetcher for StaticFetcher {
        async fn fetch_info_dict(&self, _link: &MagnetLink) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    fn kind_of(err: &anyhow::Error) -> ErrorKind {
        err.downcast_ref::<TorrentError>().map(|e| e.kind()).unwrap()
    }

    fn magnet_for(hash: &[u8; 20]) -> MagnetLink {
        MagnetLink {
            info_hash: *hash,
            display_name: None,
            trackers: vec!["udp://tracker.test:6969".to_string()],
            exact_sources: vec![],
            total_size: None,
        }
    }

    #[test]
    fn test_classify_sources() {
        assert!(matches!(TorrentSource::parse("magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c").unwrap(), TorrentSource::Magnet(_)));
        assert!(matches!(TorrentSource::parse("https://example.com/a.torrent").unwrap(), TorrentSource::Url(_)));
        assert!(matches!(TorrentSource::parse("HTTP://example.com/a.torrent").unwrap(), TorrentSource::Url(_)));
        assert!(matches!(TorrentSource::parse("./files/a.torrent").unwrap(), TorrentSource::Path(_)));
    }

    #[test]
    fn test_invalid_sources() {
        assert_eq!(kind_of(&TorrentSource::parse("   ").unwrap_err()), ErrorKind::InvalidSource);
        assert_eq!(kind_of(&TorrentSource::parse("ftp://host/a.torrent").unwrap_err()), ErrorKind::InvalidSource);
        assert_eq!(kind_of(&TorrentSource::parse("magnet:?dn=x").unwrap_err()), ErrorKind::InvalidSource);
    }

    #[tokio::test]
    async fn test_resolve_path() {
        let fixture = build_torrent("file.bin", &[3u8; 5000], 1024);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.torrent");
        std::fs::write(&path, &fixture.bytes).unwrap();

        let info = MetadataResolver::new().resolve(TorrentSource::Path(path)).await.unwrap();
        assert_eq!(info.info_hash, fixture.info_hash);
    }

    #[tokio::test]
    async fn test_missing_path_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MetadataResolver::new()
            .resolve(TorrentSource::Path(dir.path().join("nope.torrent")))
            .await
            .unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::IoError);
    }

    #[tokio::test]
    async fn test_magnet_without_capability_is_unresolved() {
        let resolver = MetadataResolver::new();
        let resolution = resolver.load(TorrentSource::Magnet(magnet_for(&[5u8; 20]))).await.unwrap();
        let Resolution::Pending(link) = resolution else {
            panic!("magnet should stay pending");
        };
        let err = resolver.resolve_magnet(&link).await.unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::UnresolvedMetadata);
    }

    #[tokio::test]
    async fn test_magnet_resolved_by_fetcher() {
        let fixture = build_torrent("file.bin", &[3u8; 5000], 1024);
        let resolver = MetadataResolver::new().with_fetcher(Arc::new(StaticFetcher(fixture.info_bytes.clone())));
        let info = resolver.resolve(TorrentSource::Magnet(magnet_for(&fixture.info_hash))).await.unwrap();
        assert_eq!(info.info_hash, fixture.info_hash);
        assert_eq!(info.trackers, vec!["udp://tracker.test:6969".to_string()]);
    }

    #[tokio::test]
    async fn test_fetcher_hash_mismatch_rejected() {
        let fixture = build_torrent("file.bin", &[3u8; 5000], 1024);
        let resolver = MetadataResolver::new().with_fetcher(Arc::new(StaticFetcher(fixture.info_bytes.clone())));
        let err = resolver.resolve(TorrentSource::Magnet(magnet_for(&[1u8; 20]))).await.unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::UnresolvedMetadata);
    }
}
