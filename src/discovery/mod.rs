//! Peer discovery
//!
//! Sources of candidate peer addresses behind one [`PeerDiscovery`]
//! trait: HTTP and UDP trackers, static peer lists, and anything else
//! (such as a DHT client) that can answer an announce. [`PeerSource`]
//! merges them into one de-duplicated stream for a session.

#[cfg(feature = "download")]
pub mod http;
pub mod source;
pub mod static_peers;
pub mod udp;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::TorrentError;

#[cfg(feature = "download")]
pub use http::HttpTracker;
pub use source::{Deduplicator, DiscoveryEvent, PeerSource, PeerSourceHandle, TransferStats};
pub use static_peers::StaticPeers;
pub use udp::UdpTracker;

/// Announce events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    /// Query-string value for HTTP trackers
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::None => None,
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Completed => Some("completed"),
        }
    }

    /// Event code for UDP trackers
    pub fn udp_code(&self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }
}

/// Parameters of one announce
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

/// Result of one announce
#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    /// Suggested time until the next announce
    pub interval: Option<Duration>,
    /// Minimum time until the next announce
    pub min_interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
}

impl AnnounceResponse {
    /// Delay before the next announce, falling back to `default`
    pub fn next_announce(&self, default: Duration) -> Duration {
        let interval = self.interval.unwrap_or(default);
        match self.min_interval {
            Some(min) => interval.max(min),
            None => interval,
        }
    }
}

/// A source of peer addresses
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    /// Announce and return the peers the source knows about
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse>;

    /// Short name for logs
    fn name(&self) -> &str;
}

/// Decode a compact IPv4 peer list: 4 address bytes then a big-endian port
pub fn parse_compact_peers(data: &[u8]) -> Result<Vec<SocketAddr>> {
    if data.len() % 6 != 0 {
        return Err(TorrentError::protocol_error_with_source(
            "Compact peer list length is not a multiple of 6",
            format!("{} bytes", data.len()),
        ).into());
    }

    Ok(data
        .chunks_exact(6)
        .map(|c| SocketAddr::from((Ipv4Addr::new(c[0], c[1], c[2], c[3]), u16::from_be_bytes([c[4], c[5]]))))
        .filter(|addr| addr.port() != 0)
        .collect())
}
