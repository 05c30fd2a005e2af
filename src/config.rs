//! Engine configuration
//!
//! Tunables shared by every session an [`Engine`](crate::Engine) runs,
//! plus the per-torrent [`AddOptions`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::error::TorrentError;
use crate::protocol::Handshake;

/// Standard block size requested over the wire (16 KiB)
pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// Engine-wide configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Peer id sent in handshakes and tracker announces
    pub peer_id: [u8; 20],
    /// Port reported to trackers
    pub listen_port: u16,
    /// Maximum concurrent peer connections per torrent
    pub max_peers: usize,
    /// Maximum outstanding block requests per peer
    pub max_outstanding_requests: usize,
    /// Block size used for requests
    pub block_size: u32,
    /// Endgame starts once fewer than this many pieces are not yet verified
    pub endgame_threshold: usize,
    /// A block request older than this is re-queued
    pub request_timeout: Duration,
    /// A peer silent for this long is dropped
    pub idle_timeout: Duration,
    /// Keep-alive interval on established connections
    pub keepalive_interval: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Handshake exchange timeout
    pub handshake_timeout: Duration,
    /// Per-announce timeout for trackers
    pub tracker_timeout: Duration,
    /// Re-announce interval when a source does not supply one
    pub default_announce_interval: Duration,
    /// Window in which a repeated peer address is suppressed
    pub dedup_window: Duration,
    /// How often progress events are emitted
    pub progress_interval: Duration,
    /// How long a failed peer address is skipped before retrying
    pub peer_retry_backoff: Duration,
    /// Hash failures a peer may contribute to before it is dropped
    pub max_hash_failures: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            peer_id: Handshake::generate_peer_id(),
            listen_port: 6881,
            max_peers: 30,
            max_outstanding_requests: 5,
            block_size: DEFAULT_BLOCK_SIZE,
            endgame_threshold: 5,
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            tracker_timeout: Duration::from_secs(15),
            default_announce_interval: Duration::from_secs(300),
            dedup_window: Duration::from_secs(600),
            progress_interval: Duration::from_secs(1),
            peer_retry_backoff: Duration::from_secs(60),
            max_hash_failures: 2,
        }
    }
}

impl EngineConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        debug!("Validating engine configuration");

        let counts = [
            ("max_peers", self.max_peers),
            ("max_outstanding_requests", self.max_outstanding_requests),
            ("block_size", self.block_size as usize),
            ("max_hash_failures", self.max_hash_failures as usize),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(TorrentError::config_error_with_field("must be at least 1", field).into());
            }
        }

        let durations = [
            ("request_timeout", self.request_timeout),
            ("idle_timeout", self.idle_timeout),
            ("keepalive_interval", self.keepalive_interval),
            ("connect_timeout", self.connect_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("tracker_timeout", self.tracker_timeout),
            ("default_announce_interval", self.default_announce_interval),
            ("progress_interval", self.progress_interval),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(TorrentError::config_error_with_field("must be non-zero", field).into());
            }
        }

        if self.keepalive_interval >= self.idle_timeout {
            return Err(TorrentError::config_error_with_field(
                "must be shorter than idle_timeout",
                "keepalive_interval",
            ).into());
        }

        Ok(())
    }
}

/// Per-torrent options passed to `Engine::add`
#[derive(Debug, Clone)]
pub struct AddOptions {
    /// Directory the torrent's file layout is rooted at
    pub output_directory: PathBuf,
    /// Peers to connect to in addition to tracker results
    pub extra_peers: Vec<SocketAddr>,
    /// Whether to announce to the torrent's trackers
    pub use_trackers: bool,
}

impl AddOptions {
    /// Options writing into `output_directory` with trackers enabled
    pub fn new(output_directory: impl Into<PathBuf>) -> Self {
        Self {
            output_directory: output_directory.into(),
            extra_peers: Vec::new(),
            use_trackers: true,
        }
    }

    /// Add a static peer
    pub fn with_peer(mut self, addr: SocketAddr) -> Self {
        self.extra_peers.push(addr);
        self
    }

    /// Enable or disable tracker announces
    pub fn with_trackers(mut self, enabled: bool) -> Self {
        self.use_trackers = enabled;
        self
    }
}
