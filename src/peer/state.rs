//! Peer state module
//!
//! Per-connection state record and throughput measurement.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::bitfield::Bitfield;
use crate::protocol::PeerCapabilities;

/// Lifecycle of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connect in progress
    Connecting,
    /// Exchanging handshakes
    Handshaking,
    /// Handshake verified, messages flowing
    Established,
    /// Teardown in progress
    Closing,
    /// Connection gone
    Closed,
}

impl ConnectionState {
    /// Whether moving to `next` is a legal transition. Any state may
    /// jump straight to `Closed`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Handshaking, Established)
                | (Established, Closing)
                | (Connecting, Closing)
                | (Handshaking, Closing)
                | (Closing, Closed)
        ) || (next == Closed && self != Closed)
    }

    /// Check if messages can be exchanged
    pub fn is_established(&self) -> bool {
        matches!(self, ConnectionState::Established)
    }
}

/// Moving average of bytes per second over fixed sampling windows
#[derive(Debug, Clone)]
pub struct Throughput {
    window: Duration,
    window_start: Instant,
    window_bytes: u64,
    rate: f64,
}

impl Throughput {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            window_start: Instant::now(),
            window_bytes: 0,
            rate: 0.0,
        }
    }

    /// Record `bytes` transferred at `now`
    pub fn record(&mut self, bytes: u64, now: Instant) {
        self.roll(now);
        self.window_bytes += bytes;
    }

    /// Close the current window if it has elapsed
    pub fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= self.window {
            let sample = self.window_bytes as f64 / elapsed.as_secs_f64();
            self.rate = if self.rate == 0.0 { sample } else { 0.6 * sample + 0.4 * self.rate };
            self.window_start = now;
            self.window_bytes = 0;
        }
    }

    /// Current rate in bytes per second
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Default for Throughput {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// State of one peer connection, owned by its connection task and
/// published to the session as read-only snapshots.
#[derive(Debug, Clone)]
pub struct PeerState {
    /// Peer address
    pub addr: SocketAddr,
    /// Peer identifier, known after the handshake
    pub peer_id: Option<[u8; 20]>,
    /// Connection lifecycle state
    pub connection: ConnectionState,
    /// We're choking them
    pub am_choking: bool,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested
    pub peer_interested: bool,
    /// Pieces they advertise
    pub bitfield: Bitfield,
    /// Requests sent and not yet answered
    pub outstanding: usize,
    /// Capabilities from the handshake reserved bytes
    pub capabilities: PeerCapabilities,
    /// Block payload bytes received
    pub bytes_downloaded: u64,
    /// Download rate from this peer in bytes per second
    pub download_rate: f64,
}

impl PeerState {
    /// Create a new peer record for a torrent with `piece_count` pieces
    pub fn new(addr: SocketAddr, piece_count: usize) -> Self {
        Self {
            addr,
            peer_id: None,
            connection: ConnectionState::Connecting,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: Bitfield::new(piece_count),
            outstanding: 0,
            capabilities: PeerCapabilities::default(),
            bytes_downloaded: 0,
            download_rate: 0.0,
        }
    }

    /// Check if peer has specific piece
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has(index as usize)
    }

    /// Check if a new request may be sent under the outstanding cap
    pub fn can_request(&self, max_outstanding: usize) -> bool {
        self.connection.is_established() && !self.peer_choking && self.outstanding < max_outstanding
    }

    /// Get the peer ID as a hex string
    pub fn peer_id_hex(&self) -> Option<String> {
        self.peer_id.map(hex::encode)
    }
}
