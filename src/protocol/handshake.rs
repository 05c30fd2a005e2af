//! BitTorrent handshake
//!
//! The 68-byte opening exchange: protocol string, reserved capability
//! bits, info-hash and peer id.

use bytes::{BufMut, BytesMut};
use anyhow::Result;
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total handshake length on the wire
pub const HANDSHAKE_LENGTH: usize = 68;

/// Prefix of peer ids generated by this client
pub const PEER_ID_PREFIX: &[u8; 8] = b"-TF0100-";

/// Capabilities advertised through the reserved handshake bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCapabilities {
    reserved: [u8; 8],
}

impl PeerCapabilities {
    /// Bit for the extension protocol (reserved byte 5, 0x10)
    const EXTENSION_PROTOCOL: (usize, u8) = (5, 0x10);
    /// Bit for DHT support (reserved byte 7, 0x01)
    const DHT: (usize, u8) = (7, 0x01);
    /// Bit for the fast extension (reserved byte 7, 0x04)
    const FAST: (usize, u8) = (7, 0x04);

    /// Wrap raw reserved bytes
    pub fn from_reserved(reserved: [u8; 8]) -> Self {
        Self { reserved }
    }

    /// Raw reserved bytes
    pub fn reserved(&self) -> [u8; 8] {
        self.reserved
    }

    fn has(&self, (byte, mask): (usize, u8)) -> bool {
        self.reserved[byte] & mask != 0
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.has(Self::EXTENSION_PROTOCOL)
    }

    pub fn supports_dht(&self) -> bool {
        self.has(Self::DHT)
    }

    pub fn supports_fast(&self) -> bool {
        self.has(Self::FAST)
    }
}

/// BitTorrent handshake message
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Reserved capability bytes
    pub capabilities: PeerCapabilities,
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake with no capabilities advertised
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        debug!("Creating new handshake for info_hash: {}", hex::encode(info_hash));
        Self {
            capabilities: PeerCapabilities::default(),
            info_hash,
            peer_id,
        }
    }

    /// Generate a random peer ID with the client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        info!("Generated new peer ID: {}", hex::encode(peer_id));
        peer_id
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing handshake");
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LENGTH);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.capabilities.reserved());
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize a handshake from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());

        if data.len() < HANDSHAKE_LENGTH {
            error!("Handshake data too short: expected 68 bytes, got {}", data.len());
            return Err(TorrentError::protocol_error_with_source(
                "Handshake data too short",
                format!("expected 68 bytes, got {}", data.len()),
            ).into());
        }

        if data[0] != PROTOCOL_LENGTH || &data[1..20] != PROTOCOL_STRING {
            error!("Invalid protocol header in handshake");
            return Err(TorrentError::protocol_error("Invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        debug!(
            "Handshake from peer {} for info_hash {} (reserved {})",
            hex::encode(peer_id),
            hex::encode(info_hash),
            hex::encode(reserved)
        );

        Ok(Self {
            capabilities: PeerCapabilities::from_reserved(reserved),
            info_hash,
            peer_id,
        })
    }

    /// Validate the handshake against the expected info hash
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!("Handshake validation failed: info hash mismatch");
            warn!("  Expected: {}", hex::encode(expected_info_hash));
            warn!("  Got:      {}", hex::encode(self.info_hash));
            return false;
        }
        true
    }
}
