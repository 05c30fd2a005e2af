//! BitTorrent peer wire protocol
//!
//! Handshake, message codec and stream framing.

pub mod handshake;
pub mod message;
pub mod wire;

pub use handshake::{Handshake, PeerCapabilities, HANDSHAKE_LENGTH, PROTOCOL_STRING};
pub use message::{BlockInfo, Message, MessageId};
pub use wire::{BitTorrentWire, WireProtocol};
