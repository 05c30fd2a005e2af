//! Peer module
//!
//! Peer connection tasks and their state.

pub mod connection;
pub mod state;

// Re-export main types
pub use connection::{attach, connect, ConnectionParams, PeerCommand, PeerEvent, PeerEventKind, PeerHandle};
pub use state::{ConnectionState, PeerState, Throughput};
