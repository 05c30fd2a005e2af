//! torrent-fetch
//!
//! A BitTorrent download engine: descriptor and magnet resolution, tracker
//! discovery, peer wire connections, rarest-first scheduling with endgame,
//! verified piece storage with resume, and a process-wide [`Engine`].

pub mod bitfield;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod torrent;

#[cfg(test)]
mod testing;

pub use bitfield::Bitfield;
pub use cli::{CliArgs, Config, ProgressDisplay};
pub use config::{AddOptions, EngineConfig};
pub use discovery::{PeerDiscovery, PeerSource};
pub use engine::Engine;
pub use error::{ErrorKind, TorrentError};
pub use peer::PeerState;
pub use protocol::{Handshake, Message, MessageId, PeerCapabilities};
pub use scheduler::PieceScheduler;
pub use session::{SessionEvent, SessionHandle, SessionProgress, SessionState};
pub use storage::{FileStorage, PieceStore};
pub use torrent::{MagnetLink, MetadataResolver, TorrentInfo, TorrentParser, TorrentSource};
