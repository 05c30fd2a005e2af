//! Torrent metadata module
//!
//! Parsing of `.torrent` descriptors and magnet links, and resolution of
//! any supported source into a [`TorrentInfo`].

pub mod info;
pub mod magnet;
pub mod parser;
pub mod resolver;

pub use info::{FileSlice, TorrentFile, TorrentInfo};
pub use magnet::{MagnetLink, MagnetParser};
pub use parser::TorrentParser;
pub use resolver::{MetadataFetcher, MetadataResolver, Resolution, TorrentSource};
