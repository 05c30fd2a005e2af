//! Error types for the download engine
//!
//! Every failure the engine can report maps onto one variant of
//! [`TorrentError`]. Peer-level and request-level variants are absorbed
//! inside a session; only session-fatal ones are surfaced to callers as
//! `error` events.

use std::fmt;

/// Error type for torrent operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// The source passed to `add()` is not a path, URL or magnet URI we accept
    InvalidSource {
        message: String,
        source: Option<String>,
    },

    /// The torrent descriptor is malformed
    InvalidDescriptor {
        message: String,
        source: Option<String>,
    },

    /// Magnet metadata could not be obtained
    UnresolvedMetadata {
        message: String,
        info_hash: Option<String>,
    },

    /// Every configured peer source failed on its first attempt
    NoPeerSourceAvailable {
        message: String,
        source: Option<String>,
    },

    /// A peer violated the wire protocol
    PeerProtocolError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// A peer connection dropped or could not be established
    ConnectionLost {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// A block request was not answered in time
    RequestTimeout {
        piece: u32,
        offset: u32,
        peer: Option<String>,
    },

    /// A completed piece did not match its recorded hash
    HashMismatch {
        piece: u32,
    },

    /// A session for this info-hash is already active
    DuplicateTorrent {
        info_hash: String,
    },

    /// Filesystem or network I/O failure
    IoError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Rejected configuration value
    ConfigError {
        message: String,
        field: Option<String>,
    },
}

/// Discriminant of [`TorrentError`], carried by `error(kind)` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidSource,
    InvalidDescriptor,
    UnresolvedMetadata,
    NoPeerSourceAvailable,
    PeerProtocolError,
    ConnectionLost,
    RequestTimeout,
    HashMismatch,
    DuplicateTorrent,
    IoError,
    ConfigError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidSource => "invalid source",
            ErrorKind::InvalidDescriptor => "invalid descriptor",
            ErrorKind::UnresolvedMetadata => "unresolved metadata",
            ErrorKind::NoPeerSourceAvailable => "no peer source available",
            ErrorKind::PeerProtocolError => "peer protocol error",
            ErrorKind::ConnectionLost => "connection lost",
            ErrorKind::RequestTimeout => "request timeout",
            ErrorKind::HashMismatch => "hash mismatch",
            ErrorKind::DuplicateTorrent => "duplicate torrent",
            ErrorKind::IoError => "I/O error",
            ErrorKind::ConfigError => "config error",
        };
        f.write_str(name)
    }
}

impl TorrentError {
    /// Create a new InvalidSource error
    pub fn invalid_source(message: impl Into<String>) -> Self {
        TorrentError::InvalidSource {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new InvalidSource error with source
    pub fn invalid_source_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::InvalidSource {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new InvalidDescriptor error
    pub fn invalid_descriptor(message: impl Into<String>) -> Self {
        TorrentError::InvalidDescriptor {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new InvalidDescriptor error with source
    pub fn invalid_descriptor_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::InvalidDescriptor {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new UnresolvedMetadata error
    pub fn unresolved_metadata(message: impl Into<String>, info_hash: &[u8; 20]) -> Self {
        TorrentError::UnresolvedMetadata {
            message: message.into(),
            info_hash: Some(hex::encode(info_hash)),
        }
    }

    /// Create a new NoPeerSourceAvailable error
    pub fn no_peer_source(message: impl Into<String>) -> Self {
        TorrentError::NoPeerSourceAvailable {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new NoPeerSourceAvailable error with source
    pub fn no_peer_source_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NoPeerSourceAvailable {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::PeerProtocolError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new PeerProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerProtocolError {
            message: message.into(),
            peer: None,
            source: Some(source.into()),
        }
    }

    /// Create a new PeerProtocolError with peer address
    pub fn protocol_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerProtocolError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new ConnectionLost error with peer address
    pub fn connection_lost(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::ConnectionLost {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new ConnectionLost error with peer and source
    pub fn connection_lost_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ConnectionLost {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new RequestTimeout error
    pub fn request_timeout(piece: u32, offset: u32, peer: impl Into<String>) -> Self {
        TorrentError::RequestTimeout {
            piece,
            offset,
            peer: Some(peer.into()),
        }
    }

    /// Create a new HashMismatch error
    pub fn hash_mismatch(piece: u32) -> Self {
        TorrentError::HashMismatch { piece }
    }

    /// Create a new DuplicateTorrent error
    pub fn duplicate_torrent(info_hash: &[u8; 20]) -> Self {
        TorrentError::DuplicateTorrent {
            info_hash: hex::encode(info_hash),
        }
    }

    /// Create a new IoError
    pub fn io_error(message: impl Into<String>) -> Self {
        TorrentError::IoError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new IoError with path
    pub fn io_error_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        TorrentError::IoError {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    /// Create a new IoError with path and source
    pub fn io_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::IoError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            TorrentError::InvalidSource { source, .. }
            | TorrentError::InvalidDescriptor { source, .. }
            | TorrentError::NoPeerSourceAvailable { source, .. }
            | TorrentError::PeerProtocolError { source, .. }
            | TorrentError::ConnectionLost { source, .. }
            | TorrentError::IoError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            _ => {}
        }
        self
    }

    /// Kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TorrentError::InvalidSource { .. } => ErrorKind::InvalidSource,
            TorrentError::InvalidDescriptor { .. } => ErrorKind::InvalidDescriptor,
            TorrentError::UnresolvedMetadata { .. } => ErrorKind::UnresolvedMetadata,
            TorrentError::NoPeerSourceAvailable { .. } => ErrorKind::NoPeerSourceAvailable,
            TorrentError::PeerProtocolError { .. } => ErrorKind::PeerProtocolError,
            TorrentError::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            TorrentError::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            TorrentError::HashMismatch { .. } => ErrorKind::HashMismatch,
            TorrentError::DuplicateTorrent { .. } => ErrorKind::DuplicateTorrent,
            TorrentError::IoError { .. } => ErrorKind::IoError,
            TorrentError::ConfigError { .. } => ErrorKind::ConfigError,
        }
    }

    /// Whether this error ends a session rather than being recovered locally
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UnresolvedMetadata | ErrorKind::NoPeerSourceAvailable | ErrorKind::IoError
        )
    }
}

fn write_detail(f: &mut fmt::Formatter<'_>, label: &str, message: &str, parts: &[(&str, &Option<String>)]) -> fmt::Result {
    write!(f, "{}: {}", label, message)?;
    let present: Vec<String> = parts
        .iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| format!("{}: {}", name, v)))
        .collect();
    if !present.is_empty() {
        write!(f, " ({})", present.join(", "))?;
    }
    Ok(())
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::InvalidSource { message, source } => {
                write_detail(f, "Invalid source", message, &[("source", source)])
            }
            TorrentError::InvalidDescriptor { message, source } => {
                write_detail(f, "Invalid descriptor", message, &[("source", source)])
            }
            TorrentError::UnresolvedMetadata { message, info_hash } => {
                write_detail(f, "Unresolved metadata", message, &[("info_hash", info_hash)])
            }
            TorrentError::NoPeerSourceAvailable { message, source } => {
                write_detail(f, "No peer source available", message, &[("source", source)])
            }
            TorrentError::PeerProtocolError { message, peer, source } => {
                write_detail(f, "Peer protocol error", message, &[("peer", peer), ("source", source)])
            }
            TorrentError::ConnectionLost { message, peer, source } => {
                write_detail(f, "Connection lost", message, &[("peer", peer), ("source", source)])
            }
            TorrentError::RequestTimeout { piece, offset, peer } => {
                let message = format!("piece {} offset {}", piece, offset);
                write_detail(f, "Request timeout", &message, &[("peer", peer)])
            }
            TorrentError::HashMismatch { piece } => {
                write!(f, "Hash mismatch: piece {}", piece)
            }
            TorrentError::DuplicateTorrent { info_hash } => {
                write!(f, "Duplicate torrent: {} is already active", info_hash)
            }
            TorrentError::IoError { message, path, source } => {
                write_detail(f, "I/O error", message, &[("path", path), ("source", source)])
            }
            TorrentError::ConfigError { message, field } => {
                write_detail(f, "Config error", message, &[("field", field)])
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::IoError {
            message: err.to_string(),
            path: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::invalid_descriptor_with_source("Failed to decode bencode data", err.to_string())
    }
}

impl From<url::ParseError> for TorrentError {
    fn from(err: url::ParseError) -> Self {
        TorrentError::invalid_source_with_source("Failed to parse URL", err.to_string())
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::config_error(format!("Failed to parse address: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::ConnectionLost {
            message: "Operation timed out".to_string(),
            peer: None,
            source: None,
        }
    }
}

#[cfg(feature = "download")]
impl From<reqwest::Error> for TorrentError {
    fn from(err: reqwest::Error) -> Self {
        TorrentError::IoError {
            message: "HTTP request failed".to_string(),
            path: err.url().map(|u| u.to_string()),
            source: Some(err.to_string()),
        }
    }
}
