//! Wire framing
//!
//! Reads and writes handshakes and length-prefixed messages on any
//! async byte stream.

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, trace};

use super::handshake::{Handshake, HANDSHAKE_LENGTH};
use super::message::Message;
use crate::error::TorrentError;

/// Largest message payload accepted from a peer
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 2 * 1024 * 1024;

/// Framing operations for the peer wire protocol
pub trait WireProtocol {
    /// Read a complete message from the stream
    async fn read_message<R: AsyncRead + Unpin + Send>(&mut self, reader: &mut R) -> Result<Message>;

    /// Write a message to the stream
    async fn write_message<W: AsyncWrite + Unpin + Send>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read a handshake from the stream
    async fn read_handshake<R: AsyncRead + Unpin + Send>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write a handshake to the stream
    async fn write_handshake<W: AsyncWrite + Unpin + Send>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Default implementation of [`WireProtocol`]
#[derive(Debug, Clone)]
pub struct BitTorrentWire {
    max_message_len: usize,
    write_buf: BytesMut,
}

impl Default for BitTorrentWire {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LEN)
    }
}

impl BitTorrentWire {
    /// Create a codec rejecting payloads longer than `max_message_len`
    pub fn new(max_message_len: usize) -> Self {
        Self {
            max_message_len,
            write_buf: BytesMut::with_capacity(32 * 1024),
        }
    }
}

impl WireProtocol for BitTorrentWire {
    async fn read_message<R: AsyncRead + Unpin + Send>(&mut self, reader: &mut R) -> Result<Message> {
        let length = reader.read_u32().await? as usize;
        if length == 0 {
            trace!("Read keep-alive");
            return Ok(Message::KeepAlive);
        }

        if length > self.max_message_len {
            error!("Peer message too large: {} bytes", length);
            return Err(TorrentError::protocol_error_with_source(
                "Message exceeds maximum length",
                format!("{} > {}", length, self.max_message_len),
            ).into());
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;
        Message::decode(Bytes::from(payload))
    }

    async fn write_message<W: AsyncWrite + Unpin + Send>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        self.write_buf.clear();
        message.encode(&mut self.write_buf);
        writer.write_all(&self.write_buf).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_handshake<R: AsyncRead + Unpin + Send>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        reader.read_exact(&mut buf).await?;
        Handshake::deserialize(&buf)
    }

    async fn write_handshake<W: AsyncWrite + Unpin + Send>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer.write_all(&handshake.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }
}
