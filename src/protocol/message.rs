//! Peer wire messages
//!
//! Encoding and decoding of the length-prefixed messages exchanged after
//! the handshake.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use anyhow::Result;
use tracing::{error, trace};

use crate::error::TorrentError;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = TorrentError;

    fn try_from(value: u8) -> std::result::Result<Self, TorrentError> {
        Ok(match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            _ => {
                error!("Invalid message ID: {}", value);
                return Err(TorrentError::protocol_error_with_source("Invalid message ID", format!("value: {}", value)));
            }
        })
    }
}

/// A block coordinate: piece index, byte offset, length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// Peer wire protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Bytes },
    Request(BlockInfo),
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel(BlockInfo),
    Port { listen_port: u16 },
}

impl Message {
    /// Get the message ID (None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel(_) => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
        }
    }

    /// Payload length, excluding the 4-byte length prefix
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request(_) | Message::Cancel(_) => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
        }
    }

    /// Append the length-prefixed encoding to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(4 + self.length() as usize);
        buf.put_u32(self.length());
        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request(block) | Message::Cancel(block) => {
                buf.put_u32(block.index);
                buf.put_u32(block.begin);
                buf.put_u32(block.length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            _ => {}
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Decode a message payload (the bytes after the length prefix)
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = MessageId::try_from(payload.get_u8())?;
        trace!("Decoding {:?} with {} payload bytes", id, payload.remaining());

        let expect = |len: usize, payload: &Bytes| -> Result<()> {
            if payload.remaining() != len {
                error!("{:?} message has wrong length: expected {}, got {}", id, len, payload.remaining());
                return Err(TorrentError::protocol_error_with_source(
                    format!("{:?} message has wrong length", id),
                    format!("expected {}, got {}", len, payload.remaining()),
                )
                .into());
            }
            Ok(())
        };

        let message = match id {
            MessageId::Choke => {
                expect(0, &payload)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect(0, &payload)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect(0, &payload)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect(0, &payload)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect(4, &payload)?;
                Message::Have { piece_index: payload.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: payload },
            MessageId::Request | MessageId::Cancel => {
                expect(12, &payload)?;
                let block = BlockInfo {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                };
                if id == MessageId::Request {
                    Message::Request(block)
                } else {
                    Message::Cancel(block)
                }
            }
            MessageId::Piece => {
                if payload.remaining() < 8 {
                    return Err(TorrentError::protocol_error_with_source(
                        "Piece message too short",
                        format!("expected at least 8 bytes, got {}", payload.remaining()),
                    )
                    .into());
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece { index, begin, block: payload }
            }
            MessageId::Port => {
                expect(2, &payload)?;
                Message::Port { listen_port: payload.get_u16() }
            }
        };

        Ok(message)
    }

    /// Decode a full frame including its length prefix
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(TorrentError::protocol_error("Message shorter than length prefix").into());
        }
        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() - 4 != length {
            return Err(TorrentError::protocol_error_with_source(
                "Length prefix does not match frame size",
                format!("prefix {}, frame {}", length, data.len() - 4),
            ).into());
        }
        Self::decode(Bytes::copy_from_slice(&data[4..]))
    }
}
