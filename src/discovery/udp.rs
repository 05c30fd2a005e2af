//! UDP tracker client
//!
//! Connect and announce exchanges of the UDP tracker protocol. Packet
//! building and parsing are plain functions so they can be checked
//! without a socket.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use super::{parse_compact_peers, AnnounceRequest, AnnounceResponse, PeerDiscovery};
use crate::error::TorrentError;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const RESPONSE_CONNECT_LEN: usize = 16;
const RESPONSE_HEADER_LEN: usize = 20;
/// Sends per exchange before giving up
const MAX_ATTEMPTS: u32 = 4;
/// Wait for the first reply; doubled after every unanswered send
const FIRST_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Announces over UDP
#[derive(Debug, Clone)]
pub struct UdpTracker {
    url: String,
    attempt_timeout: Duration,
}

impl UdpTracker {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_attempt_timeout(url, FIRST_ATTEMPT_TIMEOUT)
    }

    /// Tracker whose first send waits `attempt_timeout` for a reply
    pub fn with_attempt_timeout(url: impl Into<String>, attempt_timeout: Duration) -> Self {
        Self { url: url.into(), attempt_timeout }
    }

    /// Send `packet` until a reply arrives, backing off between sends.
    /// Returns the reply length.
    async fn exchange(&self, socket: &UdpSocket, packet: &[u8], buf: &mut [u8]) -> Result<usize> {
        let mut wait = self.attempt_timeout;
        for attempt in 1..=MAX_ATTEMPTS {
            socket.send(packet).await?;
            match timeout(wait, socket.recv(buf)).await {
                Ok(received) => return Ok(received?),
                Err(_) => {
                    debug!("No reply from {} within {:?} (attempt {})", self.url, wait, attempt);
                    wait *= 2;
                }
            }
        }
        Err(TorrentError::no_peer_source(format!("{} did not reply after {} attempts", self.url, MAX_ATTEMPTS)).into())
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let host_port = parse_udp_url(&self.url)?;
        lookup_host(host_port)
            .await
            .map_err(|e| TorrentError::no_peer_source_with_source(format!("Cannot resolve {}", self.url), e.to_string()))?
            .next()
            .ok_or_else(|| TorrentError::no_peer_source(format!("No address for {}", self.url)).into())
    }
}

#[async_trait]
impl PeerDiscovery for UdpTracker {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let addr = self.resolve().await?;
        let bind: SocketAddr = if addr.is_ipv4() { ([0, 0, 0, 0], 0).into() } else { "[::]:0".parse()? };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        debug!("Announcing to {} ({:?})", self.url, request.event);

        let mut buf = [0u8; 1500];
        let transaction_id = rand::random::<u32>();
        let n = self.exchange(&socket, &connect_packet(transaction_id), &mut buf).await?;
        let connection_id = parse_connect_response(&buf[..n], transaction_id)?;

        let transaction_id = rand::random::<u32>();
        let packet = announce_packet(connection_id, transaction_id, rand::random(), request);
        let n = self.exchange(&socket, &packet, &mut buf).await?;
        parse_announce_response(&buf[..n], transaction_id)
    }

    fn name(&self) -> &str {
        &self.url
    }
}

/// `host:port` part of a `udp://` tracker URL
pub fn parse_udp_url(url: &str) -> Result<&str> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| TorrentError::invalid_source(format!("Not a UDP tracker URL: {}", url)))?;
    let host_port = rest.split_once('/').map(|(host, _)| host).unwrap_or(rest);
    if host_port.is_empty() || !host_port.contains(':') {
        return Err(TorrentError::invalid_source(format!("UDP tracker URL needs host and port: {}", url)).into());
    }
    Ok(host_port)
}

pub fn connect_packet(transaction_id: u32) -> [u8; 16] {
    let mut packet = [0u8; 16];
    packet[..8].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
    packet[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
    packet[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    packet
}

pub fn parse_connect_response(data: &[u8], transaction_id: u32) -> Result<u64> {
    check_header(data, ACTION_CONNECT, transaction_id, RESPONSE_CONNECT_LEN)?;
    let mut id = [0u8; 8];
    id.copy_from_slice(&data[8..16]);
    Ok(u64::from_be_bytes(id))
}

pub fn announce_packet(connection_id: u64, transaction_id: u32, key: u32, request: &AnnounceRequest) -> Vec<u8> {
    let mut packet = Vec::with_capacity(98);
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(&request.info_hash);
    packet.extend_from_slice(&request.peer_id);
    packet.extend_from_slice(&request.downloaded.to_be_bytes());
    packet.extend_from_slice(&request.left.to_be_bytes());
    packet.extend_from_slice(&request.uploaded.to_be_bytes());
    packet.extend_from_slice(&request.event.udp_code().to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes()); // IP address
    packet.extend_from_slice(&key.to_be_bytes());
    packet.extend_from_slice(&(-1i32).to_be_bytes()); // num_want
    packet.extend_from_slice(&request.port.to_be_bytes());
    packet
}

pub fn parse_announce_response(data: &[u8], transaction_id: u32) -> Result<AnnounceResponse> {
    check_header(data, ACTION_ANNOUNCE, transaction_id, RESPONSE_HEADER_LEN)?;
    let interval = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let peers = parse_compact_peers(&data[RESPONSE_HEADER_LEN..])?;
    Ok(AnnounceResponse {
        interval: (interval > 0).then(|| std::time::Duration::from_secs(interval as u64)),
        min_interval: None,
        peers,
    })
}

fn check_header(data: &[u8], action: u32, transaction_id: u32, min_len: usize) -> Result<()> {
    if data.len() < 8 {
        return Err(TorrentError::protocol_error("UDP tracker response too short").into());
    }
    let got_action = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let got_tx = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if got_tx != transaction_id {
        return Err(TorrentError::protocol_error("UDP tracker transaction id mismatch").into());
    }
    if got_action == ACTION_ERROR {
        let reason = String::from_utf8_lossy(&data[8..]).to_string();
        return Err(TorrentError::no_peer_source_with_source("Tracker refused announce", reason).into());
    }
    if got_action != action {
        return Err(TorrentError::protocol_error(format!("Unexpected UDP tracker action {}", got_action)).into());
    }
    if data.len() < min_len {
        return Err(TorrentError::protocol_error("UDP tracker response too short").into());
    }
    Ok(())
}
