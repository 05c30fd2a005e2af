//! HTTP tracker client

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_bencode::value::Value;
use tracing::{debug, warn};

use super::{parse_compact_peers, AnnounceRequest, AnnounceResponse, PeerDiscovery};
use crate::error::TorrentError;

/// Announces over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpTracker {
    url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RawAnnounce {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(rename = "warning message")]
    warning_message: Option<String>,
    interval: Option<i64>,
    #[serde(rename = "min interval")]
    min_interval: Option<i64>,
    peers: Option<Value>,
}

impl HttpTracker {
    /// Create a client for `url`, bounding every announce by `timeout`
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TorrentError::config_error(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { url: url.into(), client })
    }
}

#[async_trait]
impl PeerDiscovery for HttpTracker {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let url = announce_url(&self.url, request);
        debug!("Announcing to {} ({:?})", self.url, request.event);

        let response = self.client.get(&url).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        parse_announce_response(&body)
    }

    fn name(&self) -> &str {
        &self.url
    }
}

/// Append announce parameters to a tracker URL
pub fn announce_url(base: &str, request: &AnnounceRequest) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        base,
        separator,
        urlencoding::encode_binary(&request.info_hash),
        urlencoding::encode_binary(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
    );
    if let Some(event) = request.event.as_str() {
        url.push_str("&event=");
        url.push_str(event);
    }
    url
}

/// Decode a bencoded announce response
pub fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse> {
    let raw: RawAnnounce = serde_bencode::from_bytes(body).map_err(|e| {
        TorrentError::protocol_error_with_source("Malformed tracker response", e.to_string())
    })?;

    if let Some(reason) = raw.failure_reason {
        return Err(TorrentError::no_peer_source_with_source("Tracker refused announce", reason).into());
    }
    if let Some(message) = raw.warning_message {
        warn!("Tracker warning: {}", message);
    }

    let peers = match raw.peers {
        Some(Value::Bytes(compact)) => parse_compact_peers(&compact)?,
        Some(Value::List(entries)) => entries.iter().filter_map(dictionary_peer).collect(),
        Some(_) => {
            return Err(TorrentError::protocol_error("Tracker peers field has unexpected type").into());
        }
        None => Vec::new(),
    };

    let seconds = |v: Option<i64>| v.filter(|s| *s > 0).map(|s| Duration::from_secs(s as u64));
    Ok(AnnounceResponse {
        interval: seconds(raw.interval),
        min_interval: seconds(raw.min_interval),
        peers,
    })
}

/// One entry of a non-compact peer list
fn dictionary_peer(entry: &Value) -> Option<SocketAddr> {
    let Value::Dict(dict) = entry else { return None };
    let ip = match dict.get(b"ip".as_slice())? {
        Value::Bytes(bytes) => String::from_utf8(bytes.clone()).ok()?,
        _ => return None,
    };
    let port = match dict.get(b"port".as_slice())? {
        Value::Int(port) => u16::try_from(*port).ok()?,
        _ => return None,
    };
    let ip = ip.parse().ok()?;
    Some(SocketAddr::new(ip, port))
}
