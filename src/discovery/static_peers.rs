//! Fixed peer list

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;

use super::{AnnounceRequest, AnnounceResponse, PeerDiscovery};

/// Peers given up front, e.g. on the command line
#[derive(Debug, Clone)]
pub struct StaticPeers {
    peers: Vec<SocketAddr>,
}

impl StaticPeers {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl PeerDiscovery for StaticPeers {
    async fn announce(&self, _request: &AnnounceRequest) -> Result<AnnounceResponse> {
        Ok(AnnounceResponse {
            interval: None,
            min_interval: None,
            peers: self.peers.clone(),
        })
    }

    fn name(&self) -> &str {
        "static"
    }
}
