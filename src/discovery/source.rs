//! Merged peer source
//!
//! [`PeerSource`] runs as its own task for one torrent. It announces to
//! every configured [`PeerDiscovery`] concurrently and forwards each
//! source's peers as soon as that source answers. Every source then
//! re-announces on its own interval. Addresses seen within a rolling
//! window are suppressed. A failing source is logged and retried later;
//! only when every source fails its first announce does the stream end
//! with `NoPeerSourceAvailable`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::{AnnounceEvent, AnnounceRequest, AnnounceResponse, PeerDiscovery, StaticPeers, UdpTracker};
use crate::config::EngineConfig;
use crate::error::TorrentError;

/// Transfer counters reported in announces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// What the source sends to its session
#[derive(Debug)]
pub enum DiscoveryEvent {
    /// Newly seen peer addresses
    Peers(Vec<SocketAddr>),
    /// Every source failed on the first attempt; no more events follow
    Failed(TorrentError),
}

#[derive(Debug)]
enum SourceCommand {
    Finish,
    Stop,
}

/// Suppresses addresses already reported within a time window
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    seen: HashMap<SocketAddr, Instant>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self { window, seen: HashMap::new() }
    }

    /// Keep only addresses not reported within the window
    pub fn filter(&mut self, peers: Vec<SocketAddr>, now: Instant) -> Vec<SocketAddr> {
        let window = self.window;
        self.seen.retain(|_, at| now.saturating_duration_since(*at) < window);

        let mut fresh = Vec::new();
        for addr in peers {
            if self.seen.contains_key(&addr) {
                continue;
            }
            self.seen.insert(addr, now);
            fresh.push(addr);
        }
        fresh
    }
}

/// Peer discovery for one torrent
pub struct PeerSource {
    sources: Vec<Arc<dyn PeerDiscovery>>,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    announce_timeout: Duration,
    default_interval: Duration,
    dedup_window: Duration,
}

impl std::fmt::Debug for PeerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sources.iter().map(|s| s.name()).collect();
        f.debug_struct("PeerSource")
            .field("info_hash", &hex::encode(self.info_hash))
            .field("sources", &names)
            .finish()
    }
}

impl PeerSource {
    /// Empty source set for `info_hash`
    pub fn new(info_hash: [u8; 20], config: &EngineConfig) -> Self {
        Self {
            sources: Vec::new(),
            info_hash,
            peer_id: config.peer_id,
            port: config.listen_port,
            announce_timeout: config.tracker_timeout,
            default_interval: config.default_announce_interval,
            dedup_window: config.dedup_window,
        }
    }

    /// Source set for a torrent's trackers plus any static peers.
    /// Tracker URLs with an unsupported scheme are skipped.
    pub fn for_torrent(
        info_hash: [u8; 20],
        trackers: &[String],
        extra_peers: &[SocketAddr],
        use_trackers: bool,
        config: &EngineConfig,
    ) -> Self {
        let mut source = Self::new(info_hash, config);
        if !extra_peers.is_empty() {
            source = source.with_source(Arc::new(StaticPeers::new(extra_peers.to_vec())));
        }
        if !use_trackers {
            return source;
        }

        for url in trackers {
            if url.starts_with("udp://") {
                source = source.with_source(Arc::new(UdpTracker::new(url.clone())));
                continue;
            }
            #[cfg(feature = "download")]
            if url.starts_with("http://") || url.starts_with("https://") {
                match super::HttpTracker::new(url.clone(), config.tracker_timeout) {
                    Ok(tracker) => source = source.with_source(Arc::new(tracker)),
                    Err(e) => warn!("Skipping tracker {}: {}", url, e),
                }
                continue;
            }
            warn!("Skipping tracker with unsupported scheme: {}", url);
        }
        source
    }

    /// Add a discovery source
    pub fn with_source(mut self, source: Arc<dyn PeerDiscovery>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Start announcing. Counters for announces are read from `stats`.
    pub fn spawn(self, stats: watch::Receiver<TransferStats>) -> (PeerSourceHandle, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let (commands, command_rx) = mpsc::channel(8);
        let (out, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(stats, command_rx, out));
        (PeerSourceHandle { commands, task }, events)
    }

    async fn run(
        self,
        stats: watch::Receiver<TransferStats>,
        mut commands: mpsc::Receiver<SourceCommand>,
        out: mpsc::UnboundedSender<DiscoveryEvent>,
    ) {
        if self.sources.is_empty() {
            warn!("No peer sources configured for {}", hex::encode(self.info_hash));
            let _ = out.send(DiscoveryEvent::Failed(TorrentError::no_peer_source("No peer sources configured")));
            return;
        }

        let mut dedup = Deduplicator::new(self.dedup_window);
        let mut slots: Vec<SourceSlot> = self.sources.iter().map(|_| SourceSlot::default()).collect();
        let mut pending = JoinSet::new();
        let mut failures = Vec::new();
        let mut any_ok = false;

        for index in 0..self.sources.len() {
            self.start_announce(&mut pending, index, AnnounceEvent::Started, &stats);
        }

        loop {
            let next = slots.iter().filter_map(|slot| slot.due).min();
            tokio::select! {
                command = commands.recv() => {
                    pending.shutdown().await;
                    let event = match command {
                        Some(SourceCommand::Finish) => AnnounceEvent::Completed,
                        Some(SourceCommand::Stop) | None => AnnounceEvent::Stopped,
                    };
                    // sources that never acknowledged `started` are left alone
                    let announced: Vec<usize> = (0..slots.len()).filter(|&i| slots[i].started).collect();
                    self.final_round(&announced, event, &stats).await;
                    debug!("Peer source ended after {:?} to {} sources", event, announced.len());
                    return;
                }
                Some(joined) = pending.join_next(), if !pending.is_empty() => {
                    let (index, event, result) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            warn!("Announce task failed: {}", e);
                            continue;
                        }
                    };
                    let slot = &mut slots[index];
                    let first = !slot.attempted;
                    slot.attempted = true;
                    let delay = match result {
                        Ok(response) => {
                            debug!("{} returned {} peers ({:?})", self.sources[index].name(), response.peers.len(), event);
                            slot.started = true;
                            any_ok = true;
                            let next = response.next_announce(self.default_interval);
                            self.forward(response.peers, &mut dedup, &out);
                            next
                        }
                        Err(e) => {
                            warn!("Announce to {} failed: {}", self.sources[index].name(), e);
                            if first {
                                failures.push(format!("{}: {}", self.sources[index].name(), e));
                            }
                            self.default_interval
                        }
                    };
                    slot.due = Some(Instant::now() + delay);

                    if !any_ok && slots.iter().all(|slot| slot.attempted) {
                        let error = TorrentError::no_peer_source_with_source("Every peer source failed", failures.join("; "));
                        warn!("{}", error);
                        let _ = out.send(DiscoveryEvent::Failed(error));
                        return;
                    }
                }
                _ = sleep_until_due(next) => {
                    let now = Instant::now();
                    for index in 0..slots.len() {
                        if slots[index].due.is_some_and(|due| due <= now) {
                            slots[index].due = None;
                            let event = if slots[index].started { AnnounceEvent::None } else { AnnounceEvent::Started };
                            self.start_announce(&mut pending, index, event, &stats);
                        }
                    }
                }
            }
        }
    }

    fn request(&self, event: AnnounceEvent, stats: &watch::Receiver<TransferStats>) -> AnnounceRequest {
        let counters = *stats.borrow();
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: counters.uploaded,
            downloaded: counters.downloaded,
            left: counters.left,
            event,
        }
    }

    /// Announce to one source in the background, bounded by the announce
    /// timeout
    fn start_announce(
        &self,
        pending: &mut JoinSet<(usize, AnnounceEvent, anyhow::Result<AnnounceResponse>)>,
        index: usize,
        event: AnnounceEvent,
        stats: &watch::Receiver<TransferStats>,
    ) {
        let source = Arc::clone(&self.sources[index]);
        let request = self.request(event, stats);
        let limit = self.announce_timeout;
        pending.spawn(async move {
            let result = match timeout(limit, source.announce(&request)).await {
                Ok(result) => result,
                Err(_) => Err(TorrentError::no_peer_source(format!("Announce to {} timed out", source.name())).into()),
            };
            (index, event, result)
        });
    }

    /// Send a last `completed` or `stopped` announce to the given sources
    /// concurrently. Peers in the responses are ignored.
    async fn final_round(&self, indices: &[usize], event: AnnounceEvent, stats: &watch::Receiver<TransferStats>) {
        let mut tasks = JoinSet::new();
        for &index in indices {
            self.start_announce(&mut tasks, index, event, stats);
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, _, Ok(_))) => debug!("Announced {:?} to {}", event, self.sources[index].name()),
                Ok((index, _, Err(e))) => debug!("{} failed ({:?}): {}", self.sources[index].name(), event, e),
                Err(e) => warn!("Announce task failed: {}", e),
            }
        }
        if event == AnnounceEvent::Completed {
            info!("Announced completion to {} sources", indices.len());
        }
    }

    fn forward(&self, peers: Vec<SocketAddr>, dedup: &mut Deduplicator, out: &mpsc::UnboundedSender<DiscoveryEvent>) {
        let fresh = dedup.filter(peers, Instant::now());
        if !fresh.is_empty() {
            debug!("Discovered {} new peers", fresh.len());
            let _ = out.send(DiscoveryEvent::Peers(fresh));
        }
    }
}

/// Announce bookkeeping for one source
#[derive(Debug, Default)]
struct SourceSlot {
    /// When the next announce is due; `None` while one is in flight
    due: Option<Instant>,
    /// The first announce has finished, successfully or not
    attempted: bool,
    /// A `started` announce succeeded
    started: bool,
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

/// Control handle for a running [`PeerSource`]
#[derive(Debug)]
pub struct PeerSourceHandle {
    commands: mpsc::Sender<SourceCommand>,
    task: JoinHandle<()>,
}

impl PeerSourceHandle {
    /// Announce completion and stop
    pub async fn finish(self) {
        self.shutdown(SourceCommand::Finish).await;
    }

    /// Announce that we are leaving and stop
    pub async fn stop(self) {
        self.shutdown(SourceCommand::Stop).await;
    }

    async fn shutdown(self, command: SourceCommand) {
        let PeerSourceHandle { commands, task } = self;
        let _ = commands.send(command).await;
        drop(commands);
        if let Err(e) = task.await {
            warn!("Peer source task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every announce event and answers with a fixed peer list
    struct Recorder {
        peers: Vec<SocketAddr>,
        fail: bool,
        interval: Option<Duration>,
        events: Mutex<Vec<AnnounceEvent>>,
    }

    impl Recorder {
        fn new(peers: Vec<SocketAddr>, fail: bool) -> Arc<Self> {
            Arc::new(Self { peers, fail, interval: None, events: Mutex::new(Vec::new()) })
        }

        fn events(&self) -> Vec<AnnounceEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerDiscovery for Recorder {
        async fn announce(&self, request: &AnnounceRequest) -> anyhow::Result<AnnounceResponse> {
            self.events.lock().unwrap().push(request.event);
            if self.fail {
                anyhow::bail!("tracker down");
            }
            Ok(AnnounceResponse { interval: self.interval, min_interval: None, peers: self.peers.clone() })
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    /// Records announce events and never answers
    #[derive(Default)]
    struct Unresponsive {
        events: Mutex<Vec<AnnounceEvent>>,
    }

    #[async_trait]
    impl PeerDiscovery for Unresponsive {
        async fn announce(&self, request: &AnnounceRequest) -> anyhow::Result<AnnounceResponse> {
            self.events.lock().unwrap().push(request.event);
            std::future::pending().await
        }

        fn name(&self) -> &str {
            "unresponsive"
        }
    }

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 6881))
    }

    fn stats() -> watch::Receiver<TransferStats> {
        watch::channel(TransferStats { uploaded: 0, downloaded: 0, left: 100 }).1
    }

    #[test]
    fn test_dedup_window() {
        let start = Instant::now();
        let mut dedup = Deduplicator::new(Duration::from_secs(10));
        assert_eq!(dedup.filter(vec![addr(1), addr(2), addr(1)], start), vec![addr(1), addr(2)]);
        assert!(dedup.filter(vec![addr(1)], start + Duration::from_secs(5)).is_empty());
        assert_eq!(dedup.filter(vec![addr(1)], start + Duration::from_secs(11)), vec![addr(1)]);
    }

    #[tokio::test]
    async fn test_all_sources_failing_is_fatal() {
        let config = EngineConfig::default();
        let source = PeerSource::new([1u8; 20], &config)
            .with_source(Recorder::new(vec![], true))
            .with_source(Recorder::new(vec![], true));
        let (handle, mut events) = source.spawn(stats());

        match events.recv().await {
            Some(DiscoveryEvent::Failed(err)) => assert_eq!(err.kind(), crate::error::ErrorKind::NoPeerSourceAvailable),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.recv().await.is_none());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_no_sources_is_fatal() {
        let (_handle, mut events) = PeerSource::new([1u8; 20], &EngineConfig::default()).spawn(stats());
        assert!(matches!(events.recv().await, Some(DiscoveryEvent::Failed(_))));
    }

    #[tokio::test]
    async fn test_partial_failure_is_skipped_and_merged() {
        let config = EngineConfig::default();
        let good = Recorder::new(vec![addr(1), addr(2)], false);
        let also_good = Recorder::new(vec![addr(2), addr(3)], false);
        let source = PeerSource::new([1u8; 20], &config)
            .with_source(Recorder::new(vec![], true))
            .with_source(good.clone())
            .with_source(also_good.clone());
        let (handle, mut events) = source.spawn(stats());

        let mut seen = Vec::new();
        while seen.len() < 3 {
            match events.recv().await {
                Some(DiscoveryEvent::Peers(peers)) => seen.extend(peers),
                other => panic!("unexpected event {:?}", other),
            }
        }
        seen.sort();
        assert_eq!(seen, vec![addr(1), addr(2), addr(3)]);

        handle.stop().await;
        assert_eq!(good.events(), vec![AnnounceEvent::Started, AnnounceEvent::Stopped]);
    }

    #[tokio::test]
    async fn test_periodic_reannounce() {
        let config = EngineConfig {
            default_announce_interval: Duration::from_millis(20),
            dedup_window: Duration::from_millis(1),
            ..EngineConfig::default()
        };
        let recorder = Recorder::new(vec![addr(1)], false);
        let (handle, mut events) = PeerSource::new([1u8; 20], &config)
            .with_source(recorder.clone())
            .spawn(stats());

        for _ in 0..3 {
            assert!(matches!(events.recv().await, Some(DiscoveryEvent::Peers(_))));
        }
        handle.finish().await;

        let recorded = recorder.events();
        assert_eq!(recorded.first(), Some(&AnnounceEvent::Started));
        assert!(recorded.contains(&AnnounceEvent::None));
        assert_eq!(recorded.last(), Some(&AnnounceEvent::Completed));
    }

    #[tokio::test]
    async fn test_fast_source_not_held_back_by_slow_one() {
        let config = EngineConfig { tracker_timeout: Duration::from_secs(30), ..EngineConfig::default() };
        let (handle, mut events) = PeerSource::new([1u8; 20], &config)
            .with_source(Arc::new(Unresponsive::default()))
            .with_source(Arc::new(StaticPeers::new(vec![addr(7)])))
            .spawn(stats());

        let first = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        match first {
            Some(DiscoveryEvent::Peers(peers)) => assert_eq!(peers, vec![addr(7)]),
            other => panic!("unexpected event {:?}", other),
        }
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_during_first_announce_is_prompt() {
        let config = EngineConfig { tracker_timeout: Duration::from_secs(30), ..EngineConfig::default() };
        let slow = Arc::new(Unresponsive::default());
        let answered = Recorder::new(vec![addr(1)], false);
        let (handle, mut events) = PeerSource::new([1u8; 20], &config)
            .with_source(slow.clone())
            .with_source(answered.clone())
            .spawn(stats());
        assert!(matches!(events.recv().await, Some(DiscoveryEvent::Peers(_))));

        tokio::time::timeout(Duration::from_secs(2), handle.stop()).await.unwrap();
        assert_eq!(slow.events.lock().unwrap().clone(), vec![AnnounceEvent::Started]);
        assert_eq!(answered.events(), vec![AnnounceEvent::Started, AnnounceEvent::Stopped]);
    }

    #[test]
    fn test_for_torrent_builds_sources() {
        let config = EngineConfig::default();
        let trackers = vec![
            "udp://tracker.test:80/announce".to_string(),
            "wss://tracker.test/announce".to_string(),
        ];
        let source = PeerSource::for_torrent([0u8; 20], &trackers, &[addr(1)], true, &config);
        assert_eq!(source.source_count(), 2);

        let source = PeerSource::for_torrent([0u8; 20], &trackers, &[addr(1)], false, &config);
        assert_eq!(source.source_count(), 1);
    }
}
