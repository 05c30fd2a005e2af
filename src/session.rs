//! Torrent session
//!
//! One session downloads one torrent. It runs as a single task that is
//! the only writer of the scheduler state: peer connections, the peer
//! source and the disk worker report to it over channels and it decides
//! what happens next. Callers observe it through a [`SessionHandle`]:
//! a watch channel carries the latest [`SessionProgress`] snapshot and a
//! broadcast channel carries [`SessionEvent`]s.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::config::{AddOptions, EngineConfig};
use crate::discovery::{DiscoveryEvent, PeerSource, PeerSourceHandle, TransferStats};
use crate::error::TorrentError;
use crate::peer::{self, ConnectionParams, PeerCommand, PeerEvent, PeerEventKind, PeerHandle, PeerState, Throughput};
use crate::protocol::BlockInfo;
use crate::scheduler::{BlockOutcome, PieceScheduler};
use crate::storage::{DiskEvent, FileStorage, PieceStore};
use crate::torrent::{MagnetLink, MetadataResolver, Resolution, TorrentInfo};

const PEER_EVENT_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 1024;
const PEER_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for magnet metadata
    ResolvingMetadata,
    /// Checking files already on disk
    Checking,
    Downloading,
    /// Every piece verified
    Done,
    /// Stopped by a session-fatal error
    Failed,
    /// Torn down
    Stopped,
}

/// Aggregate progress, published as immutable snapshots
#[derive(Debug, Clone)]
pub struct SessionProgress {
    pub info_hash: [u8; 20],
    /// Torrent name, once metadata is known
    pub name: Option<String>,
    pub state: SessionState,
    /// Bytes of verified pieces
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub verified_pieces: usize,
    pub total_pieces: usize,
    /// Established peer connections
    pub peer_count: usize,
    /// Download rate in bytes per second
    pub download_rate: f64,
    pub eta: Option<Duration>,
}

impl SessionProgress {
    fn new(info_hash: [u8; 20]) -> Self {
        Self {
            info_hash,
            name: None,
            state: SessionState::ResolvingMetadata,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            total_bytes: 0,
            verified_pieces: 0,
            total_pieces: 0,
            peer_count: 0,
            download_rate: 0.0,
            eta: None,
        }
    }

    /// Completion as a fraction in `[0, 1]`
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.bytes_downloaded as f64 / self.total_bytes as f64
    }
}

/// Events delivered to session subscribers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Progress {
        bytes_downloaded: u64,
        download_rate: f64,
        peer_count: usize,
        eta: Option<Duration>,
    },
    PieceVerified(u32),
    /// A piece failed verification and will be downloaded again
    HashMismatch(u32),
    Done,
    /// A session-level failure
    Error(TorrentError),
}

#[derive(Debug)]
enum SessionCommand {
    Stop { ack: oneshot::Sender<()> },
    RetryWrites,
    Peers { reply: oneshot::Sender<Vec<PeerState>> },
}

/// Caller-side handle to a running session
#[derive(Debug)]
pub struct SessionHandle {
    info_hash: [u8; 20],
    commands: mpsc::Sender<SessionCommand>,
    progress: watch::Receiver<SessionProgress>,
    events: broadcast::Sender<SessionEvent>,
    receiver: broadcast::Receiver<SessionEvent>,
    open_handles: Arc<AtomicUsize>,
}

impl Clone for SessionHandle {
    fn clone(&self) -> Self {
        Self {
            info_hash: self.info_hash,
            commands: self.commands.clone(),
            progress: self.progress.clone(),
            events: self.events.clone(),
            receiver: self.events.subscribe(),
            open_handles: Arc::clone(&self.open_handles),
        }
    }
}

impl SessionHandle {
    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Latest progress snapshot
    pub fn progress(&self) -> SessionProgress {
        self.progress.borrow().clone()
    }

    /// Receiver that sees every future progress snapshot
    pub fn watch_progress(&self) -> watch::Receiver<SessionProgress> {
        self.progress.clone()
    }

    /// Additional event receiver, starting from now
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Next event on this handle's own receiver. Returns `None` once the
    /// session is gone.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Session {} subscriber lagged, {} events dropped", self.info_hash_hex(), missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Tear the session down. Resolves once peers are closed and every
    /// file handle is released.
    pub async fn stop(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(SessionCommand::Stop { ack }).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Resume writes paused by a disk failure
    pub fn retry_writes(&self) -> Result<()> {
        self.commands
            .try_send(SessionCommand::RetryWrites)
            .map_err(|_| TorrentError::io_error("Session is not running"))?;
        Ok(())
    }

    /// Snapshots of the connected peers
    pub async fn peers(&self) -> Vec<PeerState> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(SessionCommand::Peers { reply }).await.is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// File handles the session currently holds open
    pub fn open_file_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }
}

/// Start a session task for `resolution`
pub fn spawn(
    resolution: Resolution,
    options: AddOptions,
    config: Arc<EngineConfig>,
    resolver: MetadataResolver,
) -> SessionHandle {
    let info_hash = resolution.info_hash();
    let (commands, command_rx) = mpsc::channel(32);
    let (progress_tx, progress) = watch::channel(SessionProgress::new(info_hash));
    let (events, receiver) = broadcast::channel(EVENT_CAPACITY);
    let open_handles = Arc::new(AtomicUsize::new(0));
    let (peer_tx, peer_rx) = mpsc::channel(PEER_EVENT_CAPACITY);
    let (stats_tx, _) = watch::channel(TransferStats::default());

    let (metadata, magnet) = match resolution {
        Resolution::Ready(info) => (Some(Arc::new(info)), None),
        Resolution::Pending(link) => (None, Some(link)),
    };

    let actor = SessionActor {
        info_hash,
        config,
        options,
        resolver,
        metadata,
        magnet,
        scheduler: None,
        store: None,
        disk_events: None,
        discovery: None,
        discovery_events: None,
        stats_tx,
        peers: HashMap::new(),
        peer_tx,
        peer_rx,
        candidates: VecDeque::new(),
        known: HashMap::new(),
        commands: command_rx,
        progress_tx,
        events: events.clone(),
        open_handles: Arc::clone(&open_handles),
        state: SessionState::ResolvingMetadata,
        throughput: Throughput::default(),
        verified_bytes: 0,
        received_bytes: 0,
        closing: JoinSet::new(),
        stop_ack: None,
        stopping: false,
    };
    tokio::spawn(actor.run());

    SessionHandle {
        info_hash,
        commands,
        progress,
        events,
        receiver,
        open_handles,
    }
}

/// A connected peer as seen by the session
struct PeerSlot {
    handle: PeerHandle,
    interested: bool,
}

/// What the session remembers about an address
#[derive(Debug, Default)]
struct PeerRecord {
    retry_after: Option<Instant>,
    strikes: u32,
    banned: bool,
}

struct SessionActor {
    info_hash: [u8; 20],
    config: Arc<EngineConfig>,
    options: AddOptions,
    resolver: MetadataResolver,
    metadata: Option<Arc<TorrentInfo>>,
    magnet: Option<MagnetLink>,
    scheduler: Option<PieceScheduler>,
    store: Option<PieceStore>,
    disk_events: Option<mpsc::UnboundedReceiver<DiskEvent>>,
    discovery: Option<PeerSourceHandle>,
    discovery_events: Option<mpsc::UnboundedReceiver<DiscoveryEvent>>,
    stats_tx: watch::Sender<TransferStats>,
    peers: HashMap<SocketAddr, PeerSlot>,
    peer_tx: mpsc::Sender<PeerEvent>,
    peer_rx: mpsc::Receiver<PeerEvent>,
    candidates: VecDeque<SocketAddr>,
    known: HashMap<SocketAddr, PeerRecord>,
    commands: mpsc::Receiver<SessionCommand>,
    progress_tx: watch::Sender<SessionProgress>,
    events: broadcast::Sender<SessionEvent>,
    open_handles: Arc<AtomicUsize>,
    state: SessionState,
    throughput: Throughput,
    /// Bytes of verified pieces, including those found on disk
    verified_bytes: u64,
    /// Block payload accepted from peers
    received_bytes: u64,
    /// Peer closes and final announces still running
    closing: JoinSet<()>,
    stop_ack: Option<oneshot::Sender<()>>,
    stopping: bool,
}

async fn recv_some<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn into_torrent_error(error: anyhow::Error) -> TorrentError {
    match error.downcast::<TorrentError>() {
        Ok(err) => err,
        Err(other) => match other.downcast::<std::io::Error>() {
            Ok(io) => TorrentError::from(io),
            Err(other) => TorrentError::io_error(format!("{:#}", other)),
        },
    }
}

impl SessionActor {
    async fn run(mut self) {
        let hash = hex::encode(self.info_hash);
        info!("Session {} starting", hash);

        if let Err(e) = self.start().await {
            self.fail(into_torrent_error(e));
        }
        if !self.stopping {
            self.event_loop().await;
        }

        self.teardown().await;
        self.state = SessionState::Stopped;
        self.publish_progress();
        info!("Session {} stopped", hash);
        if let Some(ack) = self.stop_ack.take() {
            let _ = ack.send(());
        }
    }

    /// Resolve metadata, check data already on disk and start discovery
    async fn start(&mut self) -> Result<()> {
        let info = match self.metadata.clone() {
            Some(info) => info,
            None => match self.resolve_metadata().await? {
                Some(info) => info,
                None => return Ok(()),
            },
        };

        self.state = SessionState::Checking;
        self.publish_progress();

        let storage = FileStorage::with_handle_counter(
            self.options.output_directory.clone(),
            Arc::clone(&info),
            Arc::clone(&self.open_handles),
        );
        storage.prepare().await?;
        let present = storage.verify_existing().await?;

        let mut scheduler = PieceScheduler::new(&info, &self.config);
        for &index in &present {
            scheduler.piece_verified(index);
            self.verified_bytes += info.piece_len(index) as u64;
        }
        if !present.is_empty() {
            info!("Resuming '{}' with {}/{} pieces on disk", info.name, present.len(), info.piece_count());
        }
        let complete = scheduler.is_complete();
        self.scheduler = Some(scheduler);

        let (store, disk_events) = PieceStore::start(storage, self.config.block_size);
        self.store = Some(store);
        self.disk_events = Some(disk_events);

        self.state = SessionState::Downloading;
        self.update_stats();
        self.publish_progress();

        if complete {
            self.complete().await;
            return Ok(());
        }

        let mut trackers = info.trackers.clone();
        if let Some(link) = &self.magnet {
            for tracker in &link.trackers {
                if !trackers.contains(tracker) {
                    trackers.push(tracker.clone());
                }
            }
        }
        let source = PeerSource::for_torrent(
            self.info_hash,
            &trackers,
            &self.options.extra_peers,
            self.options.use_trackers,
            &self.config,
        );
        debug!("Session {} using {:?}", hex::encode(self.info_hash), source);
        let (discovery, discovery_events) = source.spawn(self.stats_tx.subscribe());
        self.discovery = Some(discovery);
        self.discovery_events = Some(discovery_events);

        info!("Downloading '{}' ({} pieces, {} bytes)", info.name, info.piece_count(), info.total_length);
        Ok(())
    }

    /// Fetch magnet metadata while still answering commands. Returns
    /// `None` if the session was stopped first.
    async fn resolve_metadata(&mut self) -> Result<Option<Arc<TorrentInfo>>> {
        let Some(link) = self.magnet.clone() else {
            return Err(TorrentError::unresolved_metadata("No metadata available", &self.info_hash).into());
        };
        self.publish_progress();
        debug!("Resolving metadata for {}", hex::encode(self.info_hash));

        let resolver = self.resolver.clone();
        let resolving = resolver.resolve_magnet(&link);
        tokio::pin!(resolving);

        loop {
            tokio::select! {
                result = &mut resolving => {
                    let info = Arc::new(result?);
                    info!("Resolved metadata for '{}'", info.name);
                    self.metadata = Some(Arc::clone(&info));
                    return Ok(Some(info));
                }
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Stop { ack }) => {
                        self.stop_ack = Some(ack);
                        self.stopping = true;
                        return Ok(None);
                    }
                    Some(SessionCommand::Peers { reply }) => {
                        let _ = reply.send(Vec::new());
                    }
                    Some(SessionCommand::RetryWrites) => {}
                    None => {
                        self.stopping = true;
                        return Ok(None);
                    }
                },
            }
        }
    }

    async fn event_loop(&mut self) {
        let mut ticker = tokio::time::interval(self.config.progress_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Stop { ack }) => {
                        self.stop_ack = Some(ack);
                        return;
                    }
                    Some(SessionCommand::RetryWrites) => self.retry_writes(),
                    Some(SessionCommand::Peers { reply }) => {
                        let snapshots = self.peers.values().map(|slot| slot.handle.snapshot()).collect();
                        let _ = reply.send(snapshots);
                    }
                    None => {
                        debug!("Every handle to session {} dropped", hex::encode(self.info_hash));
                        return;
                    }
                },
                event = recv_some(&mut self.discovery_events) => match event {
                    Some(event) => self.on_discovery(event),
                    None => self.discovery_events = None,
                },
                Some(event) = self.peer_rx.recv() => self.on_peer_event(event).await,
                event = recv_some(&mut self.disk_events) => match event {
                    Some(event) => self.on_disk_event(event).await,
                    None => self.disk_events = None,
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }
    }

    fn on_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Peers(addrs) => {
                let mut added = 0;
                for addr in addrs {
                    let banned = self.known.get(&addr).is_some_and(|r| r.banned);
                    if banned || self.peers.contains_key(&addr) || self.candidates.contains(&addr) {
                        continue;
                    }
                    self.candidates.push_back(addr);
                    added += 1;
                }
                debug!("{} new candidate peers ({} queued)", added, self.candidates.len());
                self.fill_peers();
            }
            DiscoveryEvent::Failed(error) => {
                self.discovery_events = None;
                if self.peers.is_empty() && self.state == SessionState::Downloading {
                    self.fail(error);
                } else {
                    warn!("Peer discovery ended: {}", error);
                }
            }
        }
    }

    /// Connect to queued candidates up to the peer cap
    fn fill_peers(&mut self) {
        if self.state != SessionState::Downloading {
            return;
        }
        let Some(info) = self.metadata.clone() else { return };
        let now = Instant::now();
        let mut deferred = Vec::new();

        while self.peers.len() < self.config.max_peers {
            let Some(addr) = self.candidates.pop_front() else { break };
            if self.peers.contains_key(&addr) {
                continue;
            }
            let record = self.known.entry(addr).or_default();
            if record.banned {
                continue;
            }
            if record.retry_after.is_some_and(|at| at > now) {
                deferred.push(addr);
                continue;
            }
            record.retry_after = None;

            let params = ConnectionParams::new(&self.config, self.info_hash, info.piece_count());
            let handle = peer::connect(addr, params, self.peer_tx.clone());
            self.peers.insert(addr, PeerSlot { handle, interested: false });
        }
        self.candidates.extend(deferred);
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        let PeerEvent { addr, kind } = event;
        if !self.peers.contains_key(&addr) {
            trace!("Ignoring event from departed peer {}", addr);
            return;
        }

        match kind {
            PeerEventKind::Established { peer_id, capabilities } => {
                debug!("Peer {} established (id {}, {:?})", addr, hex::encode(peer_id), capabilities);
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.peer_joined(addr);
                }
            }
            PeerEventKind::Bitfield(bitfield) => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.peer_bitfield(addr, &bitfield);
                }
                self.update_interest(addr);
            }
            PeerEventKind::Have(index) => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.peer_have(addr, index);
                }
                self.update_interest(addr);
            }
            PeerEventKind::Unchoked => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.peer_unchoked(addr);
                }
                self.request_more(addr);
            }
            PeerEventKind::Choked => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.peer_choked(addr);
                }
                self.request_more_all();
            }
            PeerEventKind::Block { index, begin, data } => self.on_block(addr, index, begin, data),
            PeerEventKind::RequestRejected(block) => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.request_dropped(addr, block);
                }
            }
            PeerEventKind::Closed(reason) => self.on_peer_closed(addr, reason),
        }
    }

    fn on_block(&mut self, addr: SocketAddr, index: u32, begin: u32, data: bytes::Bytes) {
        let block = BlockInfo { index, begin, length: data.len() as u32 };
        let Some(scheduler) = self.scheduler.as_mut() else { return };

        match scheduler.block_received(addr, block) {
            BlockOutcome::Duplicate => trace!("Discarded block {}:{} from {}", index, begin, addr),
            BlockOutcome::Accepted { cancels, piece_complete } => {
                self.received_bytes += data.len() as u64;
                self.throughput.record(data.len() as u64, Instant::now());
                for (peer, block) in cancels {
                    if let Some(slot) = self.peers.get(&peer) {
                        slot.handle.send(PeerCommand::Cancel(block));
                    }
                }

                if let Some(store) = self.store.as_mut() {
                    let stored = store.add_block(index, begin, &data, addr).and_then(|complete| {
                        if complete || piece_complete {
                            store.submit(index)?;
                        }
                        Ok(())
                    });
                    if let Err(e) = stored {
                        warn!("Piece {} could not be assembled, restarting it: {}", index, e);
                        store.discard(index);
                        if let Some(scheduler) = self.scheduler.as_mut() {
                            scheduler.piece_failed(index);
                        }
                    }
                }
            }
        }
        self.request_more(addr);
    }

    fn on_peer_closed(&mut self, addr: SocketAddr, reason: Option<TorrentError>) {
        self.peers.remove(&addr);
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.peer_left(addr);
        }

        match &reason {
            Some(error) => debug!("Peer {} dropped: {}", addr, error),
            None => debug!("Peer {} closed", addr),
        }
        let record = self.known.entry(addr).or_default();
        if !record.banned {
            record.retry_after = Some(Instant::now() + self.config.peer_retry_backoff);
            self.candidates.push_back(addr);
        }

        self.fill_peers();
        self.request_more_all();
    }

    async fn on_disk_event(&mut self, event: DiskEvent) {
        match event {
            DiskEvent::PieceVerified { index } => {
                let Some(scheduler) = self.scheduler.as_mut() else { return };
                scheduler.piece_verified(index);
                let complete = scheduler.is_complete();
                if let Some(info) = &self.metadata {
                    self.verified_bytes += info.piece_len(index) as u64;
                }
                debug!("Piece {} verified", index);
                let _ = self.events.send(SessionEvent::PieceVerified(index));
                self.update_stats();
                self.publish_progress();

                if complete {
                    self.complete().await;
                } else {
                    self.update_interest_all();
                }
            }
            DiskEvent::HashMismatch { index, contributors } => {
                warn!("Piece {} failed verification", index);
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.piece_failed(index);
                }
                let _ = self.events.send(SessionEvent::HashMismatch(index));
                for addr in contributors {
                    self.strike(addr);
                }
                self.request_more_all();
            }
            DiskEvent::WriteFailed { index, error } => {
                error!("Writing piece {} failed: {}", index, error);
                let _ = self.events.send(SessionEvent::Error(error));
            }
        }
    }

    /// Count a hash failure against a peer, dropping it at the limit
    fn strike(&mut self, addr: SocketAddr) {
        let record = self.known.entry(addr).or_default();
        record.strikes += 1;
        if record.strikes < self.config.max_hash_failures {
            debug!("Peer {} has {} hash strikes", addr, record.strikes);
            return;
        }

        warn!("Banning peer {} after {} bad pieces", addr, record.strikes);
        record.banned = true;
        self.candidates.retain(|a| *a != addr);
        if let Some(slot) = self.peers.remove(&addr) {
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.peer_left(addr);
            }
            self.closing.spawn(slot.handle.close(PEER_CLOSE_GRACE));
        }
        self.fill_peers();
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        if self.state == SessionState::Downloading {
            if let Some(scheduler) = self.scheduler.as_mut() {
                for (peer, block) in scheduler.expire_requests(now) {
                    trace!("{}", TorrentError::request_timeout(block.index, block.begin, peer.to_string()));
                    if let Some(slot) = self.peers.get(&peer) {
                        slot.handle.send(PeerCommand::Cancel(block));
                    }
                }
            }
            self.fill_peers();
            self.request_more_all();
        }

        while let Some(joined) = self.closing.try_join_next() {
            if let Err(e) = joined {
                warn!("Peer close task failed: {}", e);
            }
        }

        self.throughput.roll(now);
        self.update_stats();
        self.publish_progress();
        if self.state == SessionState::Downloading {
            let progress = self.progress_tx.borrow().clone();
            let _ = self.events.send(SessionEvent::Progress {
                bytes_downloaded: progress.bytes_downloaded,
                download_rate: progress.download_rate,
                peer_count: progress.peer_count,
                eta: progress.eta,
            });
        }
    }

    /// Tell a peer whether it has anything we still need
    fn update_interest(&mut self, addr: SocketAddr) {
        let Some(scheduler) = self.scheduler.as_ref() else { return };
        let interesting = scheduler.is_interesting(&addr);
        let Some(slot) = self.peers.get_mut(&addr) else { return };
        if slot.interested != interesting {
            slot.interested = interesting;
            let command = if interesting { PeerCommand::Interested } else { PeerCommand::NotInterested };
            slot.handle.send(command);
        }
        if interesting {
            self.request_more(addr);
        }
    }

    fn update_interest_all(&mut self) {
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.update_interest(addr);
        }
    }

    /// Fill a peer's free request slots
    fn request_more(&mut self, addr: SocketAddr) {
        if self.state != SessionState::Downloading {
            return;
        }
        let (Some(scheduler), Some(slot)) = (self.scheduler.as_mut(), self.peers.get(&addr)) else {
            return;
        };
        for block in scheduler.next_requests(addr, Instant::now()) {
            if !slot.handle.send(PeerCommand::Request(block)) {
                scheduler.request_dropped(addr, block);
            }
        }
    }

    fn request_more_all(&mut self) {
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.request_more(addr);
        }
    }

    fn retry_writes(&mut self) {
        if let Some(store) = &self.store {
            info!("Retrying paused writes");
            if let Err(e) = store.retry_writes() {
                warn!("Cannot retry writes: {}", e);
            }
        }
    }

    /// Every piece is verified: announce completion and let go of peers
    /// and files. The session stays registered until stopped.
    async fn complete(&mut self) {
        info!("Session {} complete", hex::encode(self.info_hash));
        self.state = SessionState::Done;
        self.candidates.clear();
        if let Some(store) = self.store.take() {
            store.shutdown().await;
        }
        self.disk_events = None;
        self.update_stats();
        self.publish_progress();
        let _ = self.events.send(SessionEvent::Done);

        if let Some(discovery) = self.discovery.take() {
            self.closing.spawn(discovery.finish());
        }
        self.discovery_events = None;
        self.close_peers();
    }

    /// A session-fatal error: report it and stop all activity
    fn fail(&mut self, error: TorrentError) {
        error!("Session {} failed: {}", hex::encode(self.info_hash), error);
        self.state = SessionState::Failed;
        self.candidates.clear();
        self.publish_progress();
        let _ = self.events.send(SessionEvent::Error(error));

        if let Some(discovery) = self.discovery.take() {
            self.closing.spawn(discovery.stop());
        }
        self.discovery_events = None;
        self.close_peers();
    }

    /// Start closing every connected peer
    fn close_peers(&mut self) {
        if let Some(scheduler) = self.scheduler.as_mut() {
            for (peer, block) in scheduler.cancel_all() {
                if let Some(slot) = self.peers.get(&peer) {
                    slot.handle.send(PeerCommand::Cancel(block));
                }
            }
        }
        for (addr, slot) in self.peers.drain() {
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.peer_left(addr);
            }
            self.closing.spawn(slot.handle.close(PEER_CLOSE_GRACE));
        }
    }

    /// Ordered teardown: stop discovery, cancel requests, close peers,
    /// then release every file handle
    async fn teardown(&mut self) {
        debug!("Tearing down session {}", hex::encode(self.info_hash));
        self.candidates.clear();
        if let Some(discovery) = self.discovery.take() {
            discovery.stop().await;
        }
        self.discovery_events = None;

        self.peer_rx.close();
        self.close_peers();
        while let Some(joined) = self.closing.join_next().await {
            if let Err(e) = joined {
                warn!("Close task failed: {}", e);
            }
        }

        if let Some(store) = self.store.take() {
            store.shutdown().await;
        }
        self.disk_events = None;
        debug!(
            "Session {} released all peers ({} file handles open)",
            hex::encode(self.info_hash),
            self.open_handles.load(Ordering::SeqCst)
        );
    }

    fn update_stats(&self) {
        let total = self.metadata.as_ref().map_or(0, |info| info.total_length);
        self.stats_tx.send_replace(TransferStats {
            uploaded: 0,
            downloaded: self.received_bytes,
            left: total.saturating_sub(self.verified_bytes),
        });
    }

    fn publish_progress(&self) {
        let (name, total_bytes, total_pieces) = match (&self.metadata, &self.magnet) {
            (Some(info), _) => (Some(info.name.clone()), info.total_length, info.piece_count()),
            (None, Some(link)) => (link.display_name.clone(), link.total_size.unwrap_or(0), 0),
            (None, None) => (None, 0, 0),
        };
        let rate = self.throughput.rate();
        let remaining = total_bytes.saturating_sub(self.verified_bytes);
        let eta = match self.state {
            SessionState::Done => Some(Duration::ZERO),
            SessionState::Downloading if rate > 0.0 => Some(Duration::from_secs_f64(remaining as f64 / rate)),
            _ => None,
        };

        self.progress_tx.send_replace(SessionProgress {
            info_hash: self.info_hash,
            name,
            state: self.state,
            bytes_downloaded: self.verified_bytes,
            bytes_uploaded: 0,
            total_bytes,
            verified_pieces: self.scheduler.as_ref().map_or(0, PieceScheduler::verified_count),
            total_pieces,
            peer_count: self.peers.values().filter(|slot| slot.handle.snapshot().connection.is_established()).count(),
            download_rate: rate,
            eta,
        });
    }
}
