//! Peer connection task
//!
//! One task per peer drives the wire protocol over a byte stream. The
//! session talks to it through [`PeerCommand`]s and hears back through
//! [`PeerEvent`]s; the connection's [`PeerState`] is published as
//! read-only snapshots on a watch channel.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::bitfield::Bitfield;
use crate::config::EngineConfig;
use crate::error::TorrentError;
use crate::peer::state::{ConnectionState, PeerState, Throughput};
use crate::protocol::{BitTorrentWire, BlockInfo, Handshake, Message, PeerCapabilities, WireProtocol};

/// Buffered commands per connection
const COMMAND_CAPACITY: usize = 64;

/// Messages read ahead of the connection loop
const READ_QUEUE: usize = 16;

/// Parameters a connection needs from its session
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub piece_count: usize,
    pub max_outstanding: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
}

impl ConnectionParams {
    pub fn new(config: &EngineConfig, info_hash: [u8; 20], piece_count: usize) -> Self {
        Self {
            info_hash,
            peer_id: config.peer_id,
            piece_count,
            max_outstanding: config.max_outstanding_requests,
            connect_timeout: config.connect_timeout,
            handshake_timeout: config.handshake_timeout,
            keepalive_interval: config.keepalive_interval,
            idle_timeout: config.idle_timeout,
            write_timeout: config.request_timeout,
        }
    }
}

/// Instructions from the session to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    /// Request a block
    Request(BlockInfo),
    /// Cancel an earlier request
    Cancel(BlockInfo),
    Interested,
    NotInterested,
    /// Close the connection
    Close,
}

/// What a connection reports to its session
#[derive(Debug)]
pub enum PeerEventKind {
    /// Handshake verified
    Established {
        peer_id: [u8; 20],
        capabilities: PeerCapabilities,
    },
    /// Peer replaced its advertised piece set
    Bitfield(Bitfield),
    /// Peer announced one more piece
    Have(u32),
    /// Peer choked us; its outstanding requests are void
    Choked,
    /// Peer unchoked us
    Unchoked,
    /// A requested block arrived
    Block {
        index: u32,
        begin: u32,
        data: Bytes,
    },
    /// A request could not be sent (choked, over the cap, or piece not held)
    RequestRejected(BlockInfo),
    /// Connection ended; `None` on a requested close
    Closed(Option<TorrentError>),
}

/// Event tagged with the peer it came from
#[derive(Debug)]
pub struct PeerEvent {
    pub addr: SocketAddr,
    pub kind: PeerEventKind,
}

/// Session-side handle to a running connection task
#[derive(Debug)]
pub struct PeerHandle {
    addr: SocketAddr,
    commands: mpsc::Sender<PeerCommand>,
    state: watch::Receiver<PeerState>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a command without waiting. Returns false if the connection
    /// is gone or its queue is full.
    pub fn send(&self, command: PeerCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                trace!("Command to {} not delivered: {}", self.addr, e);
                false
            }
        }
    }

    /// Latest published state
    pub fn snapshot(&self) -> PeerState {
        self.state.borrow().clone()
    }

    /// Close the connection and wait for the task to exit. A task that
    /// does not stop within `grace` is aborted.
    pub async fn close(self, grace: Duration) {
        let PeerHandle { addr, commands, mut task, .. } = self;
        let _ = commands.try_send(PeerCommand::Close);
        drop(commands);

        if timeout(grace, &mut task).await.is_err() {
            warn!("Peer {} did not close within {:?}, aborting", addr, grace);
            task.abort();
            let _ = task.await;
        }
        debug!("Peer {} closed", addr);
    }
}

/// Open an outbound TCP connection to `addr` and run the protocol on it
pub fn connect(addr: SocketAddr, params: ConnectionParams, events: mpsc::Sender<PeerEvent>) -> PeerHandle {
    let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (state_tx, state) = watch::channel(PeerState::new(addr, params.piece_count));

    let task = tokio::spawn(async move {
        debug!("Connecting to peer: {}", addr);
        let stream = match timeout(params.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Failed to connect to {}: {}", addr, e);
                let reason = TorrentError::connection_lost_full("Failed to connect", addr.to_string(), e.to_string());
                fail_before_start(addr, &state_tx, &events, reason).await;
                return;
            }
            Err(_) => {
                debug!("Connection timeout to {}", addr);
                let reason = TorrentError::connection_lost("Connection timeout", addr.to_string());
                fail_before_start(addr, &state_tx, &events, reason).await;
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        PeerConnection::new(addr, params, events, command_rx, state_tx).run(stream).await;
    });

    PeerHandle { addr, commands, state, task }
}

/// Run the protocol over an already-open stream
pub fn attach<S>(addr: SocketAddr, stream: S, params: ConnectionParams, events: mpsc::Sender<PeerEvent>) -> PeerHandle
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (state_tx, state) = watch::channel(PeerState::new(addr, params.piece_count));

    let task = tokio::spawn(async move {
        PeerConnection::new(addr, params, events, command_rx, state_tx).run(stream).await;
    });

    PeerHandle { addr, commands, state, task }
}

async fn fail_before_start(
    addr: SocketAddr,
    state_tx: &watch::Sender<PeerState>,
    events: &mpsc::Sender<PeerEvent>,
    reason: TorrentError,
) {
    state_tx.send_modify(|s| s.connection = ConnectionState::Closed);
    let _ = events.send(PeerEvent { addr, kind: PeerEventKind::Closed(Some(reason)) }).await;
}

/// Map a framing error to the taxonomy: protocol violations stay as
/// they are, everything else is a lost connection.
fn classify(addr: SocketAddr, err: anyhow::Error) -> TorrentError {
    match err.downcast::<TorrentError>() {
        Ok(TorrentError::PeerProtocolError { message, source, .. }) => TorrentError::PeerProtocolError {
            message,
            peer: Some(addr.to_string()),
            source,
        },
        Ok(other) => other,
        Err(err) => TorrentError::connection_lost_full("Connection failed", addr.to_string(), err.to_string()),
    }
}

struct PeerConnection {
    state: PeerState,
    params: ConnectionParams,
    wire: BitTorrentWire,
    events: mpsc::Sender<PeerEvent>,
    commands: mpsc::Receiver<PeerCommand>,
    state_tx: watch::Sender<PeerState>,
    pending: HashSet<BlockInfo>,
    throughput: Throughput,
    last_write: Instant,
}

impl PeerConnection {
    fn new(
        addr: SocketAddr,
        params: ConnectionParams,
        events: mpsc::Sender<PeerEvent>,
        commands: mpsc::Receiver<PeerCommand>,
        state_tx: watch::Sender<PeerState>,
    ) -> Self {
        Self {
            state: PeerState::new(addr, params.piece_count),
            params,
            wire: BitTorrentWire::default(),
            events,
            commands,
            state_tx,
            pending: HashSet::new(),
            throughput: Throughput::default(),
            last_write: Instant::now(),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.state.addr
    }

    async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let result = self.drive(stream).await;
        self.transition(ConnectionState::Closing);

        let reason = match result {
            Ok(()) => {
                debug!("Connection to {} closed on request", self.addr());
                None
            }
            Err(e) => {
                debug!("Connection to {} ended: {}", self.addr(), e);
                Some(e)
            }
        };

        self.transition(ConnectionState::Closed);
        let addr = self.addr();
        let _ = self.events.send(PeerEvent { addr, kind: PeerEventKind::Closed(reason) }).await;
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state.connection.can_transition_to(next) {
            trace!("Peer {}: {:?} -> {:?}", self.addr(), self.state.connection, next);
            self.state.connection = next;
            self.publish();
        }
    }

    fn publish(&mut self) {
        self.state.outstanding = self.pending.len();
        self.state.download_rate = self.throughput.rate();
        self.state_tx.send_replace(self.state.clone());
    }

    async fn emit(&self, kind: PeerEventKind) -> Result<(), TorrentError> {
        self.events
            .send(PeerEvent { addr: self.addr(), kind })
            .await
            .map_err(|_| TorrentError::connection_lost("Session stopped listening", self.addr().to_string()))
    }

    async fn drive<S>(&mut self, mut stream: S) -> Result<(), TorrentError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let addr = self.addr();
        self.transition(ConnectionState::Handshaking);

        let ours = Handshake::new(self.params.info_hash, self.params.peer_id);
        let wire = &mut self.wire;
        let exchange = async {
            wire.write_handshake(&mut stream, &ours).await?;
            wire.read_handshake(&mut stream).await
        };
        let theirs = timeout(self.params.handshake_timeout, exchange)
            .await
            .map_err(|_| TorrentError::connection_lost("Handshake timed out", addr.to_string()))?
            .map_err(|e| classify(addr, e))?;

        if !theirs.validate(&self.params.info_hash) {
            return Err(TorrentError::protocol_error_with_peer("Handshake info hash mismatch", addr.to_string()));
        }
        if theirs.peer_id == self.params.peer_id {
            return Err(TorrentError::protocol_error_with_peer("Connected to ourselves", addr.to_string()));
        }

        info!("Handshake completed with peer {} ({})", addr, hex::encode(theirs.peer_id));
        self.state.peer_id = Some(theirs.peer_id);
        self.state.capabilities = theirs.capabilities;
        self.transition(ConnectionState::Established);
        self.emit(PeerEventKind::Established {
            peer_id: theirs.peer_id,
            capabilities: theirs.capabilities,
        })
        .await?;

        let (read_half, mut write_half) = tokio::io::split(stream);
        let (msg_tx, mut incoming) = mpsc::channel::<anyhow::Result<Message>>(READ_QUEUE);
        let reader = tokio::spawn(async move {
            let mut read_half = read_half;
            let mut wire = BitTorrentWire::default();
            loop {
                let result = wire.read_message(&mut read_half).await;
                let failed = result.is_err();
                if msg_tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });

        let result = self.message_loop(&mut write_half, &mut incoming).await;
        reader.abort();
        let _ = timeout(Duration::from_secs(1), write_half.shutdown()).await;
        result
    }

    async fn message_loop<W>(
        &mut self,
        writer: &mut W,
        incoming: &mut mpsc::Receiver<anyhow::Result<Message>>,
    ) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let addr = self.addr();
        let tick = (self.params.keepalive_interval / 2)
            .clamp(Duration::from_millis(10), Duration::from_secs(5));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_read = Instant::now();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PeerCommand::Close) | None => return Ok(()),
                    Some(command) => self.handle_command(command, writer).await?,
                },
                message = incoming.recv() => match message {
                    Some(Ok(message)) => {
                        last_read = Instant::now();
                        self.handle_message(message).await?;
                    }
                    Some(Err(e)) => return Err(classify(addr, e)),
                    None => return Err(TorrentError::connection_lost("Reader stopped", addr.to_string())),
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    if now.duration_since(last_read) >= self.params.idle_timeout {
                        warn!("Peer {} idle for {:?}, dropping", addr, self.params.idle_timeout);
                        return Err(TorrentError::connection_lost("Peer idle timeout", addr.to_string()));
                    }
                    if now.duration_since(self.last_write) >= self.params.keepalive_interval {
                        trace!("Sending KeepAlive to peer: {}", addr);
                        self.write(writer, &Message::KeepAlive).await?;
                    }
                    self.throughput.roll(now);
                    self.publish();
                }
            }
        }
    }

    async fn write<W>(&mut self, writer: &mut W, message: &Message) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let addr = self.addr();
        match timeout(self.params.write_timeout, self.wire.write_message(writer, message)).await {
            Ok(Ok(())) => {
                self.last_write = Instant::now();
                Ok(())
            }
            Ok(Err(e)) => Err(classify(addr, e)),
            Err(_) => Err(TorrentError::connection_lost("Write timed out", addr.to_string())),
        }
    }

    async fn handle_command<W>(&mut self, command: PeerCommand, writer: &mut W) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Send + Unpin,
    {
        match command {
            PeerCommand::Request(block) => {
                let allowed = !self.state.peer_choking
                    && self.pending.len() < self.params.max_outstanding
                    && self.state.has_piece(block.index);
                if !allowed {
                    trace!("Rejecting request {:?} to {}", block, self.addr());
                    return self.emit(PeerEventKind::RequestRejected(block)).await;
                }
                trace!("Requesting piece {} block {} ({} bytes) from {}", block.index, block.begin, block.length, self.addr());
                self.write(writer, &Message::Request(block)).await?;
                self.pending.insert(block);
                self.publish();
            }
            PeerCommand::Cancel(block) => {
                if self.pending.remove(&block) {
                    debug!("Cancelling piece {} block {} at {}", block.index, block.begin, self.addr());
                    self.write(writer, &Message::Cancel(block)).await?;
                    self.publish();
                }
            }
            PeerCommand::Interested => {
                if !self.state.am_interested {
                    self.write(writer, &Message::Interested).await?;
                    self.state.am_interested = true;
                    self.publish();
                }
            }
            PeerCommand::NotInterested => {
                if self.state.am_interested {
                    self.write(writer, &Message::NotInterested).await?;
                    self.state.am_interested = false;
                    self.publish();
                }
            }
            PeerCommand::Close => {}
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), TorrentError> {
        let addr = self.addr();
        match message {
            Message::KeepAlive => trace!("KeepAlive from {}", addr),
            Message::Choke => {
                debug!("Peer {} choked us, voiding {} requests", addr, self.pending.len());
                self.state.peer_choking = true;
                self.pending.clear();
                self.publish();
                self.emit(PeerEventKind::Choked).await?;
            }
            Message::Unchoke => {
                debug!("Peer {} unchoked us", addr);
                self.state.peer_choking = false;
                self.publish();
                self.emit(PeerEventKind::Unchoked).await?;
            }
            Message::Interested => self.state.peer_interested = true,
            Message::NotInterested => self.state.peer_interested = false,
            Message::Have { piece_index } => {
                if !self.state.bitfield.set(piece_index as usize) {
                    return Err(TorrentError::protocol_error_with_peer(
                        format!("Have for out-of-range piece {}", piece_index),
                        addr.to_string(),
                    ));
                }
                self.publish();
                self.emit(PeerEventKind::Have(piece_index)).await?;
            }
            Message::Bitfield { bitfield } => {
                let field = Bitfield::from_bytes(&bitfield, self.params.piece_count).map_err(|e| classify(addr, e))?;
                debug!("Peer {} has {}/{} pieces", addr, field.count(), field.len());
                self.state.bitfield = field.clone();
                self.publish();
                self.emit(PeerEventKind::Bitfield(field)).await?;
            }
            Message::Request(block) => {
                trace!("Ignoring request {:?} from {}: we are choking", block, addr);
            }
            Message::Piece { index, begin, block } => {
                if index as usize >= self.params.piece_count {
                    return Err(TorrentError::protocol_error_with_peer(
                        format!("Block for out-of-range piece {}", index),
                        addr.to_string(),
                    ));
                }
                let key = BlockInfo { index, begin, length: block.len() as u32 };
                if !self.pending.remove(&key) {
                    trace!("Discarding unrequested block {:?} from {}", key, addr);
                    return Ok(());
                }
                self.state.bytes_downloaded += block.len() as u64;
                self.throughput.record(block.len() as u64, Instant::now());
                self.publish();
                self.emit(PeerEventKind::Block { index, begin, data: block }).await?;
            }
            Message::Cancel(_) => trace!("Ignoring cancel from {}", addr),
            Message::Port { listen_port } => debug!("Peer {} advertised DHT port {}", addr, listen_port),
        }
        Ok(())
    }
}
