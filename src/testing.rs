//! Test fixtures: synthetic torrents and a loopback seeder

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_bencode::value::Value;
use sha1::{Digest, Sha1};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use crate::bitfield::Bitfield;
use crate::protocol::{BitTorrentWire, Handshake, Message, WireProtocol};
use crate::torrent::{TorrentInfo, TorrentParser};

/// A bencoded descriptor and the content it describes
#[derive(Debug, Clone)]
pub struct Fixture {
    pub bytes: Vec<u8>,
    /// Exact bytes of the `info` dictionary
    pub info_bytes: Vec<u8>,
    pub info_hash: [u8; 20],
    /// Content of every file, concatenated in order
    pub content: Vec<u8>,
}

impl Fixture {
    pub fn info(&self) -> TorrentInfo {
        TorrentParser::parse_bytes(&self.bytes).unwrap()
    }
}

/// One file of a multi-file fixture
#[derive(Debug, Clone)]
pub struct FixtureFile {
    path: Vec<String>,
    content: Vec<u8>,
}

impl FixtureFile {
    pub fn new(path: &[&str], content: Vec<u8>) -> Self {
        Self { path: path.iter().map(|s| s.to_string()).collect(), content }
    }
}

fn bytes(s: &str) -> Value {
    Value::Bytes(s.as_bytes().to_vec())
}

fn dict(entries: Vec<(&str, Value)>) -> Value {
    Value::Dict(entries.into_iter().map(|(k, v)| (k.as_bytes().to_vec(), v)).collect::<HashMap<_, _>>())
}

fn piece_hashes(content: &[u8], piece_length: u64) -> Vec<u8> {
    content
        .chunks(piece_length as usize)
        .flat_map(|chunk| -> [u8; 20] { Sha1::digest(chunk).into() })
        .collect()
}

fn finish(info: Value, trackers: &[&str], content: Vec<u8>) -> Fixture {
    let info_bytes = serde_bencode::to_bytes(&info).unwrap();
    let info_hash: [u8; 20] = Sha1::digest(&info_bytes).into();

    let mut root = vec![("info", info)];
    if let Some(first) = trackers.first() {
        root.push(("announce", bytes(first)));
        let tiers = trackers.iter().map(|t| Value::List(vec![bytes(t)])).collect();
        root.push(("announce-list", Value::List(tiers)));
    }
    let bytes = serde_bencode::to_bytes(&dict(root)).unwrap();

    Fixture { bytes, info_bytes, info_hash, content }
}

/// Single-file descriptor announcing to `http://tracker.test/announce`
pub fn build_torrent(name: &str, content: &[u8], piece_length: u64) -> Fixture {
    let info = dict(vec![
        ("name", bytes(name)),
        ("length", Value::Int(content.len() as i64)),
        ("piece length", Value::Int(piece_length as i64)),
        ("pieces", Value::Bytes(piece_hashes(content, piece_length))),
    ]);
    finish(info, &["http://tracker.test/announce"], content.to_vec())
}

/// Multi-file descriptor with one announce-list tier per tracker
pub fn build_torrent_with(name: &str, files: &[FixtureFile], piece_length: u64, trackers: &[&str]) -> Fixture {
    let content: Vec<u8> = files.iter().flat_map(|f| f.content.iter().copied()).collect();
    let file_list = files
        .iter()
        .map(|f| {
            dict(vec![
                ("length", Value::Int(f.content.len() as i64)),
                ("path", Value::List(f.path.iter().map(|p| bytes(p)).collect())),
            ])
        })
        .collect();
    let info = dict(vec![
        ("name", bytes(name)),
        ("files", Value::List(file_list)),
        ("piece length", Value::Int(piece_length as i64)),
        ("pieces", Value::Bytes(piece_hashes(&content, piece_length))),
    ]);
    finish(info, trackers, content)
}

/// Poll `check` until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

struct OpenGuard(Arc<AtomicUsize>);

impl OpenGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct SeedData {
    info: Arc<TorrentInfo>,
    content: Arc<Vec<u8>>,
    corrupt_once: Arc<Mutex<HashSet<u32>>>,
    /// Pause before answering each request
    delay: Duration,
    /// Unchoke but never answer requests
    stall: bool,
    served: Arc<AtomicUsize>,
    cancelled: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
}

/// Loopback peer that holds every piece and answers requests
pub struct FakeSeeder {
    addr: SocketAddr,
    served: Arc<AtomicUsize>,
    cancelled: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeSeeder {
    pub async fn start(fixture: &Fixture) -> Self {
        Self::launch(fixture, &[], Duration::ZERO, false).await
    }

    /// Seeder that corrupts the first copy of each listed piece it serves
    pub async fn with_corruption(fixture: &Fixture, pieces: &[u32]) -> Self {
        Self::launch(fixture, pieces, Duration::ZERO, false).await
    }

    /// Seeder that waits `delay` before answering each request
    pub async fn with_delay(fixture: &Fixture, delay: Duration) -> Self {
        Self::launch(fixture, &[], delay, false).await
    }

    /// Seeder that unchokes and accepts requests but never answers them
    pub async fn stalled(fixture: &Fixture) -> Self {
        Self::launch(fixture, &[], Duration::ZERO, true).await
    }

    async fn launch(fixture: &Fixture, pieces: &[u32], delay: Duration, stall: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let data = SeedData {
            info: Arc::new(fixture.info()),
            content: Arc::new(fixture.content.clone()),
            corrupt_once: Arc::new(Mutex::new(pieces.iter().copied().collect())),
            delay,
            stall,
            served: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicUsize::new(0)),
            open: Arc::new(AtomicUsize::new(0)),
        };
        let served = Arc::clone(&data.served);
        let cancelled = Arc::clone(&data.cancelled);
        let open = Arc::clone(&data.open);

        let task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            while let Ok((stream, _)) = listener.accept().await {
                connections.spawn(serve(stream, data.clone()));
            }
        });

        Self { addr, served, cancelled, open, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Block requests received so far
    pub fn requests_received(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    /// Cancel messages received so far
    pub fn cancelled_requests(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Connections currently open
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for FakeSeeder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, data: SeedData) {
    let _guard = OpenGuard::new(&data.open);
    let (mut reader, mut writer) = stream.into_split();
    let mut read_wire = BitTorrentWire::default();
    let mut write_wire = BitTorrentWire::default();

    let Ok(theirs) = read_wire.read_handshake(&mut reader).await else { return };
    if theirs.info_hash != data.info.info_hash {
        return;
    }
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(b"-FS0001-");
    if write_wire.write_handshake(&mut writer, &Handshake::new(data.info.info_hash, peer_id)).await.is_err() {
        return;
    }

    let bitfield = Bitfield::full(data.info.piece_count());
    let message = Message::Bitfield { bitfield: Bytes::copy_from_slice(bitfield.as_bytes()) };
    if write_wire.write_message(&mut writer, &message).await.is_err() {
        return;
    }

    while let Ok(message) = read_wire.read_message(&mut reader).await {
        let reply = match message {
            Message::Interested => Message::Unchoke,
            Message::Cancel(_) => {
                data.cancelled.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            Message::Request(_) if data.stall => {
                data.served.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            Message::Request(block) => {
                data.served.fetch_add(1, Ordering::SeqCst);
                if !data.delay.is_zero() {
                    tokio::time::sleep(data.delay).await;
                }
                let start = (data.info.piece_offset(block.index) + block.begin as u64) as usize;
                let end = (start + block.length as usize).min(data.content.len());
                let mut payload = data.content[start..end].to_vec();
                let corrupt = block.begin == 0 && data.corrupt_once.lock().unwrap().remove(&block.index);
                if corrupt {
                    payload[0] ^= 0xff;
                }
                Message::Piece { index: block.index, begin: block.begin, block: Bytes::from(payload) }
            }
            _ => continue,
        };
        if write_wire.write_message(&mut writer, &reply).await.is_err() {
            return;
        }
    }
}
