//! Piece store
//!
//! [`PieceStore`] buffers blocks for the session loop and hands complete
//! pieces to a disk worker task. The worker owns the file set: it hashes
//! each piece, writes verified data across the files it spans and reports
//! the outcome back as [`DiskEvent`]s. Jobs are processed one at a time,
//! so writes to overlapping file regions never interleave.
//!
//! A failed write parks the piece in memory and pauses the affected file.
//! Parked pieces are written again on [`PieceStore::retry_writes`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::TorrentError;
use crate::storage::file::FileStorage;
use crate::storage::piece::{verify_piece, PieceBuffer};
use crate::torrent::TorrentInfo;

/// Work for the disk worker
#[derive(Debug)]
enum DiskJob {
    Verify {
        index: u32,
        data: Vec<u8>,
        contributors: Vec<SocketAddr>,
    },
    RetryParked,
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Outcome reported by the disk worker
#[derive(Debug)]
pub enum DiskEvent {
    /// Piece hashed correctly and is on disk
    PieceVerified { index: u32 },
    /// Piece failed its hash check and was discarded
    HashMismatch {
        index: u32,
        contributors: Vec<SocketAddr>,
    },
    /// Piece hashed correctly but could not be written; it stays parked
    WriteFailed { index: u32, error: TorrentError },
}

/// Block assembly plus a handle to the disk worker
#[derive(Debug)]
pub struct PieceStore {
    info: Arc<TorrentInfo>,
    block_size: u32,
    buffers: HashMap<u32, PieceBuffer>,
    jobs: mpsc::UnboundedSender<DiskJob>,
    worker: Option<JoinHandle<()>>,
    open_handles: Arc<AtomicUsize>,
}

impl PieceStore {
    /// Start the disk worker over `storage`. Must be called inside a
    /// tokio runtime.
    pub fn start(storage: FileStorage, block_size: u32) -> (Self, mpsc::UnboundedReceiver<DiskEvent>) {
        let (jobs, job_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let info = Arc::clone(storage.info());
        let open_handles = storage.handle_counter();

        let worker = DiskWorker {
            storage,
            events: event_tx,
            paused: HashSet::new(),
            parked: BTreeMap::new(),
        };
        let worker = tokio::spawn(worker.run(job_rx));

        let store = Self {
            info,
            block_size,
            buffers: HashMap::new(),
            jobs,
            worker: Some(worker),
            open_handles,
        };
        (store, events)
    }

    /// Add a received block to its piece's assembly buffer. Returns true
    /// once the piece has every block.
    pub fn add_block(&mut self, index: u32, begin: u32, data: &Bytes, peer: SocketAddr) -> Result<bool> {
        if index as usize >= self.info.piece_count() {
            return Err(TorrentError::protocol_error(format!("Piece {} out of range", index)).into());
        }
        let length = self.info.piece_len(index);
        let block_size = self.block_size;
        let buffer = self
            .buffers
            .entry(index)
            .or_insert_with(|| PieceBuffer::new(index, length, block_size));
        buffer.add_block(begin, data, peer)?;
        Ok(buffer.is_complete())
    }

    /// Send a complete piece to the disk worker for hashing and writing
    pub fn submit(&mut self, index: u32) -> Result<()> {
        let Some(buffer) = self.buffers.remove(&index) else {
            return Err(TorrentError::io_error(format!("No buffer for piece {}", index)).into());
        };
        if !buffer.is_complete() {
            let received = buffer.received_blocks();
            self.buffers.insert(index, buffer);
            return Err(TorrentError::io_error(format!("Piece {} incomplete ({} blocks)", index, received)).into());
        }

        let (data, contributors) = buffer.into_parts();
        debug!("Submitting piece {} ({} bytes) for verification", index, data.len());
        self.jobs
            .send(DiskJob::Verify { index, data, contributors })
            .map_err(|_| TorrentError::io_error("Disk worker stopped"))?;
        Ok(())
    }

    /// Drop a partially assembled piece
    pub fn discard(&mut self, index: u32) {
        self.buffers.remove(&index);
    }

    /// Bytes held in assembly buffers
    pub fn buffered_bytes(&self) -> usize {
        self.buffers.values().map(PieceBuffer::len).sum()
    }

    /// Resume paused files and write parked pieces again
    pub fn retry_writes(&self) -> Result<()> {
        self.jobs
            .send(DiskJob::RetryParked)
            .map_err(|_| TorrentError::io_error("Disk worker stopped"))?;
        Ok(())
    }

    fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Shared handle counter
    pub fn handle_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.open_handles)
    }

    /// Finish queued jobs, stop the worker and wait for it to exit. No
    /// file handle is open once this returns.
    pub async fn shutdown(mut self) {
        self.buffers.clear();
        let (ack, done) = oneshot::channel();
        if self.jobs.send(DiskJob::Shutdown { ack }).is_ok() {
            let _ = done.await;
        }
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("Disk worker ended abnormally: {}", e);
            }
        }
        debug!("Piece store shut down ({} handles open)", self.open_handles());
    }
}

struct DiskWorker {
    storage: FileStorage,
    events: mpsc::UnboundedSender<DiskEvent>,
    /// Files with a failed write
    paused: HashSet<usize>,
    /// Verified pieces waiting for their files to resume
    parked: BTreeMap<u32, Vec<u8>>,
}

impl DiskWorker {
    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<DiskJob>) {
        while let Some(job) = jobs.recv().await {
            match job {
                DiskJob::Verify { index, data, contributors } => self.verify(index, data, contributors).await,
                DiskJob::RetryParked => self.retry_parked().await,
                DiskJob::Shutdown { ack } => {
                    if !self.parked.is_empty() {
                        warn!("Shutting down with {} pieces not written", self.parked.len());
                    }
                    let _ = ack.send(());
                    return;
                }
            }
        }
    }

    async fn verify(&mut self, index: u32, data: Vec<u8>, contributors: Vec<SocketAddr>) {
        let (matches, data) = verify_piece(data, self.storage.info().piece_hash(index)).await;
        if !matches {
            warn!("Piece {} failed hash check", index);
            let _ = self.events.send(DiskEvent::HashMismatch { index, contributors });
            return;
        }

        if let Some(file_index) = self.paused_file_for(index) {
            debug!("Parking piece {}: writes to file {} are paused", index, file_index);
            self.parked.insert(index, data);
            return;
        }

        self.write(index, data).await;
    }

    async fn write(&mut self, index: u32, data: Vec<u8>) {
        let info = Arc::clone(self.storage.info());
        let start = info.piece_offset(index);

        let mut consumed = 0usize;
        for slice in info.file_slices(start, data.len() as u64) {
            let chunk = &data[consumed..consumed + slice.length as usize];
            if let Err(e) = self.storage.write_at(slice.file_index, slice.file_offset, chunk).await {
                let error = match e.downcast::<TorrentError>() {
                    Ok(err) => err,
                    Err(other) => TorrentError::io_error(other.to_string()),
                };
                error!("Write of piece {} failed, pausing file {}: {}", index, slice.file_index, error);
                self.paused.insert(slice.file_index);
                self.parked.insert(index, data);
                let _ = self.events.send(DiskEvent::WriteFailed { index, error });
                return;
            }
            consumed += slice.length as usize;
        }

        info!("Piece {} verified and written", index);
        let _ = self.events.send(DiskEvent::PieceVerified { index });
    }

    async fn retry_parked(&mut self) {
        if self.parked.is_empty() && self.paused.is_empty() {
            return;
        }
        info!("Retrying {} parked pieces", self.parked.len());
        self.paused.clear();

        let parked = std::mem::take(&mut self.parked);
        for (index, data) in parked {
            if let Some(file_index) = self.paused_file_for(index) {
                debug!("File {} paused again, keeping piece {} parked", file_index, index);
                self.parked.insert(index, data);
                continue;
            }
            self.write(index, data).await;
        }
    }

    fn paused_file_for(&self, index: u32) -> Option<usize> {
        let info = self.storage.info();
        let (start, end) = info.piece_range(index)?;
        info.file_slices(start, end - start)
            .into_iter()
            .map(|s| s.file_index)
            .find(|f| self.paused.contains(f))
    }
}
