//! Piece scheduler
//!
//! Decides which blocks to request from which peer. The scheduler owns
//! the piece state table and the in-flight request table and is driven
//! synchronously by the session loop, so it never touches the network
//! and can be exercised deterministically in tests.
//!
//! Policy: rarest-first over non-verified pieces (ties broken by lowest
//! index), lowest missing offset first within a piece, a per-peer cap on
//! outstanding requests, and an endgame mode once few pieces remain in
//! which a pending block may be requested from several peers at once.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::bitfield::Bitfield;
use crate::config::EngineConfig;
use crate::protocol::BlockInfo;
use crate::torrent::TorrentInfo;

/// Peers are identified by their address within a session
pub type PeerKey = SocketAddr;

/// Download state of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    /// Nothing requested yet, or discarded after a failed hash check
    Missing,
    /// Some blocks requested or received
    InProgress,
    /// Hash verified and written; never requested again
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Missing,
    Requested,
    Received,
}

#[derive(Debug)]
struct PieceState {
    status: PieceStatus,
    blocks: Vec<BlockState>,
}

impl PieceState {
    fn is_assembled(&self) -> bool {
        self.blocks.iter().all(|b| *b == BlockState::Received)
    }
}

/// One outstanding copy of a block request
#[derive(Debug, Clone, Copy)]
struct InFlight {
    peer: PeerKey,
    requested_at: Instant,
}

#[derive(Debug)]
struct PeerView {
    bitfield: Bitfield,
    choked: bool,
    outstanding: HashSet<BlockInfo>,
}

/// Result of handing a received block to the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// First copy of the block. `cancels` lists other peers still holding
    /// a request for it; `piece_complete` is set once every block of the
    /// piece has arrived.
    Accepted {
        cancels: Vec<(PeerKey, BlockInfo)>,
        piece_complete: bool,
    },
    /// Already received, verified, or never requested; discard it
    Duplicate,
}

/// Rarest-first block scheduler with endgame support
#[derive(Debug)]
pub struct PieceScheduler {
    pieces: Vec<PieceState>,
    piece_lengths: Vec<u32>,
    availability: Vec<u32>,
    peers: HashMap<PeerKey, PeerView>,
    in_flight: HashMap<BlockInfo, Vec<InFlight>>,
    block_size: u32,
    max_outstanding: usize,
    endgame_threshold: usize,
    request_timeout: Duration,
    verified: usize,
}

impl PieceScheduler {
    pub fn new(info: &TorrentInfo, config: &EngineConfig) -> Self {
        let count = info.piece_count();
        let pieces = (0..count as u32)
            .map(|index| PieceState {
                status: PieceStatus::Missing,
                blocks: vec![BlockState::Missing; info.block_count(index, config.block_size) as usize],
            })
            .collect();

        Self {
            pieces,
            piece_lengths: (0..count as u32).map(|i| info.piece_len(i)).collect(),
            availability: vec![0; count],
            peers: HashMap::new(),
            in_flight: HashMap::new(),
            block_size: config.block_size,
            max_outstanding: config.max_outstanding_requests,
            endgame_threshold: config.endgame_threshold,
            request_timeout: config.request_timeout,
            verified: 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn status(&self, index: u32) -> Option<PieceStatus> {
        self.pieces.get(index as usize).map(|p| p.status)
    }

    pub fn verified_count(&self) -> usize {
        self.verified
    }

    pub fn is_complete(&self) -> bool {
        self.verified == self.pieces.len()
    }

    /// Endgame starts once fewer than the threshold pieces remain unverified
    pub fn in_endgame(&self) -> bool {
        let remaining = self.pieces.len() - self.verified;
        remaining > 0 && remaining < self.endgame_threshold
    }

    /// Number of outstanding request copies across all peers
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.values().map(Vec::len).sum()
    }

    /// Outstanding requests held by one peer
    pub fn outstanding(&self, peer: &PeerKey) -> usize {
        self.peers.get(peer).map_or(0, |p| p.outstanding.len())
    }

    /// Peers advertising a piece
    pub fn availability(&self, index: u32) -> u32 {
        self.availability.get(index as usize).copied().unwrap_or(0)
    }

    /// Register a newly established peer. It starts choked with no pieces.
    pub fn peer_joined(&mut self, peer: PeerKey) {
        self.peers.entry(peer).or_insert_with(|| PeerView {
            bitfield: Bitfield::new(self.pieces.len()),
            choked: true,
            outstanding: HashSet::new(),
        });
    }

    /// Replace a peer's advertised piece set
    pub fn peer_bitfield(&mut self, peer: PeerKey, bitfield: &Bitfield) {
        self.peer_joined(peer);
        let Some(view) = self.peers.get_mut(&peer) else { return };
        for index in view.bitfield.iter_set() {
            self.availability[index] = self.availability[index].saturating_sub(1);
        }
        for index in bitfield.iter_set() {
            self.availability[index] += 1;
        }
        view.bitfield = bitfield.clone();
    }

    /// Record one more piece advertised by a peer
    pub fn peer_have(&mut self, peer: PeerKey, index: u32) {
        self.peer_joined(peer);
        if let Some(view) = self.peers.get_mut(&peer) {
            if !view.bitfield.has(index as usize) && view.bitfield.set(index as usize) {
                self.availability[index as usize] += 1;
            }
        }
    }

    pub fn peer_unchoked(&mut self, peer: PeerKey) {
        if let Some(view) = self.peers.get_mut(&peer) {
            view.choked = false;
        }
    }

    /// A choke voids every request the peer was holding
    pub fn peer_choked(&mut self, peer: PeerKey) {
        if let Some(view) = self.peers.get_mut(&peer) {
            view.choked = true;
        }
        let requeued = self.release_peer_requests(peer);
        if requeued > 0 {
            debug!("Requeued {} requests after choke from {}", requeued, peer);
        }
    }

    /// Forget a peer, requeueing its requests and dropping its availability
    pub fn peer_left(&mut self, peer: PeerKey) {
        let requeued = self.release_peer_requests(peer);
        if let Some(view) = self.peers.remove(&peer) {
            for index in view.bitfield.iter_set() {
                self.availability[index] = self.availability[index].saturating_sub(1);
            }
        }
        if requeued > 0 {
            debug!("Requeued {} requests from departed peer {}", requeued, peer);
        }
    }

    /// Whether a peer holds any piece we still need
    pub fn is_interesting(&self, peer: &PeerKey) -> bool {
        self.peers.get(peer).is_some_and(|view| {
            view.bitfield
                .iter_set()
                .any(|i| self.pieces[i].status != PieceStatus::Verified)
        })
    }

    /// Pick the next blocks to request from `peer`, filling its free
    /// request slots. The returned requests are recorded as in flight.
    pub fn next_requests(&mut self, peer: PeerKey, now: Instant) -> Vec<BlockInfo> {
        let (slots, order) = {
            let Some(view) = self.peers.get(&peer) else { return Vec::new() };
            if view.choked {
                return Vec::new();
            }
            let slots = self.max_outstanding.saturating_sub(view.outstanding.len());
            if slots == 0 {
                return Vec::new();
            }

            let mut order: Vec<usize> = view
                .bitfield
                .iter_set()
                .filter(|&i| self.pieces[i].status != PieceStatus::Verified)
                .collect();
            order.sort_by_key(|&i| (self.availability[i], i));
            (slots, order)
        };

        let endgame = self.in_endgame();
        let mut picked = Vec::with_capacity(slots);

        'pieces: for index in order {
            let block_count = self.pieces[index].blocks.len();
            for slot in 0..block_count {
                if picked.len() == slots {
                    break 'pieces;
                }
                let block = self.block_info(index as u32, slot);
                let requestable = match self.pieces[index].blocks[slot] {
                    BlockState::Missing => true,
                    BlockState::Requested => endgame && !self.holds(peer, &block),
                    BlockState::Received => false,
                };
                if requestable {
                    picked.push(block);
                    self.record_request(peer, block, now);
                }
            }
        }

        if !picked.is_empty() {
            trace!("Scheduled {} requests for {} (endgame: {})", picked.len(), peer, endgame);
        }
        picked
    }

    /// Hand a received block to the scheduler. The first copy wins.
    pub fn block_received(&mut self, peer: PeerKey, block: BlockInfo) -> BlockOutcome {
        let Some(slot) = self.slot_of(&block) else {
            debug!("Block {:?} from {} does not match the piece layout", block, peer);
            return BlockOutcome::Duplicate;
        };
        let index = block.index as usize;

        let holders = self.in_flight.remove(&block).unwrap_or_default();
        for holder in &holders {
            if let Some(view) = self.peers.get_mut(&holder.peer) {
                view.outstanding.remove(&block);
            }
        }

        let piece = &mut self.pieces[index];
        if piece.status == PieceStatus::Verified || piece.blocks[slot] == BlockState::Received {
            trace!("Discarding duplicate block {:?} from {}", block, peer);
            return BlockOutcome::Duplicate;
        }
        if !holders.iter().any(|h| h.peer == peer) {
            trace!("Discarding unrequested block {:?} from {}", block, peer);
            if !holders.is_empty() {
                // put the other peers' requests back
                self.in_flight.insert(block, holders.clone());
                for holder in &holders {
                    if let Some(view) = self.peers.get_mut(&holder.peer) {
                        view.outstanding.insert(block);
                    }
                }
            }
            return BlockOutcome::Duplicate;
        }

        piece.blocks[slot] = BlockState::Received;
        let piece_complete = piece.is_assembled();
        let cancels: Vec<_> = holders
            .iter()
            .filter(|h| h.peer != peer)
            .map(|h| (h.peer, block))
            .collect();
        if !cancels.is_empty() {
            debug!("Block {:?} won by {}, cancelling {} duplicates", block, peer, cancels.len());
        }

        BlockOutcome::Accepted { cancels, piece_complete }
    }

    /// A connection refused to send a request; make the block eligible again
    pub fn request_dropped(&mut self, peer: PeerKey, block: BlockInfo) {
        self.release_request(peer, block);
    }

    /// Remove requests older than the request timeout and make their
    /// blocks eligible again. Returns the expired requests so the caller
    /// can cancel them at their peers.
    pub fn expire_requests(&mut self, now: Instant) -> Vec<(PeerKey, BlockInfo)> {
        let timeout = self.request_timeout;
        let expired: Vec<(PeerKey, BlockInfo)> = self
            .in_flight
            .iter()
            .flat_map(|(block, holders)| {
                holders
                    .iter()
                    .filter(move |h| now.saturating_duration_since(h.requested_at) >= timeout)
                    .map(move |h| (h.peer, *block))
            })
            .collect();

        for (peer, block) in &expired {
            self.release_request(*peer, *block);
        }
        if !expired.is_empty() {
            debug!("{} requests timed out and were requeued", expired.len());
        }
        expired
    }

    /// Mark a piece verified. Used both after hashing and for pieces
    /// found intact on disk at startup.
    pub fn piece_verified(&mut self, index: u32) {
        let Some(piece) = self.pieces.get_mut(index as usize) else { return };
        if piece.status == PieceStatus::Verified {
            return;
        }
        piece.status = PieceStatus::Verified;
        piece.blocks.iter_mut().for_each(|b| *b = BlockState::Received);
        self.verified += 1;

        let stale: Vec<BlockInfo> = self.in_flight.keys().filter(|b| b.index == index).copied().collect();
        for block in stale {
            if let Some(holders) = self.in_flight.remove(&block) {
                for holder in holders {
                    if let Some(view) = self.peers.get_mut(&holder.peer) {
                        view.outstanding.remove(&block);
                    }
                }
            }
        }

        if self.is_complete() {
            info!("All {} pieces verified", self.pieces.len());
        }
    }

    /// Discard a piece that failed its hash check so it is downloaded again
    pub fn piece_failed(&mut self, index: u32) {
        let Some(piece) = self.pieces.get_mut(index as usize) else { return };
        if piece.status == PieceStatus::Verified {
            return;
        }
        piece.status = PieceStatus::Missing;
        piece.blocks.iter_mut().for_each(|b| *b = BlockState::Missing);
        debug!("Piece {} reset after failed verification", index);
    }

    /// Drop every outstanding request, returning them for cancellation
    pub fn cancel_all(&mut self) -> Vec<(PeerKey, BlockInfo)> {
        let all: Vec<(PeerKey, BlockInfo)> = self
            .in_flight
            .iter()
            .flat_map(|(block, holders)| holders.iter().map(move |h| (h.peer, *block)))
            .collect();
        for (peer, block) in &all {
            self.release_request(*peer, *block);
        }
        all
    }

    fn block_info(&self, index: u32, slot: usize) -> BlockInfo {
        let begin = slot as u32 * self.block_size;
        let length = self.piece_lengths[index as usize].saturating_sub(begin).min(self.block_size);
        BlockInfo { index, begin, length }
    }

    /// Block slot for a request, if it matches the piece layout exactly
    fn slot_of(&self, block: &BlockInfo) -> Option<usize> {
        let piece = self.pieces.get(block.index as usize)?;
        if block.begin % self.block_size != 0 {
            return None;
        }
        let slot = (block.begin / self.block_size) as usize;
        if slot >= piece.blocks.len() || self.block_info(block.index, slot) != *block {
            return None;
        }
        Some(slot)
    }

    fn holds(&self, peer: PeerKey, block: &BlockInfo) -> bool {
        self.peers.get(&peer).is_some_and(|v| v.outstanding.contains(block))
    }

    fn record_request(&mut self, peer: PeerKey, block: BlockInfo, now: Instant) {
        let index = block.index as usize;
        let slot = (block.begin / self.block_size) as usize;
        let piece = &mut self.pieces[index];
        piece.blocks[slot] = BlockState::Requested;
        if piece.status == PieceStatus::Missing {
            piece.status = PieceStatus::InProgress;
        }
        self.in_flight.entry(block).or_default().push(InFlight { peer, requested_at: now });
        if let Some(view) = self.peers.get_mut(&peer) {
            view.outstanding.insert(block);
        }
    }

    fn release_request(&mut self, peer: PeerKey, block: BlockInfo) {
        if let Some(view) = self.peers.get_mut(&peer) {
            view.outstanding.remove(&block);
        }
        let Some(holders) = self.in_flight.get_mut(&block) else { return };
        holders.retain(|h| h.peer != peer);
        if holders.is_empty() {
            self.in_flight.remove(&block);
            if let Some(slot) = self.slot_of(&block) {
                let state = &mut self.pieces[block.index as usize].blocks[slot];
                if *state == BlockState::Requested {
                    *state = BlockState::Missing;
                }
            }
        }
    }

    fn release_peer_requests(&mut self, peer: PeerKey) -> usize {
        let blocks: Vec<BlockInfo> = match self.peers.get(&peer) {
            Some(view) => view.outstanding.iter().copied().collect(),
            None => return 0,
        };
        for block in &blocks {
            self.release_request(peer, *block);
        }
        blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentFile;

    fn info(piece_count: usize, piece_length: u64, total: u64) -> TorrentInfo {
        TorrentInfo {
            info_hash: [0u8; 20],
            name: "sim".into(),
            piece_length,
            pieces: vec![[0u8; 20]; piece_count],
            files: vec![TorrentFile { path: vec!["sim".into()], length: total, offset: 0 }],
            total_length: total,
            trackers: vec![],
            multi_file: false,
        }
    }

    fn config(block_size: u32, endgame: usize) -> EngineConfig {
        EngineConfig {
            block_size,
            endgame_threshold: endgame,
            max_outstanding_requests: 5,
            ..EngineConfig::default()
        }
    }

    fn peer(n: u8) -> PeerKey {
        SocketAddr::from(([10, 0, 0, n], 6881))
    }

    fn ready_peer(s: &mut PieceScheduler, key: PeerKey, field: Bitfield) {
        s.peer_joined(key);
        s.peer_bitfield(key, &field);
        s.peer_unchoked(key);
    }

    #[test]
    fn test_rarest_first_then_lowest_index() {
        let mut s = PieceScheduler::new(&info(3, 4, 12), &config(4, 0));
        ready_peer(&mut s, peer(1), Bitfield::full(3));
        let mut partial = Bitfield::new(3);
        partial.set(0);
        partial.set(1);
        ready_peer(&mut s, peer(2), partial);

        assert_eq!(s.availability(2), 1);
        let requests = s.next_requests(peer(1), Instant::now());
        assert_eq!(requests.iter().map(|b| b.index).collect::<Vec<_>>(), vec![2, 0, 1]);
    }

    #[test]
    fn test_lowest_offset_and_cap() {
        let mut s = PieceScheduler::new(&info(1, 40, 40), &config(4, 0));
        ready_peer(&mut s, peer(1), Bitfield::full(1));

        let requests = s.next_requests(peer(1), Instant::now());
        assert_eq!(requests.len(), 5);
        assert_eq!(requests.iter().map(|b| b.begin).collect::<Vec<_>>(), vec![0, 4, 8, 12, 16]);
        assert!(s.next_requests(peer(1), Instant::now()).is_empty());
        assert_eq!(s.status(0), Some(PieceStatus::InProgress));
    }

    #[test]
    fn test_last_block_is_short() {
        let mut s = PieceScheduler::new(&info(2, 10, 15), &config(4, 0));
        ready_peer(&mut s, peer(1), Bitfield::full(2));
        let requests = s.next_requests(peer(1), Instant::now());
        let last = requests.iter().find(|b| b.index == 1 && b.begin == 4).unwrap();
        assert_eq!(last.length, 1);
    }

    #[test]
    fn test_choked_peer_gets_nothing_and_choke_requeues() {
        let mut s = PieceScheduler::new(&info(1, 8, 8), &config(4, 0));
        s.peer_joined(peer(1));
        s.peer_bitfield(peer(1), &Bitfield::full(1));
        assert!(s.next_requests(peer(1), Instant::now()).is_empty());

        s.peer_unchoked(peer(1));
        assert_eq!(s.next_requests(peer(1), Instant::now()).len(), 2);
        s.peer_choked(peer(1));
        assert_eq!(s.in_flight_count(), 0);

        s.peer_unchoked(peer(1));
        assert_eq!(s.next_requests(peer(1), Instant::now()).len(), 2);
    }

    #[test]
    fn test_peer_left_requeues_to_other_peer() {
        let mut s = PieceScheduler::new(&info(1, 8, 8), &config(4, 0));
        ready_peer(&mut s, peer(1), Bitfield::full(1));
        ready_peer(&mut s, peer(2), Bitfield::full(1));

        assert_eq!(s.next_requests(peer(1), Instant::now()).len(), 2);
        assert!(s.next_requests(peer(2), Instant::now()).is_empty());

        s.peer_left(peer(1));
        assert_eq!(s.availability(0), 1);
        assert_eq!(s.next_requests(peer(2), Instant::now()).len(), 2);
    }

    #[test]
    fn test_timeout_requeues() {
        let mut s = PieceScheduler::new(&info(1, 4, 4), &config(4, 0));
        ready_peer(&mut s, peer(1), Bitfield::full(1));
        let start = Instant::now();
        let block = s.next_requests(peer(1), start)[0];

        assert!(s.expire_requests(start + Duration::from_secs(1)).is_empty());
        let expired = s.expire_requests(start + Duration::from_secs(31));
        assert_eq!(expired, vec![(peer(1), block)]);
        assert_eq!(s.outstanding(&peer(1)), 0);
        assert_eq!(s.next_requests(peer(1), start), vec![block]);
    }

    #[test]
    fn test_endgame_duplicates_and_first_copy_wins() {
        let mut s = PieceScheduler::new(&info(1, 4, 4), &config(4, 5));
        ready_peer(&mut s, peer(1), Bitfield::full(1));
        ready_peer(&mut s, peer(2), Bitfield::full(1));
        assert!(s.in_endgame());

        let a = s.next_requests(peer(1), Instant::now());
        let b = s.next_requests(peer(2), Instant::now());
        assert_eq!(a, b);
        assert!(s.next_requests(peer(2), Instant::now()).is_empty());

        let block = a[0];
        assert_eq!(
            s.block_received(peer(1), block),
            BlockOutcome::Accepted { cancels: vec![(peer(2), block)], piece_complete: true }
        );
        assert_eq!(s.block_received(peer(2), block), BlockOutcome::Duplicate);
        assert_eq!(s.in_flight_count(), 0);
    }

    #[test]
    fn test_no_duplicates_outside_endgame() {
        let mut s = PieceScheduler::new(&info(10, 4, 40), &config(4, 2));
        ready_peer(&mut s, peer(1), Bitfield::full(10));
        ready_peer(&mut s, peer(2), Bitfield::full(10));
        let a = s.next_requests(peer(1), Instant::now());
        let b = s.next_requests(peer(2), Instant::now());
        assert!(a.iter().all(|x| !b.contains(x)));
    }

    #[test]
    fn test_hash_failure_resets_piece() {
        let mut s = PieceScheduler::new(&info(1, 4, 4), &config(4, 0));
        ready_peer(&mut s, peer(1), Bitfield::full(1));
        let block = s.next_requests(peer(1), Instant::now())[0];
        assert!(matches!(s.block_received(peer(1), block), BlockOutcome::Accepted { piece_complete: true, .. }));

        s.piece_failed(0);
        assert_eq!(s.status(0), Some(PieceStatus::Missing));
        assert_eq!(s.next_requests(peer(1), Instant::now()), vec![block]);
    }

    #[test]
    fn test_unrequested_block_discarded() {
        let mut s = PieceScheduler::new(&info(1, 4, 4), &config(4, 0));
        ready_peer(&mut s, peer(1), Bitfield::full(1));
        let block = BlockInfo { index: 0, begin: 0, length: 4 };
        assert_eq!(s.block_received(peer(1), block), BlockOutcome::Duplicate);
        let misaligned = BlockInfo { index: 0, begin: 1, length: 3 };
        assert_eq!(s.block_received(peer(1), misaligned), BlockOutcome::Duplicate);
    }

    /// Deterministic swarm: one honest seeder, one flaky peer that drops
    /// out mid-way. Every piece must verify and no verified piece may be
    /// requested again.
    #[test]
    fn test_simulation_terminates_with_honest_peer() {
        let pieces = 12;
        let mut s = PieceScheduler::new(&info(pieces, 8, 8 * pieces as u64 - 3), &config(4, 3));
        let honest = peer(1);
        let flaky = peer(2);
        ready_peer(&mut s, honest, Bitfield::full(pieces));
        ready_peer(&mut s, flaky, Bitfield::full(pieces));

        let mut now = Instant::now();
        let mut verified_seen = HashSet::new();
        let mut flaky_alive = true;

        for round in 0..1_000 {
            if s.is_complete() {
                break;
            }
            now += Duration::from_millis(100);

            for key in [honest, flaky] {
                if key == flaky && !flaky_alive {
                    continue;
                }
                let requests = s.next_requests(key, now);
                for block in requests {
                    assert!(!verified_seen.contains(&block.index), "verified piece {} re-requested", block.index);
                    if key == flaky {
                        continue;
                    }
                    if let BlockOutcome::Accepted { piece_complete: true, .. } = s.block_received(key, block) {
                        s.piece_verified(block.index);
                        verified_seen.insert(block.index);
                    }
                }
            }

            if round == 3 {
                s.peer_left(flaky);
                flaky_alive = false;
            }
        }

        assert!(s.is_complete());
        assert_eq!(s.verified_count(), pieces);
        assert_eq!(s.in_flight_count(), 0);
    }
}
