//! Engine
//!
//! Owns every active session in the process, keyed by info-hash. There
//! is no global instance; tests create as many engines as they need.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{AddOptions, EngineConfig};
use crate::error::TorrentError;
use crate::session::{self, SessionHandle, SessionState};
use crate::torrent::{MetadataResolver, TorrentSource};

/// Process-wide set of torrent sessions
#[derive(Debug)]
pub struct Engine {
    config: Arc<EngineConfig>,
    resolver: MetadataResolver,
    sessions: RwLock<HashMap<[u8; 20], SessionHandle>>,
}

impl Engine {
    /// Create an engine after validating `config`
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_resolver(config, MetadataResolver::new())
    }

    /// Create an engine that resolves metadata with `resolver`
    pub fn with_resolver(config: EngineConfig, resolver: MetadataResolver) -> Result<Self> {
        config.validate()?;
        info!("Engine started with peer id {}", hex::encode(config.peer_id));
        Ok(Self {
            config: Arc::new(config),
            resolver,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start downloading a torrent. Descriptor sources are parsed before
    /// this returns; magnet metadata is resolved by the session itself.
    pub async fn add(&self, source: TorrentSource, options: AddOptions) -> Result<SessionHandle> {
        let resolution = self.resolver.load(source).await?;
        let info_hash = resolution.info_hash();

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&info_hash) {
            if !matches!(existing.progress().state, SessionState::Failed | SessionState::Stopped) {
                warn!("Torrent {} is already active", hex::encode(info_hash));
                return Err(TorrentError::duplicate_torrent(&info_hash).into());
            }
            if let Some(finished) = sessions.remove(&info_hash) {
                debug!("Replacing ended session for {}", hex::encode(info_hash));
                finished.stop().await;
            }
        }

        debug!("Adding torrent {} into {}", hex::encode(info_hash), options.output_directory.display());
        let handle = session::spawn(resolution, options, Arc::clone(&self.config), self.resolver.clone());
        sessions.insert(info_hash, handle.clone());
        info!("Added torrent {} ({} active)", hex::encode(info_hash), sessions.len());
        Ok(handle)
    }

    /// Classify a textual source (magnet URI, URL or path) and add it
    pub async fn add_input(&self, input: &str, options: AddOptions) -> Result<SessionHandle> {
        let source = TorrentSource::parse(input)?;
        self.add(source, options).await
    }

    /// Handle to an active session
    pub async fn get(&self, info_hash: &[u8; 20]) -> Option<SessionHandle> {
        self.sessions.read().await.get(info_hash).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Stop a session and forget it. Returns false if it was not active.
    pub async fn remove(&self, info_hash: &[u8; 20]) -> bool {
        let Some(handle) = self.sessions.write().await.remove(info_hash) else {
            return false;
        };
        handle.stop().await;
        info!("Removed torrent {}", hex::encode(info_hash));
        true
    }

    /// Stop every session. Resolves once each has finished its teardown.
    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = self.sessions.write().await.drain().map(|(_, handle)| handle).collect();
        if handles.is_empty() {
            return;
        }
        info!("Shutting down {} sessions", handles.len());

        let mut stopping = JoinSet::new();
        for handle in handles {
            stopping.spawn(async move {
                handle.stop().await;
                handle.info_hash()
            });
        }
        while let Some(stopped) = stopping.join_next().await {
            match stopped {
                Ok(info_hash) => debug!("Session {} shut down", hex::encode(info_hash)),
                Err(e) => warn!("Session shutdown task failed: {}", e),
            }
        }
        info!("All sessions shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;
    use crate::session::SessionEvent;
    use crate::testing::{build_torrent, wait_until, FakeSeeder, Fixture};

    const PIECE: u64 = 32 * 1024;

    fn config() -> EngineConfig {
        EngineConfig {
            progress_interval: Duration::from_millis(50),
            ..EngineConfig::default()
        }
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// Collect events until `Done`, failing on an `Error` or a timeout
    async fn run_to_done(handle: &mut SessionHandle) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(20), async {
            while let Some(event) = handle.next_event().await {
                match event {
                    SessionEvent::Done => return,
                    SessionEvent::Error(e) => panic!("session failed: {}", e),
                    SessionEvent::Progress { .. } => {}
                    other => seen.push(other),
                }
            }
            panic!("session ended without finishing");
        })
        .await
        .expect("download did not finish in time");
        seen
    }

    fn verified(events: &[SessionEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::PieceVerified(index) => Some(*index),
                _ => None,
            })
            .collect()
    }

    fn options(dir: &std::path::Path, seeder: &FakeSeeder) -> AddOptions {
        AddOptions::new(dir).with_peer(seeder.addr()).with_trackers(false)
    }

    fn three_pieces() -> Fixture {
        build_torrent("three.bin", &content(3 * PIECE as usize - 100), PIECE)
    }

    #[tokio::test]
    async fn test_three_pieces_from_one_peer() {
        let fixture = three_pieces();
        let seeder = FakeSeeder::start(&fixture).await;
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(config()).unwrap();

        let mut handle = engine
            .add(TorrentSource::Bytes(fixture.bytes.clone()), options(dir.path(), &seeder))
            .await
            .unwrap();
        let events = run_to_done(&mut handle).await;

        let mut pieces = verified(&events);
        assert_eq!(pieces.len(), 3);
        pieces.sort();
        assert_eq!(pieces, vec![0, 1, 2]);
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::HashMismatch(_))));

        let written = std::fs::read(dir.path().join("three.bin")).unwrap();
        assert_eq!(written, fixture.content);

        let progress = handle.progress();
        assert_eq!(progress.state, SessionState::Done);
        assert_eq!(progress.bytes_downloaded, fixture.content.len() as u64);
        assert_eq!(progress.verified_pieces, 3);
        engine.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_resume_skips_pieces_on_disk() {
        let fixture = three_pieces();
        let dir = tempfile::tempdir().unwrap();
        let mut partial = fixture.content.clone();
        let last = partial.len() - 1;
        partial[last] ^= 0xff;
        std::fs::write(dir.path().join("three.bin"), &partial).unwrap();

        let seeder = FakeSeeder::start(&fixture).await;
        let engine = Engine::new(config()).unwrap();
        let mut handle = engine
            .add(TorrentSource::Bytes(fixture.bytes.clone()), options(dir.path(), &seeder))
            .await
            .unwrap();
        let events = run_to_done(&mut handle).await;

        assert_eq!(verified(&events), vec![2]);
        // the last piece is two blocks; nothing else was fetched
        assert_eq!(seeder.requests_received(), 2);
        assert_eq!(std::fs::read(dir.path().join("three.bin")).unwrap(), fixture.content);
        engine.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_complete_data_needs_no_peers() {
        let fixture = three_pieces();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("three.bin"), &fixture.content).unwrap();

        let engine = Engine::new(config()).unwrap();
        let handle = engine
            .add(TorrentSource::Bytes(fixture.bytes.clone()), AddOptions::new(dir.path()).with_trackers(false))
            .await
            .unwrap();

        let mut progress = handle.watch_progress();
        let done = tokio::time::timeout(Duration::from_secs(5), progress.wait_for(|p| p.state == SessionState::Done))
            .await
            .is_ok_and(|changed| changed.is_ok());
        assert!(done);
        assert_eq!(handle.progress().verified_pieces, 3);
        engine.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_corrupt_piece_is_fetched_again() {
        let fixture = three_pieces();
        let seeder = FakeSeeder::with_corruption(&fixture, &[1]).await;
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(config()).unwrap();

        let mut handle = engine
            .add(TorrentSource::Bytes(fixture.bytes.clone()), options(dir.path(), &seeder))
            .await
            .unwrap();
        let events = run_to_done(&mut handle).await;

        assert!(events.iter().any(|e| matches!(e, SessionEvent::HashMismatch(1))));
        let mut pieces = verified(&events);
        pieces.sort();
        assert_eq!(pieces, vec![0, 1, 2]);
        assert_eq!(std::fs::read(dir.path().join("three.bin")).unwrap(), fixture.content);
        engine.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_endgame_cancels_duplicate_at_second_peer() {
        let fixture = three_pieces();
        let fast = FakeSeeder::with_delay(&fixture, Duration::from_millis(25)).await;
        let stalled = FakeSeeder::stalled(&fixture).await;
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(config()).unwrap();

        let options = options(dir.path(), &fast).with_peer(stalled.addr());
        let mut handle = engine.add(TorrentSource::Bytes(fixture.bytes.clone()), options).await.unwrap();
        let events = run_to_done(&mut handle).await;

        // every piece verified and written exactly once
        let mut pieces = verified(&events);
        pieces.sort();
        assert_eq!(pieces, vec![0, 1, 2]);
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::HashMismatch(_))));
        assert_eq!(std::fs::read(dir.path().join("three.bin")).unwrap(), fixture.content);

        // the unanswered copies at the second peer were all withdrawn
        assert!(stalled.requests_received() > 0);
        assert!(
            wait_until(Duration::from_secs(5), || stalled.cancelled_requests() == stalled.requests_received()).await
        );
        engine.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_duplicate_torrent_rejected() {
        let fixture = three_pieces();
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(config()).unwrap();
        let options = AddOptions::new(dir.path()).with_peer("127.0.0.1:9".parse().unwrap()).with_trackers(false);

        engine.add(TorrentSource::Bytes(fixture.bytes.clone()), options.clone()).await.unwrap();
        let err = engine.add(TorrentSource::Bytes(fixture.bytes.clone()), options).await.unwrap_err();
        assert_eq!(err.downcast_ref::<TorrentError>().unwrap().kind(), ErrorKind::DuplicateTorrent);
        assert_eq!(engine.session_count().await, 1);

        assert!(engine.remove(&fixture.info_hash).await);
        assert!(!engine.remove(&fixture.info_hash).await);
        assert!(engine.get(&fixture.info_hash).await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_source_rejected() {
        let engine = Engine::new(config()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = engine
            .add(TorrentSource::Bytes(b"not a torrent".to_vec()), AddOptions::new(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<TorrentError>().unwrap().kind(), ErrorKind::InvalidDescriptor);

        let err = engine.add_input("ftp://example.com/x.torrent", AddOptions::new(dir.path())).await.unwrap_err();
        assert_eq!(err.downcast_ref::<TorrentError>().unwrap().kind(), ErrorKind::InvalidSource);
        assert_eq!(engine.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_unresolvable_magnet_reports_error() {
        let engine = Engine::new(config()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut handle = engine
            .add_input("magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c", AddOptions::new(dir.path()))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), handle.next_event()).await.unwrap();
        match event {
            Some(SessionEvent::Error(e)) => assert_eq!(e.kind(), ErrorKind::UnresolvedMetadata),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(handle.progress().state, SessionState::Failed);
        engine.shutdown_all().await;
        assert_eq!(handle.progress().state, SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_torrent_can_be_added_again() {
        let magnet = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c";
        let engine = Engine::new(config()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut first = engine.add_input(magnet, AddOptions::new(dir.path())).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), first.next_event()).await.unwrap();
        assert!(matches!(event, Some(SessionEvent::Error(_))));
        assert_eq!(first.progress().state, SessionState::Failed);

        let mut second = engine.add_input(magnet, AddOptions::new(dir.path())).await.unwrap();
        assert_eq!(engine.session_count().await, 1);
        assert_eq!(first.progress().state, SessionState::Stopped);

        let event = tokio::time::timeout(Duration::from_secs(5), second.next_event()).await.unwrap();
        match event {
            Some(SessionEvent::Error(e)) => assert_eq!(e.kind(), ErrorKind::UnresolvedMetadata),
            other => panic!("unexpected event {:?}", other),
        }
        engine.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_no_peer_source_reports_error() {
        let fixture = three_pieces();
        let engine = Engine::new(config()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut handle = engine
            .add(TorrentSource::Bytes(fixture.bytes.clone()), AddOptions::new(dir.path()).with_trackers(false))
            .await
            .unwrap();

        let error = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match handle.next_event().await {
                    Some(SessionEvent::Error(e)) => return e,
                    Some(_) => continue,
                    None => panic!("session ended without an error"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(error.kind(), ErrorKind::NoPeerSourceAvailable);
        engine.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_shutdown_all_releases_everything() {
        let fixture = build_torrent("big.bin", &content(64 * PIECE as usize), PIECE);
        let seeder = FakeSeeder::start(&fixture).await;
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(config()).unwrap();

        let mut handle = engine
            .add(TorrentSource::Bytes(fixture.bytes.clone()), options(dir.path(), &seeder))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = handle.next_event().await {
                if matches!(event, SessionEvent::PieceVerified(_) | SessionEvent::Done) {
                    return;
                }
            }
        })
        .await
        .unwrap();

        engine.shutdown_all().await;

        assert_eq!(engine.session_count().await, 0);
        assert_eq!(handle.open_file_handles(), 0);
        assert_eq!(handle.progress().state, SessionState::Stopped);
        assert!(handle.peers().await.is_empty());
        assert!(wait_until(Duration::from_secs(5), || seeder.open_connections() == 0).await);
    }
}
