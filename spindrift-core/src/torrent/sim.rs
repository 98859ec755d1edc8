//! Deterministic in-process swarm engine for tests and demos.
//!
//! Writes real bytes to disk at a configured rate so the coordinator,
//! readiness predicate and packager can be exercised end-to-end without a
//! network or a live swarm. Peer counts and stalls are scriptable.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::engine::{SwarmEngine, SwarmSession, SwarmStats, TorrentFileInfo};
use super::magnet::MagnetLink;
use crate::torrent::TorrentError;

/// Leading bytes of a minimal MP4 container, enough for signature sniffing.
pub const MP4_HEADER: &[u8] = &[
    0x00, 0x00, 0x00, 0x20, b'f', b't', b'y', b'p', b'i', b's', b'o', b'm', 0x00, 0x00, 0x02,
    0x00, b'i', b's', b'o', b'm', b'i', b's', b'o', b'2', b'a', b'v', b'c', b'1', b'm', b'p',
    b'4', b'1',
];

/// Script describing the torrent a [`SimSwarmEngine`] pretends to serve.
#[derive(Debug, Clone)]
pub struct SimTorrentSpec {
    /// Files the torrent announces
    pub files: Vec<TorrentFileInfo>,
    /// Steady connected-peer count reported while alive
    pub peers: u32,
    /// Bytes appended to the selected file per tick
    pub bytes_per_tick: u64,
    /// Writer tick interval
    pub tick: Duration,
    /// When set, no bytes are ever written (dead-swarm scenario)
    pub stalled: bool,
    /// Bytes written before the payload pattern, e.g. [`MP4_HEADER`]
    pub header: Vec<u8>,
}

impl SimTorrentSpec {
    /// A single-video torrent delivering `size` bytes briskly.
    pub fn single_video(name: &str, size: u64) -> Self {
        Self {
            files: vec![TorrentFileInfo {
                index: 0,
                path: PathBuf::from(name),
                size,
            }],
            peers: 8,
            bytes_per_tick: 16 * 1024,
            tick: Duration::from_millis(10),
            stalled: false,
            header: MP4_HEADER.to_vec(),
        }
    }

    /// Marks the swarm dead: zero peers and no bytes ever arrive.
    pub fn dead(mut self) -> Self {
        self.peers = 0;
        self.stalled = true;
        self
    }
}

/// Scriptable in-process engine.
pub struct SimSwarmEngine {
    spec: SimTorrentSpec,
    /// Best-effort re-announce invocations across all sessions
    pub announces: Arc<AtomicU32>,
    /// DHT bootstrap nodes injected across all sessions
    pub injected_nodes: Arc<AtomicU32>,
    /// Explicit peers injected across all sessions
    pub injected_peers: Arc<AtomicU32>,
}

impl SimSwarmEngine {
    /// Creates an engine that serves `spec` for every magnet.
    pub fn new(spec: SimTorrentSpec) -> Self {
        Self {
            spec,
            announces: Arc::new(AtomicU32::new(0)),
            injected_nodes: Arc::new(AtomicU32::new(0)),
            injected_peers: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl SwarmEngine for SimSwarmEngine {
    async fn start(
        &self,
        magnet: &MagnetLink,
        download_dir: &Path,
    ) -> Result<Box<dyn SwarmSession>, TorrentError> {
        debug!("Sim engine starting for {}", magnet.info_hash);
        Ok(Box::new(SimSession {
            spec: self.spec.clone(),
            download_dir: download_dir.to_path_buf(),
            written: Arc::new(AtomicU64::new(0)),
            paused: Arc::new(AtomicBool::new(false)),
            destroyed: Arc::new(AtomicBool::new(false)),
            writer: Mutex::new(None),
            announces: Arc::clone(&self.announces),
            injected_nodes: Arc::clone(&self.injected_nodes),
            injected_peers: Arc::clone(&self.injected_peers),
        }))
    }
}

struct SimSession {
    spec: SimTorrentSpec,
    download_dir: PathBuf,
    written: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
    destroyed: Arc<AtomicBool>,
    writer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    announces: Arc<AtomicU32>,
    injected_nodes: Arc<AtomicU32>,
    injected_peers: Arc<AtomicU32>,
}

#[async_trait]
impl SwarmSession for SimSession {
    fn files(&self) -> &[TorrentFileInfo] {
        &self.spec.files
    }

    async fn select_file(&self, index: usize) -> Result<(), TorrentError> {
        let file = self
            .spec
            .files
            .get(index)
            .ok_or_else(|| TorrentError::EngineFailure {
                reason: format!("no file at index {index}"),
            })?
            .clone();

        if self.spec.stalled {
            return Ok(());
        }

        let target = self.download_dir.join(&file.path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let written = Arc::clone(&self.written);
        let paused = Arc::clone(&self.paused);
        let destroyed = Arc::clone(&self.destroyed);
        let spec = self.spec.clone();

        let handle = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;

            let mut out = match tokio::fs::File::create(&target).await {
                Ok(f) => f,
                Err(_) => return,
            };
            if out.write_all(&spec.header).await.is_err() {
                return;
            }
            written.store(spec.header.len() as u64, Ordering::SeqCst);

            let chunk = vec![0xabu8; spec.bytes_per_tick as usize];
            loop {
                tokio::time::sleep(spec.tick).await;
                if destroyed.load(Ordering::SeqCst) {
                    return;
                }
                if paused.load(Ordering::SeqCst) {
                    continue;
                }

                let done = written.load(Ordering::SeqCst);
                if done >= file.size {
                    return;
                }
                let take = spec.bytes_per_tick.min(file.size - done) as usize;
                if out.write_all(&chunk[..take]).await.is_err() {
                    return;
                }
                let _ = out.flush().await;
                written.fetch_add(take as u64, Ordering::SeqCst);
            }
        });

        *self.writer.lock().await = Some(handle);
        Ok(())
    }

    async fn deselect_file(&self, _index: usize) -> Result<bool, TorrentError> {
        Ok(true)
    }

    async fn set_file_priority(&self, _index: usize) -> bool {
        true
    }

    async fn stats(&self) -> SwarmStats {
        let destroyed = self.destroyed.load(Ordering::SeqCst);
        let written = self.written.load(Ordering::SeqCst);
        let total: u64 = self.spec.files.iter().map(|f| f.size).sum();
        let stalled = self.spec.stalled || self.paused.load(Ordering::SeqCst);

        SwarmStats {
            downloaded_bytes: written,
            total_bytes: total,
            peers: if destroyed { 0 } else { self.spec.peers },
            download_speed: if stalled || destroyed {
                0.0
            } else {
                self.spec.bytes_per_tick as f64 / self.spec.tick.as_secs_f64()
            },
            upload_speed: 0.0,
            finished: written >= total && total > 0,
        }
    }

    async fn file_bytes(&self, index: usize) -> Option<u64> {
        let file = self.spec.files.get(index)?;
        Some(self.written.load(Ordering::SeqCst).min(file.size))
    }

    async fn pause(&self) -> Result<(), TorrentError> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), TorrentError> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn reannounce(&self) -> bool {
        self.announces.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn add_peer(&self, _addr: SocketAddr) -> bool {
        self.injected_peers.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn add_dht_node(&self, _node: &str) -> bool {
        self.injected_nodes.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn destroy(&self) -> Result<(), TorrentError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.writer.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn magnet() -> MagnetLink {
        MagnetLink::parse("magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567")
            .unwrap()
    }

    #[tokio::test]
    async fn test_sim_engine_writes_selected_file() {
        let temp = tempdir().unwrap();
        let spec = SimTorrentSpec::single_video("movie.mp4", 64 * 1024);
        let engine = SimSwarmEngine::new(spec);

        let session = engine.start(&magnet(), temp.path()).await.unwrap();
        session.select_file(0).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        let written = std::fs::read(temp.path().join("movie.mp4")).unwrap();
        assert!(written.starts_with(MP4_HEADER));
        assert!(written.len() > MP4_HEADER.len());

        session.destroy().await.unwrap();
        assert_eq!(session.stats().await.peers, 0);
    }

    #[tokio::test]
    async fn test_dead_swarm_never_delivers() {
        let temp = tempdir().unwrap();
        let spec = SimTorrentSpec::single_video("movie.mp4", 64 * 1024).dead();
        let engine = SimSwarmEngine::new(spec);

        let session = engine.start(&magnet(), temp.path()).await.unwrap();
        session.select_file(0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = session.stats().await;
        assert_eq!(stats.peers, 0);
        assert_eq!(stats.downloaded_bytes, 0);
        assert!(!temp.path().join("movie.mp4").exists());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let temp = tempdir().unwrap();
        let engine = SimSwarmEngine::new(SimTorrentSpec::single_video("a.mp4", 1024));
        let session = engine.start(&magnet(), temp.path()).await.unwrap();

        session.destroy().await.unwrap();
        session.destroy().await.unwrap();
    }
}
