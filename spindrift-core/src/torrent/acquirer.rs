//! Per-stream torrent acquisition and supervision.
//!
//! The acquirer owns one swarm session per stream: it applies the file
//! selection policy, keeps the registry's progress current, watches for
//! stalls, recovers peer discovery, and tears the session down. Cross-task
//! state lives in a single map keyed by stream ID; nothing here holds a
//! reference into another component.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::engine::{SwarmEngine, SwarmSession, SwarmStats};
use super::magnet::MagnetLink;
use super::selection::select_video_file;
use crate::config::TorrentConfig;
use crate::registry::{RegistryError, StreamRegistry, StreamStatus};
use crate::torrent::TorrentError;

/// The video file chosen for a stream.
#[derive(Debug, Clone)]
pub struct SelectedFile {
    /// Index in the torrent's file list
    pub index: usize,
    /// Path relative to the stream's download directory
    pub relative_path: PathBuf,
    /// Basename, kept for directory-scan fallbacks
    pub name: String,
    /// Announced length in bytes
    pub size: u64,
}

struct AcquirerEntry {
    swarm: Arc<dyn SwarmSession>,
    selected: SelectedFile,
    download_dir: PathBuf,
    watchdog: tokio::task::JoinHandle<()>,
    recovery: tokio::task::JoinHandle<()>,
}

/// Supervises all torrent sessions, keyed by stream ID.
pub struct TorrentAcquirer {
    engine: Arc<dyn SwarmEngine>,
    registry: Arc<StreamRegistry>,
    config: TorrentConfig,
    sessions: Arc<RwLock<HashMap<Uuid, AcquirerEntry>>>,
}

impl TorrentAcquirer {
    /// Creates an acquirer over `engine`, reporting into `registry`.
    pub fn new(
        engine: Arc<dyn SwarmEngine>,
        registry: Arc<StreamRegistry>,
        config: TorrentConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Begins acquisition for a stream whose registry entry already exists
    /// in `Initializing`. On success the engine is running, the target
    /// file is selected, every other file is deselected (best-effort),
    /// monitoring is active, and the registry shows `Downloading`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::NoMedia` - the torrent has no suitable video file
    /// - `TorrentError::EngineFailure` - the swarm engine failed
    /// - `TorrentError::MetadataTimeout` - metadata never arrived
    pub async fn start(
        &self,
        stream_id: Uuid,
        magnet: &MagnetLink,
        download_dir: &Path,
    ) -> Result<SelectedFile, TorrentError> {
        let swarm: Arc<dyn SwarmSession> =
            Arc::from(self.engine.start(magnet, download_dir).await?);

        let selected = match select_video_file(swarm.files()) {
            Ok(file) => SelectedFile {
                index: file.index,
                relative_path: file.path.clone(),
                name: file.file_name().to_string(),
                size: file.size,
            },
            Err(e) => {
                let _ = swarm.destroy().await;
                return Err(e);
            }
        };

        info!(
            "Stream {}: selected {} ({} bytes) from {} files",
            stream_id,
            selected.name,
            selected.size,
            swarm.files().len()
        );

        if let Err(e) = swarm.select_file(selected.index).await {
            let _ = swarm.destroy().await;
            return Err(e);
        }

        let mut deselect_unsupported = false;
        for file in swarm.files().to_vec() {
            if file.index == selected.index {
                continue;
            }
            match swarm.deselect_file(file.index).await {
                Ok(true) => {}
                Ok(false) => deselect_unsupported = true,
                Err(e) => warn!(
                    "Stream {}: failed to deselect file {}: {}",
                    stream_id, file.index, e
                ),
            }
        }
        if deselect_unsupported {
            debug!("Stream {}: engine does not support deselection", stream_id);
        }

        if !swarm.set_file_priority(selected.index).await {
            debug!(
                "Stream {}: engine does not support file priorities",
                stream_id
            );
        }

        self.registry
            .update_status(stream_id, StreamStatus::Downloading, None)
            .await
            .map_err(|e| TorrentError::EngineFailure {
                reason: format!("registry rejected downloading transition: {e}"),
            })?;

        let watchdog = self.spawn_watchdog(stream_id, Arc::clone(&swarm), &selected, download_dir);
        let recovery = self.spawn_peer_recovery(stream_id, Arc::clone(&swarm), magnet);

        self.sessions.write().await.insert(
            stream_id,
            AcquirerEntry {
                swarm,
                selected: selected.clone(),
                download_dir: download_dir.to_path_buf(),
                watchdog,
                recovery,
            },
        );

        Ok(selected)
    }

    /// Destroys a stream's torrent session. Idempotent: unknown streams
    /// are a no-op.
    pub async fn cleanup(&self, stream_id: Uuid) {
        let entry = self.sessions.write().await.remove(&stream_id);
        let Some(entry) = entry else {
            return;
        };

        entry.watchdog.abort();
        entry.recovery.abort();
        if let Err(e) = entry.swarm.destroy().await {
            warn!("Stream {}: engine teardown failed: {}", stream_id, e);
        }
        debug!("Stream {}: torrent session destroyed", stream_id);
    }

    /// Overall download percentage for a stream, when a session exists.
    pub async fn progress(&self, stream_id: Uuid) -> Option<f64> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(&stream_id)?;
        let stats = entry.swarm.stats().await;
        Some(overall_percent(&stats, entry))
    }

    /// Bytes of the selected file available for the packager: the best of
    /// the on-disk size and the engine's per-file accounting. The disk is
    /// authoritative; engine numbers fill in while the file is still being
    /// assembled.
    pub async fn effective_file_bytes(&self, stream_id: Uuid) -> u64 {
        let sessions = self.sessions.read().await;
        let Some(entry) = sessions.get(&stream_id) else {
            return 0;
        };

        let disk = disk_size(entry);
        let engine = entry
            .swarm
            .file_bytes(entry.selected.index)
            .await
            .unwrap_or(0);
        disk.max(engine)
    }

    /// Instantaneous swarm statistics, when a session exists.
    pub async fn swarm_stats(&self, stream_id: Uuid) -> Option<SwarmStats> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(&stream_id)?;
        Some(entry.swarm.stats().await)
    }

    /// The selected file for a stream, when a session exists.
    pub async fn selected_file(&self, stream_id: Uuid) -> Option<SelectedFile> {
        self.sessions
            .read()
            .await
            .get(&stream_id)
            .map(|e| e.selected.clone())
    }

    /// Spawns the stall watchdog: every tick it refreshes registry
    /// progress, counts ticks without byte growth, attempts a pause/resume
    /// recovery when peers are present, and declares the torrent dead
    /// after enough silent ticks with nobody connected.
    fn spawn_watchdog(
        &self,
        stream_id: Uuid,
        swarm: Arc<dyn SwarmSession>,
        selected: &SelectedFile,
        download_dir: &Path,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let sessions = Arc::clone(&self.sessions);
        let config = self.config.clone();
        let selected = selected.clone();
        let download_dir = download_dir.to_path_buf();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.watchdog_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_bytes = 0u64;
            let mut stall_ticks = 0u32;

            loop {
                ticker.tick().await;

                let stats = swarm.stats().await;
                let percent = file_percent(&stats, &selected, &download_dir);
                match registry.update_progress(stream_id, percent).await {
                    Ok(()) => {}
                    Err(RegistryError::StreamNotFound { .. }) => return,
                    Err(e) => debug!("Stream {}: progress update refused: {}", stream_id, e),
                }

                if stats.downloaded_bytes > last_bytes {
                    last_bytes = stats.downloaded_bytes;
                    stall_ticks = 0;
                    continue;
                }
                if stats.finished {
                    continue;
                }

                stall_ticks += 1;
                debug!(
                    "Stream {}: no download progress for {} ticks ({} peers)",
                    stream_id, stall_ticks, stats.peers
                );

                if stats.peers == 0 {
                    if stall_ticks >= config.stall_dead_ticks {
                        warn!("Stream {}: declaring torrent dead", stream_id);
                        let _ = registry
                            .update_status(
                                stream_id,
                                StreamStatus::Error,
                                Some("torrent appears to be dead (no peers found)".to_string()),
                            )
                            .await;

                        let entry = sessions.write().await.remove(&stream_id);
                        if let Some(entry) = entry {
                            entry.recovery.abort();
                            let _ = entry.swarm.destroy().await;
                        }
                        return;
                    }
                } else if stall_ticks >= config.stall_recovery_ticks {
                    info!(
                        "Stream {}: stalled with {} peers, attempting pause/resume",
                        stream_id, stats.peers
                    );
                    if let Err(e) = swarm.pause().await {
                        warn!("Stream {}: pause failed: {}", stream_id, e);
                    }
                    if let Err(e) = swarm.resume().await {
                        warn!("Stream {}: resume failed: {}", stream_id, e);
                    }
                    stall_ticks = 0;
                }
            }
        })
    }

    /// Spawns peer discovery recovery: announce immediately, inject any
    /// explicit peer hints, then if the swarm is still empty after a grace
    /// period, periodically re-announce and feed DHT bootstrap nodes. All
    /// of it is best-effort and never touches stream status.
    fn spawn_peer_recovery(
        &self,
        stream_id: Uuid,
        swarm: Arc<dyn SwarmSession>,
        magnet: &MagnetLink,
    ) -> tokio::task::JoinHandle<()> {
        let config = self.config.clone();
        let peer_hints = magnet.peer_hints.clone();

        tokio::spawn(async move {
            if !swarm.reannounce().await {
                debug!(
                    "Stream {}: engine manages tracker announces internally",
                    stream_id
                );
            }
            for hint in &peer_hints {
                if swarm.add_peer(*hint).await {
                    debug!("Stream {}: injected peer hint {}", stream_id, hint);
                }
            }

            tokio::time::sleep(config.peer_recovery_delay).await;
            if swarm.stats().await.peers > 0 {
                return;
            }

            for attempt in 1..=config.peer_recovery_attempts {
                info!(
                    "Stream {}: no peers yet, discovery recovery attempt {}/{}",
                    stream_id, attempt, config.peer_recovery_attempts
                );
                for node in &config.dht_bootstrap_nodes {
                    swarm.add_dht_node(node).await;
                }
                swarm.reannounce().await;

                tokio::time::sleep(config.peer_recovery_interval).await;
                if swarm.stats().await.peers > 0 {
                    return;
                }
            }
        })
    }
}

/// Overall torrent percentage, preferring swarm totals and falling back to
/// the selected file's own progress.
fn overall_percent(stats: &SwarmStats, entry: &AcquirerEntry) -> f64 {
    if stats.total_bytes > 0 {
        return (stats.downloaded_bytes as f64 / stats.total_bytes as f64 * 100.0).clamp(0.0, 100.0);
    }
    file_percent(stats, &entry.selected, &entry.download_dir)
}

/// Percentage of the selected file, from the highest-priority signal that
/// is available: on-disk size, then engine totals.
fn file_percent(stats: &SwarmStats, selected: &SelectedFile, download_dir: &Path) -> f64 {
    if selected.size == 0 {
        return 0.0;
    }
    let disk = disk_size_at(selected, download_dir);
    let bytes = disk.max(if stats.total_bytes > 0 {
        // Single-file streams: swarm totals approximate the file
        stats.downloaded_bytes.min(selected.size)
    } else {
        0
    });
    (bytes as f64 / selected.size as f64 * 100.0).clamp(0.0, 100.0)
}

fn disk_size(entry: &AcquirerEntry) -> u64 {
    disk_size_at(&entry.selected, &entry.download_dir)
}

fn disk_size_at(selected: &SelectedFile, download_dir: &Path) -> u64 {
    let full = download_dir.join(&selected.relative_path);
    if let Ok(meta) = std::fs::metadata(&full) {
        return meta.len();
    }
    // Some engines flatten the torrent tree into the download directory
    let flat = download_dir.join(&selected.name);
    std::fs::metadata(&flat).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::config::SpindriftConfig;
    use crate::torrent::engine::TorrentFileInfo;
    use crate::torrent::sim::{SimSwarmEngine, SimTorrentSpec};

    const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";

    fn magnet() -> MagnetLink {
        MagnetLink::parse(MAGNET).unwrap()
    }

    fn test_config(temp: &Path) -> SpindriftConfig {
        SpindriftConfig::for_testing(temp.to_path_buf())
    }

    async fn initializing_stream(registry: &StreamRegistry) -> Uuid {
        registry.create(MAGNET).await.id
    }

    #[tokio::test]
    async fn test_start_selects_video_and_marks_downloading() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path());
        let registry = Arc::new(StreamRegistry::new());
        let engine = Arc::new(SimSwarmEngine::new(SimTorrentSpec::single_video(
            "movie.mp4",
            256 * 1024,
        )));
        let acquirer = TorrentAcquirer::new(engine, Arc::clone(&registry), config.torrent);

        let id = initializing_stream(&registry).await;
        let selected = acquirer.start(id, &magnet(), temp.path()).await.unwrap();

        assert_eq!(selected.name, "movie.mp4");
        assert_eq!(
            registry.get(id).await.unwrap().status,
            StreamStatus::Downloading
        );

        acquirer.cleanup(id).await;
    }

    #[tokio::test]
    async fn test_no_media_rejected() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path());
        let registry = Arc::new(StreamRegistry::new());

        let mut spec = SimTorrentSpec::single_video("notes.txt", 50 * 1024 * 1024);
        spec.files = vec![TorrentFileInfo {
            index: 0,
            path: "notes.txt".into(),
            size: 50 * 1024 * 1024,
        }];
        let engine = Arc::new(SimSwarmEngine::new(spec));
        let acquirer = TorrentAcquirer::new(engine, Arc::clone(&registry), config.torrent);

        let id = initializing_stream(&registry).await;
        let result = acquirer.start(id, &magnet(), temp.path()).await;
        assert!(matches!(result, Err(TorrentError::NoMedia)));

        // No session lingers after a failed start
        assert!(acquirer.progress(id).await.is_none());
    }

    #[tokio::test]
    async fn test_effective_bytes_follow_disk() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path());
        let registry = Arc::new(StreamRegistry::new());
        let engine = Arc::new(SimSwarmEngine::new(SimTorrentSpec::single_video(
            "movie.mp4",
            128 * 1024,
        )));
        let acquirer = TorrentAcquirer::new(engine, Arc::clone(&registry), config.torrent);

        let id = initializing_stream(&registry).await;
        acquirer.start(id, &magnet(), temp.path()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let bytes = acquirer.effective_file_bytes(id).await;
        assert!(bytes > 0, "expected bytes on disk, got {bytes}");

        acquirer.cleanup(id).await;
    }

    #[tokio::test]
    async fn test_watchdog_declares_dead_torrent() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path());
        let registry = Arc::new(StreamRegistry::new());
        let engine = Arc::new(SimSwarmEngine::new(
            SimTorrentSpec::single_video("movie.mp4", 256 * 1024).dead(),
        ));
        let acquirer = TorrentAcquirer::new(engine, Arc::clone(&registry), config.torrent);

        let id = initializing_stream(&registry).await;
        acquirer.start(id, &magnet(), temp.path()).await.unwrap();

        // watchdog_interval is 50ms in the test config; six silent ticks
        // with zero peers must kill the stream
        tokio::time::sleep(Duration::from_millis(700)).await;

        let stream = registry.get(id).await.unwrap();
        assert_eq!(stream.status, StreamStatus::Error);
        assert!(stream.error.unwrap().contains("dead"));
        assert!(acquirer.progress(id).await.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path());
        let registry = Arc::new(StreamRegistry::new());
        let engine = Arc::new(SimSwarmEngine::new(SimTorrentSpec::single_video(
            "movie.mp4",
            64 * 1024,
        )));
        let acquirer = TorrentAcquirer::new(engine, Arc::clone(&registry), config.torrent);

        let id = initializing_stream(&registry).await;
        acquirer.start(id, &magnet(), temp.path()).await.unwrap();

        acquirer.cleanup(id).await;
        acquirer.cleanup(id).await;
        assert!(acquirer.swarm_stats(id).await.is_none());
    }

    #[tokio::test]
    async fn test_peer_recovery_injects_bootstrap_nodes() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path());
        let registry = Arc::new(StreamRegistry::new());
        let engine = Arc::new(SimSwarmEngine::new(
            SimTorrentSpec::single_video("movie.mp4", 64 * 1024).dead(),
        ));
        let nodes = Arc::clone(&engine.injected_nodes);
        let acquirer = TorrentAcquirer::new(engine, Arc::clone(&registry), config.torrent);

        let id = initializing_stream(&registry).await;
        acquirer.start(id, &magnet(), temp.path()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(nodes.load(std::sync::atomic::Ordering::SeqCst) > 0);

        acquirer.cleanup(id).await;
    }
}
