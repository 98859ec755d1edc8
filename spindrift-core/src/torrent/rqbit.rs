//! Production swarm engine backed by librqbit.
//!
//! One librqbit `Session` serves the whole process; each stream becomes one
//! managed torrent with its own output folder. Metadata is resolved with a
//! list-only add (no data transfer), and the real add happens when the
//! acquirer selects a file: `only_files` restricts the download to that
//! file, which is how selection-plus-deselection maps onto this engine.
//! Explicit peer hints from the magnet are injected as initial peers at add
//! time; post-add peer/DHT injection and manual re-announce are not exposed
//! by the library and report unsupported.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use librqbit::api::{Api, TorrentIdOrHash};
use librqbit::{AddTorrent, AddTorrentOptions, AddTorrentResponse, Session};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::engine::{SwarmEngine, SwarmSession, SwarmStats, TorrentFileInfo};
use super::magnet::MagnetLink;
use crate::config::TorrentConfig;
use crate::torrent::TorrentError;

/// Swarm engine adapter over a shared librqbit session.
pub struct RqbitEngine {
    session: Arc<Session>,
    api: Api,
    config: TorrentConfig,
}

impl RqbitEngine {
    /// Creates the engine with its session rooted at `engine_root`.
    ///
    /// Listen ports and peer limits ride on the library's own session
    /// defaults; the config's fallback trackers and peer hints are applied
    /// per torrent at add time.
    ///
    /// # Errors
    ///
    /// - `TorrentError::EngineFailure` - the librqbit session could not start
    pub async fn new(config: TorrentConfig, engine_root: PathBuf) -> Result<Self, TorrentError> {
        let session =
            Session::new(engine_root)
                .await
                .map_err(|e| TorrentError::EngineFailure {
                    reason: format!("failed to create torrent session: {e}"),
                })?;
        let api = Api::new(session.clone(), None);

        info!("librqbit session started");
        Ok(Self {
            session,
            api,
            config,
        })
    }
}

#[async_trait]
impl SwarmEngine for RqbitEngine {
    async fn start(
        &self,
        magnet: &MagnetLink,
        download_dir: &Path,
    ) -> Result<Box<dyn SwarmSession>, TorrentError> {
        let magnet_url = magnet.with_extra_trackers(&self.config.fallback_trackers);

        // List-only add: fetches metadata from the swarm without starting
        // any data transfer, so the selection policy can run first.
        let listing = tokio::time::timeout(
            self.config.metadata_timeout,
            self.api.api_add_torrent(
                AddTorrent::from_url(&magnet_url),
                Some(AddTorrentOptions {
                    list_only: true,
                    ..Default::default()
                }),
            ),
        )
        .await
        .map_err(|_| TorrentError::MetadataTimeout)?
        .map_err(|e| TorrentError::EngineFailure {
            reason: format!("metadata fetch failed: {e}"),
        })?;

        let details = listing.details;
        let files: Vec<TorrentFileInfo> = details
            .files
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(index, f)| {
                let path: PathBuf = if f.components.is_empty() {
                    PathBuf::from(&f.name)
                } else {
                    f.components.iter().collect()
                };
                TorrentFileInfo {
                    index,
                    path,
                    size: f.length as u64,
                }
            })
            .collect();

        debug!(
            "Metadata resolved for {}: {} files",
            magnet.info_hash,
            files.len()
        );

        Ok(Box::new(RqbitSession {
            session: Arc::clone(&self.session),
            api: self.api.clone(),
            magnet_url,
            peer_hints: magnet.peer_hints.clone(),
            download_dir: download_dir.to_path_buf(),
            files,
            active: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }))
    }
}

struct ActiveTorrent {
    id: usize,
    handle: Arc<librqbit::ManagedTorrent>,
}

/// One managed torrent; created in announced state, started by
/// [`SwarmSession::select_file`].
struct RqbitSession {
    session: Arc<Session>,
    api: Api,
    magnet_url: String,
    peer_hints: Vec<SocketAddr>,
    download_dir: PathBuf,
    files: Vec<TorrentFileInfo>,
    active: Mutex<Option<ActiveTorrent>>,
    destroyed: AtomicBool,
}

impl RqbitSession {
    async fn active_id(&self) -> Option<usize> {
        self.active.lock().await.as_ref().map(|a| a.id)
    }
}

#[async_trait]
impl SwarmSession for RqbitSession {
    fn files(&self) -> &[TorrentFileInfo] {
        &self.files
    }

    async fn select_file(&self, index: usize) -> Result<(), TorrentError> {
        let opts = AddTorrentOptions {
            list_only: false,
            only_files: Some(vec![index]),
            output_folder: Some(self.download_dir.to_string_lossy().to_string()),
            overwrite: true,
            initial_peers: (!self.peer_hints.is_empty()).then(|| self.peer_hints.clone()),
            ..Default::default()
        };

        let response = self
            .session
            .add_torrent(AddTorrent::from_url(&self.magnet_url), Some(opts))
            .await
            .map_err(|e| TorrentError::EngineFailure {
                reason: format!("failed to start torrent: {e}"),
            })?;

        let (id, handle) = match response {
            AddTorrentResponse::Added(id, handle)
            | AddTorrentResponse::AlreadyManaged(id, handle) => (id, handle),
            AddTorrentResponse::ListOnly(_) => {
                return Err(TorrentError::EngineFailure {
                    reason: "engine returned a list-only response for a real add".to_string(),
                });
            }
        };

        info!(
            "Torrent started: file {} -> {}",
            index,
            self.download_dir.display()
        );
        *self.active.lock().await = Some(ActiveTorrent { id, handle });
        Ok(())
    }

    async fn deselect_file(&self, _index: usize) -> Result<bool, TorrentError> {
        // only_files at add time already excludes everything else
        Ok(false)
    }

    async fn set_file_priority(&self, _index: usize) -> bool {
        false
    }

    async fn stats(&self) -> SwarmStats {
        let active = self.active.lock().await;
        let Some(active) = active.as_ref() else {
            return SwarmStats::default();
        };

        let stats = active.handle.stats();
        let (peers, download_speed, upload_speed) = stats
            .live
            .as_ref()
            .map(|l| {
                (
                    l.snapshot.peer_stats.live as u32,
                    l.download_speed.mbps * 125_000.0,
                    l.upload_speed.mbps * 125_000.0,
                )
            })
            .unwrap_or((0, 0.0, 0.0));

        SwarmStats {
            downloaded_bytes: stats.progress_bytes,
            total_bytes: stats.total_bytes,
            peers,
            download_speed,
            upload_speed,
            finished: stats.finished,
        }
    }

    async fn file_bytes(&self, _index: usize) -> Option<u64> {
        // Per-file progress is not exposed; callers fall back to the
        // on-disk size, which outranks this signal anyway.
        None
    }

    async fn pause(&self) -> Result<(), TorrentError> {
        let Some(id) = self.active_id().await else {
            return Ok(());
        };
        self.api
            .api_torrent_action_pause(TorrentIdOrHash::Id(id))
            .await
            .map(|_| ())
            .map_err(|e| TorrentError::EngineFailure {
                reason: format!("pause failed: {e}"),
            })
    }

    async fn resume(&self) -> Result<(), TorrentError> {
        let Some(id) = self.active_id().await else {
            return Ok(());
        };
        self.api
            .api_torrent_action_start(TorrentIdOrHash::Id(id))
            .await
            .map(|_| ())
            .map_err(|e| TorrentError::EngineFailure {
                reason: format!("resume failed: {e}"),
            })
    }

    async fn reannounce(&self) -> bool {
        false
    }

    async fn add_peer(&self, _addr: SocketAddr) -> bool {
        false
    }

    async fn add_dht_node(&self, _node: &str) -> bool {
        false
    }

    async fn destroy(&self) -> Result<(), TorrentError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let active = self.active.lock().await.take();
        if let Some(active) = active {
            if let Err(e) = self
                .session
                .delete(TorrentIdOrHash::Id(active.id), true)
                .await
            {
                warn!("Failed to delete torrent from engine: {}", e);
            }
        }
        Ok(())
    }
}
