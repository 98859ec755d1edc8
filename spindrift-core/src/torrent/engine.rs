//! Capability seam over the BitTorrent engine.
//!
//! The rest of the core depends only on these traits; the production
//! adapter wraps librqbit and a deterministic in-process engine backs the
//! tests. The seam is deliberately small: the file list, selection with
//! best-effort deselection and prioritization, swarm statistics, the
//! pause/resume pair the stall recovery needs, and a handful of
//! best-effort peer discovery hooks. Methods returning `bool` report
//! whether the engine supports the operation at all; callers log and
//! tolerate `false`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::TorrentError;
use super::magnet::MagnetLink;

/// One file announced by a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFileInfo {
    /// Position in the torrent's file list
    pub index: usize,
    /// Path relative to the download directory
    pub path: PathBuf,
    /// Announced length in bytes
    pub size: u64,
}

impl TorrentFileInfo {
    /// The file's basename, or the whole path when it has no separator.
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// Instantaneous swarm statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwarmStats {
    /// Verified bytes downloaded across the whole torrent
    pub downloaded_bytes: u64,
    /// Total torrent length (0 until metadata is known)
    pub total_bytes: u64,
    /// Currently connected peers
    pub peers: u32,
    /// Download speed in bytes per second
    pub download_speed: f64,
    /// Upload speed in bytes per second
    pub upload_speed: f64,
    /// Whether the engine considers the download complete
    pub finished: bool,
}

/// A running (or announced) torrent inside the engine.
#[async_trait]
pub trait SwarmSession: Send + Sync {
    /// Files announced by the torrent, in announcement order.
    fn files(&self) -> &[TorrentFileInfo];

    /// Selects `index` for download. For engines without per-file
    /// selection this starts the whole torrent.
    ///
    /// # Errors
    ///
    /// - `TorrentError::EngineFailure` - the engine rejected the selection
    async fn select_file(&self, index: usize) -> Result<(), TorrentError>;

    /// Deselects `index`. Returns `Ok(false)` when the engine does not
    /// support deselection; that is tolerated, not an error.
    ///
    /// # Errors
    ///
    /// - `TorrentError::EngineFailure` - deselection is supported but failed
    async fn deselect_file(&self, index: usize) -> Result<bool, TorrentError>;

    /// Raises `index` to the engine's highest priority, when supported.
    async fn set_file_priority(&self, index: usize) -> bool;

    /// Current swarm statistics.
    async fn stats(&self) -> SwarmStats;

    /// Engine-reported downloaded bytes for one file, when the engine
    /// tracks per-file progress.
    async fn file_bytes(&self, index: usize) -> Option<u64>;

    /// Pauses the swarm.
    ///
    /// # Errors
    ///
    /// - `TorrentError::EngineFailure` - the engine rejected the pause
    async fn pause(&self) -> Result<(), TorrentError>;

    /// Resumes the swarm.
    ///
    /// # Errors
    ///
    /// - `TorrentError::EngineFailure` - the engine rejected the resume
    async fn resume(&self) -> Result<(), TorrentError>;

    /// Re-announces to all trackers. Best-effort.
    async fn reannounce(&self) -> bool;

    /// Injects an explicit peer into the swarm. Best-effort.
    async fn add_peer(&self, addr: SocketAddr) -> bool;

    /// Injects a DHT bootstrap node (`host:port`). Best-effort.
    async fn add_dht_node(&self, node: &str) -> bool;

    /// Destroys the session and releases engine resources. Idempotent.
    ///
    /// # Errors
    ///
    /// - `TorrentError::EngineFailure` - teardown failed in the engine
    async fn destroy(&self) -> Result<(), TorrentError>;
}

/// The engine factory: turns a magnet link into a session.
#[async_trait]
pub trait SwarmEngine: Send + Sync {
    /// Starts acquisition of `magnet` into `download_dir` and resolves the
    /// torrent's file list. The returned session has no file selected yet;
    /// callers apply the selection policy and then call
    /// [`SwarmSession::select_file`].
    ///
    /// # Errors
    ///
    /// - `TorrentError::EngineFailure` - the engine could not add the torrent
    /// - `TorrentError::MetadataTimeout` - metadata never arrived
    async fn start(
        &self,
        magnet: &MagnetLink,
        download_dir: &Path,
    ) -> Result<Box<dyn SwarmSession>, TorrentError>;
}
