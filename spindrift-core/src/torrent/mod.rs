//! Torrent acquisition: magnet parsing, file selection, the swarm engine
//! capability seam, and the per-stream acquirer that supervises a download.
//!
//! The BitTorrent wire protocol itself is provided by the engine behind the
//! [`SwarmEngine`] trait; this module owns how the engine is driven — which
//! file gets selected, how stalls are detected and recovered, and when a
//! torrent is declared dead.

pub mod acquirer;
pub mod engine;
pub mod magnet;
pub mod rqbit;
pub mod selection;
pub mod sim;

pub use acquirer::{SelectedFile, TorrentAcquirer};
pub use engine::{SwarmEngine, SwarmSession, SwarmStats, TorrentFileInfo};
pub use magnet::MagnetLink;
pub use rqbit::RqbitEngine;
pub use selection::select_video_file;

use uuid::Uuid;

/// Errors that can occur during torrent operations.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    /// The magnet URI is missing or malformed
    #[error("invalid magnet link: {reason}")]
    InvalidMagnet {
        /// What was wrong with the URI
        reason: String,
    },

    /// The torrent announces no suitable video file
    #[error("torrent contains no suitable video file")]
    NoMedia,

    /// The swarm engine failed
    #[error("engine failure: {reason}")]
    EngineFailure {
        /// Engine-reported failure description
        reason: String,
    },

    /// The engine never produced torrent metadata
    #[error("timed out waiting for torrent metadata")]
    MetadataTimeout,

    /// No torrent session exists for the stream
    #[error("no torrent session for stream {stream_id}")]
    SessionNotFound {
        /// The stream with no session
        stream_id: Uuid,
    },

    /// Filesystem error while inspecting the download
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TorrentError {
    /// Short message for the status API.
    pub fn user_message(&self) -> String {
        match self {
            TorrentError::InvalidMagnet { reason } => format!("invalid magnet link: {reason}"),
            TorrentError::NoMedia => "no suitable video file found in torrent".to_string(),
            TorrentError::EngineFailure { .. } => "torrent engine failure".to_string(),
            TorrentError::MetadataTimeout => {
                "timed out fetching torrent metadata".to_string()
            }
            TorrentError::SessionNotFound { .. } => "torrent session not found".to_string(),
            TorrentError::Io(_) => "file system error occurred".to_string(),
        }
    }
}
