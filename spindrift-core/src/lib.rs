//! Spindrift Core - magnet-to-HLS stream coordination
//!
//! This crate provides the building blocks of the streaming gateway: the
//! per-stream path service, the in-memory stream registry, the torrent
//! acquirer, the FFmpeg-backed HLS packager, and the coordinator that ties
//! them into a single lazy, observable, cancellable stream per magnet link.

#![deny(missing_docs)]
#![deny(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]

pub mod config;
pub mod coordinator;
pub mod janitor;
pub mod logging;
pub mod packager;
pub mod paths;
pub mod registry;
pub mod torrent;

// Re-export main types for convenient access
pub use config::SpindriftConfig;
pub use coordinator::{StreamCoordinator, StreamTicket};
pub use janitor::Janitor;
pub use logging::{LogLevel, init_tracing};
pub use packager::{HlsPackager, PackagerError};
pub use paths::{PathError, StreamPaths};
pub use registry::{Stream, StreamRegistry, StreamStatus};
pub use torrent::{TorrentAcquirer, TorrentError};

/// Core errors that can bubble up from any Spindrift subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SpindriftError {
    /// Torrent-related errors (magnet parsing, swarm engine, file selection)
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    /// Packager errors (FFmpeg supervision, HLS output)
    #[error("Packager error: {0}")]
    Packager(#[from] PackagerError),

    /// Path service errors (directory creation, write probing)
    #[error("Path error: {0}")]
    Path(#[from] PathError),

    /// Registry errors (unknown stream, terminal-status refusal)
    #[error("Registry error: {0}")]
    Registry(#[from] registry::RegistryError),

    /// Configuration parsing or validation errors
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Human-readable description of the configuration error
        reason: String,
    },

    /// Standard I/O errors from filesystem operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpindriftError {
    /// Returns a short message suitable for the status API.
    ///
    /// The HTTP layer never sees internal error kinds, only the registry's
    /// `(status, error_message)` pair; this is where kinds collapse into
    /// the human-readable half of that pair.
    pub fn user_message(&self) -> String {
        match self {
            SpindriftError::Torrent(e) => e.user_message(),
            SpindriftError::Packager(e) => e.user_message(),
            SpindriftError::Path(_) | SpindriftError::Io(_) => {
                "file system error occurred".to_string()
            }
            SpindriftError::Registry(_) => "stream bookkeeping error".to_string(),
            SpindriftError::Configuration { reason } => {
                format!("configuration error: {reason}")
            }
        }
    }
}

/// Convenience Result type using SpindriftError as the error type
pub type Result<T> = std::result::Result<T, SpindriftError>;
