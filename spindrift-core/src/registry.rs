//! In-memory index of all live streams.
//!
//! The registry is the single cross-task mutable structure in the system:
//! the HTTP layer reads it on every status/playlist request and the
//! coordinator's background tasks write to it as the stream advances. A
//! stream record is created only by the coordinator, mutated only through
//! the update operations here, and removed by cleanup. Nothing survives a
//! restart; state is in-memory by design.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// Registry entry exists, acquisition not yet confirmed
    Initializing,
    /// Swarm engine running, target file selected
    Downloading,
    /// Packager started
    Converting,
    /// Packager reported the input was not ready; a retry is scheduled
    WaitingForData,
    /// Playable: playlist and leading segments exist on disk
    Ready,
    /// Terminal failure; `error` carries the human-readable message
    Error,
}

impl StreamStatus {
    /// Whether the janitor must leave streams in this state alone
    /// regardless of age.
    pub fn is_sweep_exempt(self) -> bool {
        matches!(self, StreamStatus::Downloading | StreamStatus::Converting)
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamStatus::Initializing => "initializing",
            StreamStatus::Downloading => "downloading",
            StreamStatus::Converting => "converting",
            StreamStatus::WaitingForData => "waiting_for_data",
            StreamStatus::Ready => "ready",
            StreamStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A live stream record.
#[derive(Debug, Clone)]
pub struct Stream {
    /// Registry key; also drives the on-disk directory hash
    pub id: Uuid,
    /// Originating magnet URI, verbatim
    pub magnet: String,
    /// Current lifecycle state
    pub status: StreamStatus,
    /// Overall torrent download percentage in [0, 100]
    pub progress: f64,
    /// Human-readable failure message once status is `Error`
    pub error: Option<String>,
    /// Creation time
    pub created_at: SystemTime,
    /// Time of the last status or progress change
    pub updated_at: SystemTime,
    /// Number of keep-alive touches
    pub access_count: u64,
    /// Time of the last keep-alive touch (creation time initially)
    pub last_access: SystemTime,
}

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The stream ID is not in the registry
    #[error("stream {id} not found")]
    StreamNotFound {
        /// The unknown stream ID
        id: Uuid,
    },

    /// A forward transition was attempted out of the terminal `Error` state
    #[error("stream {id} is in a terminal state")]
    TerminalStatus {
        /// The stream refusing the transition
        id: Uuid,
    },
}

/// Per-status counts, as returned by [`StreamRegistry::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    /// Streams currently `initializing`
    pub initializing: usize,
    /// Streams currently `downloading`
    pub downloading: usize,
    /// Streams currently `converting`
    pub converting: usize,
    /// Streams currently `waiting_for_data`
    pub waiting_for_data: usize,
    /// Streams currently `ready`
    pub ready: usize,
    /// Streams currently `error`
    pub error: usize,
}

/// Thread-safe stream index.
///
/// A single lock over the whole map suffices: the map is small (tens of
/// entries) and every operation is a cheap in-memory mutation.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: RwLock<HashMap<Uuid, Stream>>,
}

impl StreamRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a stream for `magnet` with a fresh UUID, status
    /// `Initializing` and zero progress, and returns a copy of the record.
    pub async fn create(&self, magnet: &str) -> Stream {
        let now = SystemTime::now();
        let stream = Stream {
            id: Uuid::new_v4(),
            magnet: magnet.to_string(),
            status: StreamStatus::Initializing,
            progress: 0.0,
            error: None,
            created_at: now,
            updated_at: now,
            access_count: 0,
            last_access: now,
        };

        self.streams.write().await.insert(stream.id, stream.clone());
        debug!("Created stream {} for magnet", stream.id);
        stream
    }

    /// Returns a copy of the stream record, if present.
    ///
    /// `Ready` streams report progress 100 regardless of how much of the
    /// torrent is still downloading in the background.
    pub async fn get(&self, id: Uuid) -> Option<Stream> {
        self.streams.read().await.get(&id).map(|s| {
            let mut s = s.clone();
            if s.status == StreamStatus::Ready {
                s.progress = 100.0;
            }
            s
        })
    }

    /// Transitions a stream to `status`, recording `error` when given.
    ///
    /// # Errors
    ///
    /// - `RegistryError::StreamNotFound` - unknown ID
    /// - `RegistryError::TerminalStatus` - the stream is already in
    ///   `Error`; only cleanup may follow
    pub async fn update_status(
        &self,
        id: Uuid,
        status: StreamStatus,
        error: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut streams = self.streams.write().await;
        let stream = streams
            .get_mut(&id)
            .ok_or(RegistryError::StreamNotFound { id })?;

        if stream.status == StreamStatus::Error && status != StreamStatus::Error {
            return Err(RegistryError::TerminalStatus { id });
        }

        debug!("Stream {} status {} -> {}", id, stream.status, status);
        stream.status = status;
        stream.error = error;
        stream.updated_at = SystemTime::now();
        Ok(())
    }

    /// Updates download progress, clamped to [0, 100].
    ///
    /// # Errors
    ///
    /// - `RegistryError::StreamNotFound` - unknown ID
    pub async fn update_progress(&self, id: Uuid, progress: f64) -> Result<(), RegistryError> {
        let mut streams = self.streams.write().await;
        let stream = streams
            .get_mut(&id)
            .ok_or(RegistryError::StreamNotFound { id })?;

        stream.progress = if stream.status == StreamStatus::Ready {
            100.0
        } else {
            progress.clamp(0.0, 100.0)
        };
        stream.updated_at = SystemTime::now();
        Ok(())
    }

    /// Bumps the access counter and last-access timestamp.
    ///
    /// # Errors
    ///
    /// - `RegistryError::StreamNotFound` - unknown ID
    pub async fn keep_alive(&self, id: Uuid) -> Result<(), RegistryError> {
        let mut streams = self.streams.write().await;
        let stream = streams
            .get_mut(&id)
            .ok_or(RegistryError::StreamNotFound { id })?;

        stream.access_count += 1;
        stream.last_access = SystemTime::now();
        Ok(())
    }

    /// Removes a stream, returning the final record if it existed.
    pub async fn remove(&self, id: Uuid) -> Option<Stream> {
        self.streams.write().await.remove(&id)
    }

    /// All streams currently in `status`.
    pub async fn list_by_status(&self, status: StreamStatus) -> Vec<Stream> {
        self.streams
            .read()
            .await
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect()
    }

    /// Streams idle for longer than `age` that the janitor may sweep.
    ///
    /// Streams in `Downloading` or `Converting` are exempt regardless of
    /// age: a slow-but-healthy stream is never swept out from under its
    /// own pipeline.
    pub async fn sweepable_older_than(&self, age: Duration) -> Vec<Stream> {
        let now = SystemTime::now();
        self.streams
            .read()
            .await
            .values()
            .filter(|s| !s.status.is_sweep_exempt())
            .filter(|s| {
                now.duration_since(s.last_access)
                    .map(|idle| idle > age)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Per-status stream counts.
    pub async fn stats(&self) -> RegistryStats {
        let streams = self.streams.read().await;
        let mut stats = RegistryStats::default();
        for stream in streams.values() {
            match stream.status {
                StreamStatus::Initializing => stats.initializing += 1,
                StreamStatus::Downloading => stats.downloading += 1,
                StreamStatus::Converting => stats.converting += 1,
                StreamStatus::WaitingForData => stats.waiting_for_data += 1,
                StreamStatus::Ready => stats.ready += 1,
                StreamStatus::Error => stats.error += 1,
            }
        }
        stats
    }

    /// Number of streams currently registered.
    pub async fn len(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Whether the registry holds no streams.
    pub async fn is_empty(&self) -> bool {
        self.streams.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";

    #[tokio::test]
    async fn test_create_sets_initial_state() {
        let registry = StreamRegistry::new();
        let stream = registry.create(MAGNET).await;

        assert_eq!(stream.status, StreamStatus::Initializing);
        assert_eq!(stream.progress, 0.0);
        assert!(stream.error.is_none());
        assert_eq!(stream.access_count, 0);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_progress_is_clamped() {
        let registry = StreamRegistry::new();
        let stream = registry.create(MAGNET).await;

        registry.update_progress(stream.id, 250.0).await.unwrap();
        assert_eq!(registry.get(stream.id).await.unwrap().progress, 100.0);

        registry.update_progress(stream.id, -3.0).await.unwrap();
        assert_eq!(registry.get(stream.id).await.unwrap().progress, 0.0);
    }

    #[tokio::test]
    async fn test_ready_pins_progress_at_100() {
        let registry = StreamRegistry::new();
        let stream = registry.create(MAGNET).await;

        registry.update_progress(stream.id, 37.0).await.unwrap();
        registry
            .update_status(stream.id, StreamStatus::Ready, None)
            .await
            .unwrap();

        assert_eq!(registry.get(stream.id).await.unwrap().progress, 100.0);

        // Background download progress keeps arriving; reporting stays pinned
        registry.update_progress(stream.id, 42.0).await.unwrap();
        assert_eq!(registry.get(stream.id).await.unwrap().progress, 100.0);
    }

    #[tokio::test]
    async fn test_error_is_terminal_for_forward_transitions() {
        let registry = StreamRegistry::new();
        let stream = registry.create(MAGNET).await;

        registry
            .update_status(stream.id, StreamStatus::Error, Some("dead".to_string()))
            .await
            .unwrap();

        let result = registry
            .update_status(stream.id, StreamStatus::Downloading, None)
            .await;
        assert!(matches!(result, Err(RegistryError::TerminalStatus { .. })));

        // Cleanup is still permitted
        assert!(registry.remove(stream.id).await.is_some());
        assert!(registry.get(stream.id).await.is_none());
    }

    #[tokio::test]
    async fn test_keep_alive_bumps_counter() {
        let registry = StreamRegistry::new();
        let stream = registry.create(MAGNET).await;

        registry.keep_alive(stream.id).await.unwrap();
        registry.keep_alive(stream.id).await.unwrap();

        let fetched = registry.get(stream.id).await.unwrap();
        assert_eq!(fetched.access_count, 2);
        assert!(fetched.last_access >= stream.last_access);
    }

    #[tokio::test]
    async fn test_sweep_exempts_active_statuses() {
        let registry = StreamRegistry::new();
        let downloading = registry.create(MAGNET).await;
        let converting = registry.create(MAGNET).await;
        let errored = registry.create(MAGNET).await;

        registry
            .update_status(downloading.id, StreamStatus::Downloading, None)
            .await
            .unwrap();
        registry
            .update_status(converting.id, StreamStatus::Converting, None)
            .await
            .unwrap();
        registry
            .update_status(errored.id, StreamStatus::Error, Some("x".to_string()))
            .await
            .unwrap();

        // Zero age: everything is "old enough", only exemption matters
        let sweepable = registry.sweepable_older_than(Duration::ZERO).await;
        let ids: Vec<Uuid> = sweepable.iter().map(|s| s.id).collect();

        assert!(ids.contains(&errored.id));
        assert!(!ids.contains(&downloading.id));
        assert!(!ids.contains(&converting.id));
    }

    #[tokio::test]
    async fn test_stats_counts_per_status() {
        let registry = StreamRegistry::new();
        let a = registry.create(MAGNET).await;
        let _b = registry.create(MAGNET).await;

        registry
            .update_status(a.id, StreamStatus::Ready, None)
            .await
            .unwrap();

        let stats = registry.stats().await;
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.initializing, 1);
        assert_eq!(stats.downloading, 0);
    }

    #[tokio::test]
    async fn test_unknown_stream_is_an_error() {
        let registry = StreamRegistry::new();
        let id = Uuid::new_v4();

        assert!(matches!(
            registry.update_progress(id, 1.0).await,
            Err(RegistryError::StreamNotFound { .. })
        ));
        assert!(registry.get(id).await.is_none());
        assert!(registry.remove(id).await.is_none());
    }
}
