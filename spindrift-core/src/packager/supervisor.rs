//! Packager job supervision.
//!
//! One job per stream: the supervisor runs a segmenter attempt, maps its
//! event stream onto registry status (`converting`, then `ready` once
//! enough leading output exists), falls back from stream copy to re-encode
//! exactly once on codec rejection, and stops jobs with a cancel signal.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::segmenter::{SegmentSpec, Segmenter};
use super::{ConversionMode, PackagerError, PackagerEvent};
use crate::config::PackagerConfig;
use crate::registry::{StreamRegistry, StreamStatus};

struct JobEntry {
    cancel: watch::Sender<bool>,
    mode: ConversionMode,
    attempts: u32,
    last_percent: f64,
}

/// Supervises all packager jobs, keyed by stream ID.
pub struct HlsPackager {
    segmenter: Arc<dyn Segmenter>,
    registry: Arc<StreamRegistry>,
    config: PackagerConfig,
    jobs: Arc<RwLock<HashMap<Uuid, JobEntry>>>,
}

impl HlsPackager {
    /// Creates a packager over `segmenter`, reporting into `registry`.
    pub fn new(
        segmenter: Arc<dyn Segmenter>,
        registry: Arc<StreamRegistry>,
        config: PackagerConfig,
    ) -> Self {
        Self {
            segmenter,
            registry,
            config,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Supervises one packager run for a stream. Returns when the input
    /// reached EOF and the last segment was flushed, or with the failure
    /// kind the coordinator decides recovery from.
    ///
    /// # Errors
    ///
    /// - `PackagerError::FileNotReady` - input absent or too small; retryable
    /// - `PackagerError::Codec` - rejected even after the re-encode fallback
    /// - `PackagerError::Fatal` - unrecoverable failure
    pub async fn convert(
        &self,
        stream_id: Uuid,
        input: &Path,
        output_dir: &Path,
    ) -> Result<(), PackagerError> {
        preflight_input(input, self.config.min_input_bytes)?;

        let mut mode = if self.config.force_reencode {
            ConversionMode::ReEncode
        } else {
            ConversionMode::StreamCopy
        };
        let mut fallback_used = false;

        loop {
            let result = self
                .run_attempt(stream_id, input, output_dir, mode)
                .await;

            match result {
                Ok(outcome) => {
                    self.jobs.write().await.remove(&stream_id);
                    if outcome == AttemptOutcome::Completed {
                        info!("Stream {}: conversion completed", stream_id);
                    }
                    return Ok(());
                }
                Err(PackagerError::Codec { reason })
                    if !fallback_used && mode == ConversionMode::StreamCopy =>
                {
                    warn!(
                        "Stream {}: stream copy rejected ({}), falling back to re-encode",
                        stream_id, reason
                    );
                    fallback_used = true;
                    mode = ConversionMode::ReEncode;
                }
                Err(e) => {
                    self.jobs.write().await.remove(&stream_id);
                    return Err(e);
                }
            }
        }
    }

    /// Runs one segmenter attempt and folds its events into the registry.
    async fn run_attempt(
        &self,
        stream_id: Uuid,
        input: &Path,
        output_dir: &Path,
        mode: ConversionMode,
    ) -> Result<AttemptOutcome, PackagerError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (events_tx, mut events_rx) = mpsc::channel::<PackagerEvent>(32);

        {
            let mut jobs = self.jobs.write().await;
            let attempts = jobs.get(&stream_id).map(|j| j.attempts).unwrap_or(0) + 1;
            jobs.insert(
                stream_id,
                JobEntry {
                    cancel: cancel_tx,
                    mode,
                    attempts,
                    last_percent: 0.0,
                },
            );
        }

        let spec = SegmentSpec {
            input: input.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            mode,
        };
        let segmenter = Arc::clone(&self.segmenter);
        let run = tokio::spawn(async move { segmenter.run(spec, events_tx, cancel_rx).await });

        let mut declared_ready = false;
        let mut completed = false;
        while let Some(event) = events_rx.recv().await {
            match event {
                PackagerEvent::Started => {
                    debug!("Stream {}: packager started ({:?})", stream_id, mode);
                    let _ = self
                        .registry
                        .update_status(stream_id, StreamStatus::Converting, None)
                        .await;
                }
                PackagerEvent::Progress { percent, frames } => {
                    if let Some(percent) = percent {
                        if let Some(job) = self.jobs.write().await.get_mut(&stream_id) {
                            job.last_percent = percent;
                        }
                    }

                    let playable = match percent {
                        Some(p) => p >= self.config.ready_percent,
                        // Unknown duration: any processed frames count
                        None => frames > 0,
                    };
                    if playable && !declared_ready && hls_output_exists(output_dir) {
                        declared_ready = true;
                        info!("Stream {}: playable, leading segments on disk", stream_id);
                        let _ = self
                            .registry
                            .update_status(stream_id, StreamStatus::Ready, None)
                            .await;
                    }
                }
                PackagerEvent::Completed => {
                    completed = true;
                    if !declared_ready && hls_output_exists(output_dir) {
                        declared_ready = true;
                        let _ = self
                            .registry
                            .update_status(stream_id, StreamStatus::Ready, None)
                            .await;
                    }
                }
            }
        }

        let result = run.await.map_err(|e| PackagerError::Fatal {
            reason: format!("packager task panicked: {e}"),
        })?;

        result.map(|()| {
            if completed {
                AttemptOutcome::Completed
            } else {
                AttemptOutcome::Stopped
            }
        })
    }

    /// Stops a stream's job, asking the child to quit. Idempotent.
    pub async fn stop(&self, stream_id: Uuid) {
        let entry = self.jobs.write().await.remove(&stream_id);
        if let Some(entry) = entry {
            let _ = entry.cancel.send(true);
            debug!("Stream {}: packager stop requested", stream_id);
        }
    }

    /// Streams with a live packager job.
    pub async fn active(&self) -> Vec<Uuid> {
        self.jobs.read().await.keys().copied().collect()
    }

    /// Last reported packager percentage for a stream's job.
    pub async fn job_progress(&self, stream_id: Uuid) -> Option<f64> {
        self.jobs
            .read()
            .await
            .get(&stream_id)
            .map(|j| j.last_percent)
    }

    /// The mode the stream's current job runs in.
    pub async fn job_mode(&self, stream_id: Uuid) -> Option<ConversionMode> {
        self.jobs.read().await.get(&stream_id).map(|j| j.mode)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum AttemptOutcome {
    Completed,
    Stopped,
}

/// The input must exist and carry enough leading bytes for FFmpeg to make
/// sense of the container.
fn preflight_input(input: &Path, min_bytes: u64) -> Result<(), PackagerError> {
    match std::fs::metadata(input) {
        Ok(meta) if meta.len() >= min_bytes => Ok(()),
        Ok(meta) => Err(PackagerError::FileNotReady {
            reason: format!("input has {} bytes, need {}", meta.len(), min_bytes),
        }),
        Err(_) => Err(PackagerError::FileNotReady {
            reason: format!("input {} does not exist", input.display()),
        }),
    }
}

/// Whether the playlist and at least one segment have landed on disk.
fn hls_output_exists(output_dir: &Path) -> bool {
    if !output_dir.join("playlist.m3u8").is_file() {
        return false;
    }
    std::fs::read_dir(output_dir)
        .map(|entries| {
            entries.flatten().any(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "ts")
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}
