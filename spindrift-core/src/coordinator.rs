//! Stream orchestration.
//!
//! The coordinator is the only party that calls across components. For each
//! new magnet it allocates the stream, prepares directories, starts the
//! acquirer, blocks on the readiness predicate, resolves the on-disk input,
//! and drives the packager with retries — and it alone decides which
//! failure kinds are recoverable. Teardown always runs in the same order:
//! packager, then engine, then registry, then filesystem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{RwLock, Semaphore, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::packager::{HlsPackager, PackagerError};
use crate::paths::StreamPaths;
use crate::registry::{StreamRegistry, StreamStatus};
use crate::torrent::acquirer::{SelectedFile, TorrentAcquirer};
use crate::torrent::magnet::MagnetLink;
use crate::torrent::selection::has_video_extension;
use crate::Result;

/// What a successful stream creation hands back to the HTTP layer.
#[derive(Debug, Clone)]
pub struct StreamTicket {
    /// The new stream's registry key
    pub id: Uuid,
    /// Status at creation time
    pub status: StreamStatus,
}

/// Orchestrates acquisition, readiness, packaging and teardown per stream.
#[derive(Clone)]
pub struct StreamCoordinator {
    registry: Arc<StreamRegistry>,
    paths: StreamPaths,
    acquirer: Arc<TorrentAcquirer>,
    packager: Arc<HlsPackager>,
    config: CoordinatorConfig,
    admission: Arc<Semaphore>,
    cancels: Arc<RwLock<HashMap<Uuid, watch::Sender<bool>>>>,
}

impl StreamCoordinator {
    /// Wires the coordinator over explicitly constructed components, so
    /// tests can substitute fakes for any of them.
    pub fn new(
        registry: Arc<StreamRegistry>,
        paths: StreamPaths,
        acquirer: Arc<TorrentAcquirer>,
        packager: Arc<HlsPackager>,
        config: CoordinatorConfig,
    ) -> Self {
        let admission = Arc::new(Semaphore::new(config.max_concurrent_streams));
        Self {
            registry,
            paths,
            acquirer,
            packager,
            config,
            admission,
            cancels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The registry this coordinator reports into.
    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// The path service this coordinator lays streams out with.
    pub fn paths(&self) -> &StreamPaths {
        &self.paths
    }

    /// Creates a stream for `magnet_url` and spawns its orchestration.
    ///
    /// Only a malformed magnet fails synchronously; every later failure
    /// surfaces through the stream's status, so the caller always has an
    /// ID to poll.
    ///
    /// # Errors
    ///
    /// - `SpindriftError::Torrent` (`InvalidMagnet`) - unparseable magnet URI
    pub async fn create_stream(&self, magnet_url: &str) -> Result<StreamTicket> {
        let magnet = MagnetLink::parse(magnet_url)?;

        let stream = self.registry.create(magnet_url).await;
        info!("Stream {}: created for {}", stream.id, magnet.info_hash);

        if let Err(e) = self.paths.ensure_stream_dirs(stream.id) {
            // Unwritable directories are an environment problem; report it
            // through polling like every other asynchronous failure.
            warn!("Stream {}: directory setup failed: {}", stream.id, e);
            let _ = self
                .registry
                .update_status(
                    stream.id,
                    StreamStatus::Error,
                    Some("file system error occurred".to_string()),
                )
                .await;
            return Ok(StreamTicket {
                id: stream.id,
                status: StreamStatus::Error,
            });
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels.write().await.insert(stream.id, cancel_tx);

        let coordinator = self.clone();
        let id = stream.id;
        tokio::spawn(async move {
            coordinator.orchestrate(id, magnet, cancel_rx).await;
        });

        Ok(StreamTicket {
            id: stream.id,
            status: StreamStatus::Initializing,
        })
    }

    /// Cancels and fully removes a stream: packager stopped, engine
    /// destroyed, registry entry gone, both directory trees deleted.
    /// Idempotent; callable at any point of the stream's life.
    pub async fn cleanup(&self, stream_id: Uuid) {
        if let Some(cancel) = self.cancels.write().await.remove(&stream_id) {
            let _ = cancel.send(true);
        }

        // Order is mandatory: stopping the engine first would let the
        // packager observe a truncated file and race.
        self.packager.stop(stream_id).await;
        self.acquirer.cleanup(stream_id).await;
        self.registry.remove(stream_id).await;
        if let Err(e) = self.paths.remove_stream_dirs(stream_id) {
            warn!("Stream {}: directory removal failed: {}", stream_id, e);
        }
        debug!("Stream {}: cleaned up", stream_id);
    }

    /// Keep-alive passthrough for the HTTP layer.
    pub async fn keep_alive(&self, stream_id: Uuid) {
        let _ = self.registry.keep_alive(stream_id).await;
    }

    /// The full orchestration of one stream, from swarm start to packager
    /// completion or failure.
    async fn orchestrate(
        &self,
        stream_id: Uuid,
        magnet: MagnetLink,
        mut cancel: watch::Receiver<bool>,
    ) {
        let Ok(_permit) = Arc::clone(&self.admission).acquire_owned().await else {
            return;
        };
        if *cancel.borrow() {
            return;
        }

        let download_dir = self.paths.stream_dir(stream_id);
        let hls_dir = self.paths.hls_dir(stream_id);

        let selected = match self.acquirer.start(stream_id, &magnet, &download_dir).await {
            Ok(selected) => selected,
            Err(e) => {
                warn!("Stream {}: acquisition failed: {}", stream_id, e);
                self.fail_stream(stream_id, e.user_message()).await;
                return;
            }
        };

        let mut required_bytes = self.config.required_bytes;
        let mut attempt = 1u32;

        loop {
            match self
                .wait_for_readiness(stream_id, &selected, required_bytes, &mut cancel)
                .await
            {
                Readiness::Ready => {}
                Readiness::Dead => {
                    self.fail_stream(
                        stream_id,
                        "torrent appears to be dead (no peers found)".to_string(),
                    )
                    .await;
                    return;
                }
                Readiness::Cancelled => return,
            }

            let input = match resolve_input_path(&download_dir, &selected) {
                Some(input) => input,
                None => {
                    debug!(
                        "Stream {}: readiness fired but no file on disk yet",
                        stream_id
                    );
                    if !self
                        .schedule_retry(stream_id, &mut attempt, &mut required_bytes, &mut cancel)
                        .await
                    {
                        return;
                    }
                    continue;
                }
            };

            sniff_container(&input);

            match self.packager.convert(stream_id, &input, &hls_dir).await {
                Ok(()) => {
                    debug!("Stream {}: packager finished", stream_id);
                    return;
                }
                Err(PackagerError::FileNotReady { reason }) => {
                    debug!("Stream {}: input not ready ({})", stream_id, reason);
                    if !self
                        .schedule_retry(stream_id, &mut attempt, &mut required_bytes, &mut cancel)
                        .await
                    {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Stream {}: conversion failed: {}", stream_id, e);
                    self.fail_stream(stream_id, e.user_message()).await;
                    return;
                }
            }
        }
    }

    /// Marks the stream `waiting_for_data` and sleeps out the retry delay,
    /// doubling the required-bytes threshold. Returns `false` when retries
    /// are exhausted (the stream is failed) or the wait was cancelled.
    async fn schedule_retry(
        &self,
        stream_id: Uuid,
        attempt: &mut u32,
        required_bytes: &mut u64,
        cancel: &mut watch::Receiver<bool>,
    ) -> bool {
        if *attempt >= self.config.max_convert_attempts {
            self.fail_stream(
                stream_id,
                "video file never became ready for conversion".to_string(),
            )
            .await;
            return false;
        }

        let _ = self
            .registry
            .update_status(stream_id, StreamStatus::WaitingForData, None)
            .await;

        let delay = if *attempt == 1 {
            self.config.first_retry_delay
        } else {
            self.config.retry_delay
        };
        info!(
            "Stream {}: retrying conversion in {:?} (attempt {}/{})",
            stream_id,
            delay,
            *attempt + 1,
            self.config.max_convert_attempts
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.changed() => {}
        }
        if *cancel.borrow() {
            return false;
        }

        *attempt += 1;
        *required_bytes *= 2;
        true
    }

    /// Blocks until the stream has enough leading bytes to feed the
    /// packager, the wait budget runs out, or cancellation.
    async fn wait_for_readiness(
        &self,
        stream_id: Uuid,
        selected: &SelectedFile,
        required_bytes: u64,
        cancel: &mut watch::Receiver<bool>,
    ) -> Readiness {
        let started = Instant::now();
        let half_wait = self.config.max_wait / 2;
        let threshold = readiness_threshold(required_bytes, selected.size);

        loop {
            if *cancel.borrow() {
                return Readiness::Cancelled;
            }

            // The watchdog may have declared the torrent dead meanwhile
            match self.registry.get(stream_id).await {
                Some(stream) if stream.status == StreamStatus::Error => return Readiness::Dead,
                Some(_) => {}
                None => return Readiness::Cancelled,
            }

            if let Some(progress) = self.acquirer.progress(stream_id).await {
                let _ = self.registry.update_progress(stream_id, progress).await;
            }

            let effective = self.acquirer.effective_file_bytes(stream_id).await;
            if selected.size > 0 && effective >= selected.size {
                debug!("Stream {}: file complete on disk", stream_id);
                return Readiness::Ready;
            }
            if effective >= threshold {
                debug!(
                    "Stream {}: {} bytes available (threshold {})",
                    stream_id, effective, threshold
                );
                return Readiness::Ready;
            }

            let elapsed = started.elapsed();
            if elapsed > self.config.max_wait {
                let stats = self.acquirer.swarm_stats(stream_id).await.unwrap_or_default();
                if stats.peers > 0 || stats.download_speed > 0.0 {
                    // The swarm is alive; proceed with whatever we have
                    return Readiness::Ready;
                }
                return Readiness::Dead;
            }
            if elapsed > half_wait && effective >= self.config.proceed_floor_bytes {
                debug!(
                    "Stream {}: proceeding early with {} bytes after {:?}",
                    stream_id, effective, elapsed
                );
                return Readiness::Ready;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = cancel.changed() => {}
            }
        }
    }

    /// Terminal failure: record the message, then release every resource
    /// the stream holds. The registry entry survives so clients polling
    /// the stream see the error.
    async fn fail_stream(&self, stream_id: Uuid, message: String) {
        let _ = self
            .registry
            .update_status(stream_id, StreamStatus::Error, Some(message))
            .await;

        self.packager.stop(stream_id).await;
        self.acquirer.cleanup(stream_id).await;
        if let Err(e) = self.paths.remove_stream_dirs(stream_id) {
            warn!("Stream {}: directory removal failed: {}", stream_id, e);
        }
        self.cancels.write().await.remove(&stream_id);
    }
}

enum Readiness {
    Ready,
    Dead,
    Cancelled,
}

/// Bytes required before the packager is started: the retry-scaled
/// requirement, capped by 1% of the file and by 1 MiB.
fn readiness_threshold(required_bytes: u64, file_size: u64) -> u64 {
    required_bytes
        .min((file_size / 100).max(1))
        .min(1024 * 1024)
}

/// Finds the selected file on disk. Engines differ in whether they place
/// it at the announced subpath or directly in the stream directory; the
/// last resort is a recursive scan for the basename or any video file.
fn resolve_input_path(download_dir: &Path, selected: &SelectedFile) -> Option<PathBuf> {
    let announced = download_dir.join(&selected.relative_path);
    if announced.is_file() {
        return Some(announced);
    }

    let flat = download_dir.join(&selected.name);
    if flat.is_file() {
        return Some(flat);
    }

    let mut by_name = None;
    let mut largest_video: Option<(u64, PathBuf)> = None;
    scan_tree(download_dir, &mut |path, size| {
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if file_name == selected.name {
            by_name = Some(path.to_path_buf());
        }
        if has_video_extension(file_name)
            && largest_video.as_ref().map(|(s, _)| size > *s).unwrap_or(true)
        {
            largest_video = Some((size, path.to_path_buf()));
        }
    });

    by_name.or(largest_video.map(|(_, path)| path))
}

fn scan_tree(dir: &Path, visit: &mut dyn FnMut(&Path, u64)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_tree(&path, visit);
        } else if let Ok(meta) = entry.metadata() {
            visit(&path, meta.len());
        }
    }
}

/// Container signatures checked in the first KiB of the input.
const SIGNATURES: &[(&str, &[u8], usize)] = &[
    ("mp4", b"ftyp", 4),
    ("matroska", &[0x1a, 0x45, 0xdf, 0xa3], 0),
    ("avi", b"RIFF", 0),
    ("flv", &[0x46, 0x4c, 0x56, 0x01], 0),
];

/// Sniffs the input's container signature. A mismatch is only a warning;
/// FFmpeg is the authority on whether the file is usable.
fn sniff_container(input: &Path) {
    let mut head = [0u8; 1024];
    let read = std::fs::File::open(input)
        .and_then(|mut f| {
            use std::io::Read;
            f.read(&mut head)
        })
        .unwrap_or(0);
    let head = &head[..read];

    let recognized = SIGNATURES.iter().find(|(_, magic, offset)| {
        head.len() >= offset + magic.len() && &head[*offset..offset + magic.len()] == *magic
    });

    match recognized {
        Some((container, _, _)) => {
            debug!("Input {} looks like {}", input.display(), container);
        }
        None => warn!(
            "Input {} has no recognized container signature",
            input.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_threshold_math() {
        // 2 MiB requirement against a large file: capped by 1 MiB
        assert_eq!(
            readiness_threshold(2 * 1024 * 1024, 4 * 1024 * 1024 * 1024),
            1024 * 1024
        );
        // Small file: 1% of 9 MiB wins
        assert_eq!(
            readiness_threshold(2 * 1024 * 1024, 9 * 1024 * 1024),
            9 * 1024 * 1024 / 100
        );
        // Tiny requirement wins over both caps
        assert_eq!(readiness_threshold(4096, 100 * 1024 * 1024), 4096);
        // Zero-length file still needs one byte
        assert_eq!(readiness_threshold(2 * 1024 * 1024, 0), 1);
    }

    #[test]
    fn test_resolve_input_prefers_announced_path() {
        let temp = tempfile::tempdir().unwrap();
        let selected = SelectedFile {
            index: 0,
            relative_path: PathBuf::from("Movie/movie.mkv"),
            name: "movie.mkv".to_string(),
            size: 100,
        };

        std::fs::create_dir_all(temp.path().join("Movie")).unwrap();
        std::fs::write(temp.path().join("Movie/movie.mkv"), b"data").unwrap();

        let resolved = resolve_input_path(temp.path(), &selected).unwrap();
        assert_eq!(resolved, temp.path().join("Movie/movie.mkv"));
    }

    #[test]
    fn test_resolve_input_falls_back_to_flat_layout() {
        let temp = tempfile::tempdir().unwrap();
        let selected = SelectedFile {
            index: 0,
            relative_path: PathBuf::from("Movie/movie.mkv"),
            name: "movie.mkv".to_string(),
            size: 100,
        };

        std::fs::write(temp.path().join("movie.mkv"), b"data").unwrap();

        let resolved = resolve_input_path(temp.path(), &selected).unwrap();
        assert_eq!(resolved, temp.path().join("movie.mkv"));
    }

    #[test]
    fn test_resolve_input_scans_for_renamed_video() {
        let temp = tempfile::tempdir().unwrap();
        let selected = SelectedFile {
            index: 0,
            relative_path: PathBuf::from("movie.mkv"),
            name: "movie.mkv".to_string(),
            size: 100,
        };

        // Engine wrote under a different tree and name
        std::fs::create_dir_all(temp.path().join("deep/nested")).unwrap();
        std::fs::write(temp.path().join("deep/nested/other.mp4"), vec![0u8; 64]).unwrap();
        std::fs::write(temp.path().join("deep/readme.txt"), b"not media").unwrap();

        let resolved = resolve_input_path(temp.path(), &selected).unwrap();
        assert_eq!(resolved, temp.path().join("deep/nested/other.mp4"));
    }

    #[test]
    fn test_resolve_input_none_when_empty() {
        let temp = tempfile::tempdir().unwrap();
        let selected = SelectedFile {
            index: 0,
            relative_path: PathBuf::from("movie.mkv"),
            name: "movie.mkv".to_string(),
            size: 100,
        };
        assert!(resolve_input_path(temp.path(), &selected).is_none());
    }

    #[test]
    fn test_sniff_accepts_unknown_without_panicking() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("odd.bin");
        std::fs::write(&path, b"????not a container").unwrap();
        sniff_container(&path);
        sniff_container(&temp.path().join("missing.mp4"));
    }
}
