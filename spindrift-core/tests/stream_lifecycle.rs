//! End-to-end coordinator scenarios over the simulation engine and
//! segmenter: real bytes on disk, real playlist and segments, no network
//! and no FFmpeg binary.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use spindrift_core::config::SpindriftConfig;
use spindrift_core::coordinator::StreamCoordinator;
use spindrift_core::packager::segmenter::SimSegmenter;
use spindrift_core::packager::{HlsPackager, PackagerError};
use spindrift_core::paths::StreamPaths;
use spindrift_core::registry::{StreamRegistry, StreamStatus};
use spindrift_core::torrent::TorrentError;
use spindrift_core::torrent::acquirer::TorrentAcquirer;
use spindrift_core::torrent::sim::{SimSwarmEngine, SimTorrentSpec};
use spindrift_core::SpindriftError;
use uuid::Uuid;

const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";

struct World {
    registry: Arc<StreamRegistry>,
    coordinator: StreamCoordinator,
    paths: StreamPaths,
}

fn build_world(temp: &Path, spec: SimTorrentSpec, segmenter: SimSegmenter) -> World {
    let config = SpindriftConfig::for_testing(temp.to_path_buf());
    let registry = Arc::new(StreamRegistry::new());
    let paths = StreamPaths::new(temp);
    let acquirer = Arc::new(TorrentAcquirer::new(
        Arc::new(SimSwarmEngine::new(spec)),
        Arc::clone(&registry),
        config.torrent.clone(),
    ));
    let packager = Arc::new(HlsPackager::new(
        Arc::new(segmenter),
        Arc::clone(&registry),
        config.packager.clone(),
    ));
    let coordinator = StreamCoordinator::new(
        Arc::clone(&registry),
        paths.clone(),
        acquirer,
        packager,
        config.coordinator.clone(),
    );

    World {
        registry,
        coordinator,
        paths,
    }
}

/// Polls the stream until it reaches `target`, recording every status seen
/// along the way. Panics after `timeout`.
async fn await_status(
    world: &World,
    id: Uuid,
    target: StreamStatus,
    timeout: Duration,
) -> Vec<StreamStatus> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut seen = Vec::new();

    loop {
        if let Some(stream) = world.registry.get(id).await {
            if seen.last() != Some(&stream.status) {
                seen.push(stream.status);
            }
            if stream.status == target {
                return seen;
            }
            if stream.status == StreamStatus::Error && target != StreamStatus::Error {
                panic!(
                    "stream failed instead of reaching {target:?}: {:?}",
                    stream.error
                );
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("stream never reached {target:?}; observed {seen:?}");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn happy_path_reaches_ready_with_playable_output() {
    let temp = tempfile::tempdir().unwrap();
    let world = build_world(
        temp.path(),
        SimTorrentSpec::single_video("movie.mp4", 256 * 1024),
        SimSegmenter::new(),
    );

    let ticket = world.coordinator.create_stream(MAGNET).await.unwrap();
    assert_eq!(ticket.status, StreamStatus::Initializing);

    await_status(&world, ticket.id, StreamStatus::Ready, Duration::from_secs(5)).await;

    let stream = world.registry.get(ticket.id).await.unwrap();
    assert_eq!(stream.progress, 100.0);
    assert!(stream.error.is_none());

    let playlist = std::fs::read_to_string(world.paths.playlist_path(ticket.id)).unwrap();
    assert!(playlist.starts_with("#EXTM3U"));

    let segment = std::fs::read(world.paths.segment_path(ticket.id, 0)).unwrap();
    assert_eq!(segment[0], 0x47, "MPEG-TS sync byte expected");
}

#[tokio::test]
async fn file_not_ready_retries_through_waiting_for_data() {
    let temp = tempfile::tempdir().unwrap();
    let world = build_world(
        temp.path(),
        SimTorrentSpec::single_video("movie.mkv", 256 * 1024),
        SimSegmenter::new().failing_with(PackagerError::FileNotReady {
            reason: "moov atom not yet present".to_string(),
        }),
    );

    let ticket = world.coordinator.create_stream(MAGNET).await.unwrap();
    let seen = await_status(&world, ticket.id, StreamStatus::Ready, Duration::from_secs(5)).await;

    assert!(
        seen.contains(&StreamStatus::WaitingForData),
        "expected a waiting_for_data transition, observed {seen:?}"
    );
}

#[tokio::test]
async fn dead_torrent_fails_with_message_and_removes_directories() {
    let temp = tempfile::tempdir().unwrap();
    let world = build_world(
        temp.path(),
        SimTorrentSpec::single_video("movie.mp4", 256 * 1024).dead(),
        SimSegmenter::new(),
    );

    let ticket = world.coordinator.create_stream(MAGNET).await.unwrap();
    await_status(&world, ticket.id, StreamStatus::Error, Duration::from_secs(5)).await;

    let stream = world.registry.get(ticket.id).await.unwrap();
    let message = stream.error.unwrap();
    assert!(
        message.contains("dead") || message.contains("no peers"),
        "unexpected message: {message}"
    );

    // Resources are gone; only the registry entry survives for polling
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!world.paths.stream_dir(ticket.id).exists());
    assert!(!world.paths.hls_dir(ticket.id).exists());
}

#[tokio::test]
async fn exhausted_retries_promote_to_error() {
    let temp = tempfile::tempdir().unwrap();
    let world = build_world(
        temp.path(),
        SimTorrentSpec::single_video("movie.mp4", 256 * 1024),
        SimSegmenter::new()
            .failing_with(PackagerError::FileNotReady {
                reason: "first".to_string(),
            })
            .failing_with(PackagerError::FileNotReady {
                reason: "second".to_string(),
            })
            .failing_with(PackagerError::FileNotReady {
                reason: "third".to_string(),
            }),
    );

    let ticket = world.coordinator.create_stream(MAGNET).await.unwrap();
    await_status(&world, ticket.id, StreamStatus::Error, Duration::from_secs(5)).await;

    let stream = world.registry.get(ticket.id).await.unwrap();
    assert!(stream.error.unwrap().contains("never became ready"));
}

#[tokio::test]
async fn no_media_torrent_fails_cleanly() {
    let temp = tempfile::tempdir().unwrap();
    let mut spec = SimTorrentSpec::single_video("movie.mp4", 64 * 1024);
    spec.files[0].path = "archive.zip".into();
    let world = build_world(temp.path(), spec, SimSegmenter::new());

    let ticket = world.coordinator.create_stream(MAGNET).await.unwrap();
    await_status(&world, ticket.id, StreamStatus::Error, Duration::from_secs(5)).await;

    let stream = world.registry.get(ticket.id).await.unwrap();
    assert!(stream.error.unwrap().contains("no suitable video file"));
}

#[tokio::test]
async fn invalid_magnet_is_rejected_synchronously() {
    let temp = tempfile::tempdir().unwrap();
    let world = build_world(
        temp.path(),
        SimTorrentSpec::single_video("movie.mp4", 64 * 1024),
        SimSegmenter::new(),
    );

    let result = world.coordinator.create_stream("not a magnet").await;
    assert!(matches!(
        result,
        Err(SpindriftError::Torrent(TorrentError::InvalidMagnet { .. }))
    ));
    assert!(world.registry.is_empty().await);
}

#[tokio::test]
async fn cleanup_is_idempotent_and_leaves_nothing_behind() {
    let temp = tempfile::tempdir().unwrap();
    let world = build_world(
        temp.path(),
        SimTorrentSpec::single_video("movie.mp4", 128 * 1024),
        SimSegmenter::new(),
    );

    let ticket = world.coordinator.create_stream(MAGNET).await.unwrap();
    await_status(&world, ticket.id, StreamStatus::Ready, Duration::from_secs(5)).await;

    world.coordinator.cleanup(ticket.id).await;
    world.coordinator.cleanup(ticket.id).await;

    assert!(world.registry.get(ticket.id).await.is_none());
    assert!(!world.paths.stream_dir(ticket.id).exists());
    assert!(!world.paths.hls_dir(ticket.id).exists());
}

#[tokio::test]
async fn cancellation_mid_download_tears_down_promptly() {
    let temp = tempfile::tempdir().unwrap();
    // Slow swarm so cleanup lands during the download phase
    let mut spec = SimTorrentSpec::single_video("movie.mp4", 10 * 1024 * 1024);
    spec.bytes_per_tick = 512;
    spec.tick = Duration::from_millis(20);
    let world = build_world(temp.path(), spec, SimSegmenter::new());

    let ticket = world.coordinator.create_stream(MAGNET).await.unwrap();
    await_status(
        &world,
        ticket.id,
        StreamStatus::Downloading,
        Duration::from_secs(5),
    )
    .await;

    world.coordinator.cleanup(ticket.id).await;

    assert!(world.registry.get(ticket.id).await.is_none());
    assert!(!world.paths.stream_dir(ticket.id).exists());
    assert!(!world.paths.hls_dir(ticket.id).exists());
}
