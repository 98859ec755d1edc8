//! Centralized configuration for Spindrift.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Spindrift components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct SpindriftConfig {
    /// Filesystem layout settings
    pub paths: PathConfig,
    /// Swarm engine settings
    pub torrent: TorrentConfig,
    /// FFmpeg/HLS packager settings
    pub packager: PackagerConfig,
    /// Stream orchestration settings
    pub coordinator: CoordinatorConfig,
    /// Disk-sweep janitor settings
    pub janitor: JanitorConfig,
    /// HTTP listener settings
    pub http: HttpConfig,
}

/// Filesystem layout configuration.
///
/// Controls where per-stream download and HLS output trees are rooted.
#[derive(Debug, Clone)]
pub struct PathConfig {
    /// Root temporary directory; streams/ and hls/ live beneath it
    pub temp_root: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            temp_root: PathBuf::from("./temp"),
        }
    }
}

/// Swarm engine and peer discovery configuration.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Deterministic BitTorrent listen port
    pub bt_port: u16,
    /// Deterministic DHT port
    pub dht_port: u16,
    /// Maximum peer connections on the default profile
    pub max_peer_connections: usize,
    /// Maximum peer connections on the aggressive profile
    pub max_peer_connections_aggressive: usize,
    /// Whether the aggressive profile is active
    pub aggressive_profile: bool,
    /// Curated fallback trackers appended to those in the magnet URI
    pub fallback_trackers: Vec<String>,
    /// Known DHT bootstrap nodes injected when peer discovery stalls
    pub dht_bootstrap_nodes: Vec<String>,
    /// Tracker announce timeout
    pub announce_timeout: Duration,
    /// DHT announce timeout
    pub dht_timeout: Duration,
    /// How long the acquirer waits for torrent metadata before giving up
    pub metadata_timeout: Duration,
    /// Watchdog tick interval
    pub watchdog_interval: Duration,
    /// Stalled ticks before a pause/resume recovery attempt
    pub stall_recovery_ticks: u32,
    /// Stalled ticks with zero peers before the torrent is declared dead
    pub stall_dead_ticks: u32,
    /// Delay before peer discovery recovery kicks in
    pub peer_recovery_delay: Duration,
    /// Interval between recovery re-announces
    pub peer_recovery_interval: Duration,
    /// Maximum recovery re-announce attempts
    pub peer_recovery_attempts: u32,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            bt_port: 6881,
            dht_port: 6882,
            max_peer_connections: 100,
            max_peer_connections_aggressive: 200,
            aggressive_profile: false,
            fallback_trackers: vec![
                // UDP public trackers preferred, HTTP as backup
                "udp://tracker.opentrackr.org:1337/announce".to_string(),
                "udp://open.tracker.cl:1337/announce".to_string(),
                "udp://tracker.torrent.eu.org:451/announce".to_string(),
                "udp://exodus.desync.com:6969/announce".to_string(),
                "http://tracker.opentrackr.org:1337/announce".to_string(),
            ],
            dht_bootstrap_nodes: vec![
                "router.bittorrent.com:6881".to_string(),
                "dht.transmissionbt.com:6881".to_string(),
                "router.utorrent.com:6881".to_string(),
            ],
            announce_timeout: Duration::from_secs(10),
            dht_timeout: Duration::from_secs(5),
            metadata_timeout: Duration::from_secs(45),
            watchdog_interval: Duration::from_secs(10),
            stall_recovery_ticks: 3,
            stall_dead_ticks: 6,
            peer_recovery_delay: Duration::from_secs(5),
            peer_recovery_interval: Duration::from_secs(10),
            peer_recovery_attempts: 5,
        }
    }
}

impl TorrentConfig {
    /// Peer connection limit for the active profile.
    pub fn effective_peer_limit(&self) -> usize {
        if self.aggressive_profile {
            self.max_peer_connections_aggressive
        } else {
            self.max_peer_connections
        }
    }
}

/// FFmpeg invocation and HLS segmentation configuration.
#[derive(Debug, Clone)]
pub struct PackagerConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_path: PathBuf,
    /// Path to the ffprobe binary used for duration estimation
    pub ffprobe_path: PathBuf,
    /// Target segment duration in seconds
    pub segment_seconds: u32,
    /// Rolling playlist window in segments
    pub playlist_window: u32,
    /// x264 preset for the re-encode fallback
    pub reencode_preset: String,
    /// x264 CRF for the re-encode fallback
    pub reencode_crf: u32,
    /// Packager progress percentage at which a stream is declared playable
    pub ready_percent: f64,
    /// Minimum input bytes before FFmpeg is even attempted
    pub min_input_bytes: u64,
    /// Start directly in re-encode mode, skipping stream copy entirely
    pub force_reencode: bool,
}

impl Default for PackagerConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            segment_seconds: 10,
            playlist_window: 6,
            reencode_preset: "ultrafast".to_string(),
            reencode_crf: 28,
            ready_percent: 10.0,
            min_input_bytes: 64 * 1024,
            force_reencode: false,
        }
    }
}

/// Stream orchestration configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Total readiness wait budget before a stream is declared dead
    pub max_wait: Duration,
    /// Poll interval of the readiness loop
    pub poll_interval: Duration,
    /// Initial required-bytes threshold of the readiness predicate
    pub required_bytes: u64,
    /// Absolute floor of bytes needed to limp forward after half the wait
    pub proceed_floor_bytes: u64,
    /// Maximum packager attempts per stream
    pub max_convert_attempts: u32,
    /// Delay before the first file-not-ready retry
    pub first_retry_delay: Duration,
    /// Delay before subsequent file-not-ready retries
    pub retry_delay: Duration,
    /// Concurrent orchestration bound; creation always succeeds, the
    /// orchestration task queues on a permit
    pub max_concurrent_streams: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            required_bytes: 2 * 1024 * 1024,
            proceed_floor_bytes: 50 * 1024,
            max_convert_attempts: 3,
            first_retry_delay: Duration::from_secs(10),
            retry_delay: Duration::from_secs(15),
            max_concurrent_streams: 4,
        }
    }
}

/// Disk-sweep janitor configuration.
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Interval between sweeps
    pub sweep_interval: Duration,
    /// Idle age beyond which an inactive stream is swept
    pub max_age: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(600),
            max_age: Duration::from_secs(1800),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// TCP port the gateway listens on
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

impl SpindriftConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// `SPINDRIFT_ENV=production` switches the temp root to the container
    /// path `/app/temp`; `PORT`, `SPINDRIFT_MAX_STREAMS`,
    /// `SPINDRIFT_AGGRESSIVE` and `SPINDRIFT_TEMP_ROOT` override their
    /// respective settings.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if std::env::var("SPINDRIFT_ENV").as_deref() == Ok("production") {
            config.paths.temp_root = PathBuf::from("/app/temp");
        }

        if let Ok(root) = std::env::var("SPINDRIFT_TEMP_ROOT") {
            config.paths.temp_root = PathBuf::from(root);
        }

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.http.port = port;
            }
        }

        if let Ok(max) = std::env::var("SPINDRIFT_MAX_STREAMS") {
            if let Ok(max) = max.parse::<usize>() {
                config.coordinator.max_concurrent_streams = max;
            }
        }

        if let Ok(aggressive) = std::env::var("SPINDRIFT_AGGRESSIVE") {
            config.torrent.aggressive_profile = aggressive.parse().unwrap_or(false);
        }

        config
    }

    /// Creates a configuration optimized for tests: short waits, a
    /// caller-supplied temp root, tiny byte thresholds.
    pub fn for_testing(temp_root: PathBuf) -> Self {
        let mut config = Self::default();
        config.paths.temp_root = temp_root;
        config.coordinator.max_wait = Duration::from_millis(800);
        config.coordinator.poll_interval = Duration::from_millis(20);
        config.coordinator.required_bytes = 8 * 1024;
        config.coordinator.proceed_floor_bytes = 1024;
        config.coordinator.first_retry_delay = Duration::from_millis(30);
        config.coordinator.retry_delay = Duration::from_millis(30);
        config.packager.min_input_bytes = 1024;
        config.torrent.watchdog_interval = Duration::from_millis(50);
        config.torrent.metadata_timeout = Duration::from_millis(500);
        config.torrent.peer_recovery_delay = Duration::from_millis(50);
        config.torrent.peer_recovery_interval = Duration::from_millis(50);
        config.janitor.sweep_interval = Duration::from_millis(100);
        config
    }
}
