//! Logging bootstrap.
//!
//! Console output stays at the operator's chosen verbosity while a rolling
//! debug capture on disk records everything, so a failed stream can be
//! diagnosed after the fact without rerunning it at a noisier level.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{fmt, fs};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Console verbosity accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Failures only
    Error,
    /// Failures and recoverable oddities
    Warn,
    /// Stream lifecycle events (the default)
    Info,
    /// Per-poll and per-tick detail
    Debug,
    /// Everything, including engine chatter
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// The tracing level this verbosity maps to.
    pub fn as_level(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!(
                "unknown log level '{other}' (expected error, warn, info, debug or trace)"
            )),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directive())
    }
}

/// Name of the rolling debug capture inside the logs directory.
const DEBUG_LOG_NAME: &str = "spindrift-debug.log";

/// Installs the global subscriber: a compact console layer at `level`
/// (overridable through the `RUST_LOG` environment filter) and a
/// full-detail TRACE capture truncated and rewritten each run under
/// `logs_dir` (default `./logs`). Returns the capture path.
///
/// # Errors
///
/// Returns an error when the logs directory or capture file cannot be
/// created, or when a global subscriber is already installed.
pub fn init_tracing(
    level: LogLevel,
    logs_dir: Option<&Path>,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let dir = logs_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("logs"));
    fs::create_dir_all(&dir)?;

    let capture_path = dir.join(DEBUG_LOG_NAME);
    let capture = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&capture_path)?;

    let console_verbosity = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.directive()));

    tracing_subscriber::registry()
        .with(
            // The capture gets everything, with enough context to follow a
            // single stream across tasks
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(capture)
                .with_filter(EnvFilter::new(LogLevel::Trace.directive())),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_filter(console_verbosity),
        )
        .try_init()?;

    tracing::debug!(capture = %capture_path.display(), "logging installed");
    Ok(capture_path)
}
