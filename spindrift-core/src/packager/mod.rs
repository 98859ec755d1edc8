//! HLS packaging: a supervised FFmpeg child per stream.
//!
//! The packager turns a (possibly still-downloading) video file into a
//! rolling HLS playlist plus MPEG-TS segments. FFmpeg sits behind the
//! [`Segmenter`] seam so the supervisor, fallback and progress logic run
//! identically against the real binary and the test segmenter.

pub mod segmenter;
pub mod supervisor;

pub use segmenter::{FfmpegSegmenter, SegmentSpec, Segmenter, SimSegmenter};
pub use supervisor::HlsPackager;

/// How FFmpeg treats the media streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionMode {
    /// Repackage without re-encoding (`-c copy`)
    StreamCopy,
    /// Decode and re-encode to H.264/AAC
    ReEncode,
}

/// Events a segmenter run emits while the child is alive.
#[derive(Debug, Clone)]
pub enum PackagerEvent {
    /// The child process started
    Started,
    /// Periodic progress. `percent` is absent when the input duration is
    /// unknown; `frames` is the count processed so far.
    Progress {
        /// Estimated completion percentage, when duration is known
        percent: Option<f64>,
        /// Frames processed so far
        frames: u64,
    },
    /// The input reached EOF and the last segment was flushed
    Completed,
}

/// Packager failure kinds.
///
/// `FileNotReady` and `Codec` are recoverable — the coordinator retries
/// the former and the supervisor falls back to re-encode on the latter;
/// everything else is fatal for the stream.
#[derive(Debug, thiserror::Error)]
pub enum PackagerError {
    /// The input is absent or too small to feed FFmpeg yet
    #[error("input not ready: {reason}")]
    FileNotReady {
        /// Why the input was rejected
        reason: String,
    },

    /// FFmpeg rejected the codec or container; re-encode may succeed
    #[error("codec error: {reason}")]
    Codec {
        /// FFmpeg's complaint
        reason: String,
    },

    /// Unrecoverable packager failure
    #[error("conversion failed: {reason}")]
    Fatal {
        /// FFmpeg's complaint or the supervision failure
        reason: String,
    },

    /// Filesystem error around the child process
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PackagerError {
    /// Short message for the status API.
    pub fn user_message(&self) -> String {
        match self {
            PackagerError::FileNotReady { .. } => {
                "video file never became ready for conversion".to_string()
            }
            PackagerError::Codec { .. } => "video format could not be converted".to_string(),
            PackagerError::Fatal { .. } => "video conversion failed".to_string(),
            PackagerError::Io(_) => "file system error occurred".to_string(),
        }
    }
}

/// Maps an FFmpeg failure to a packager error kind from its stderr text.
///
/// The substring heuristic is fragile across FFmpeg versions; it is kept
/// in this one function so an exit-signature table can replace it later.
pub fn classify_failure(stderr: &str) -> PackagerError {
    let lower = stderr.to_ascii_lowercase();
    let reason = last_line(stderr);

    if lower.contains("invalid data") || lower.contains("error opening input") {
        return PackagerError::FileNotReady { reason };
    }
    if lower.contains("codec") || lower.contains("format") {
        return PackagerError::Codec { reason };
    }
    PackagerError::Fatal { reason }
}

fn last_line(stderr: &str) -> String {
    let line = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("ffmpeg exited with an error")
        .trim();
    let mut line = line.to_string();
    line.truncate(200);
    line
}
