//! Video file selection policy.
//!
//! Given the files a torrent announces, picks the one the stream will play:
//! a real video container, not a sample or extra, and the largest candidate
//! that survives the filters.

use super::TorrentError;
use super::engine::TorrentFileInfo;

/// Extensions (lowercase, no dot) recognized as video containers.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v", "ts", "mts", "m2ts",
];

/// Basename markers (case-insensitive) that identify non-feature files.
const SAMPLE_MARKERS: &[&str] = &[
    "sample", "trailer", "preview", "extra", "bonus", "behind", "making",
];

/// Files at least this large are preferred outright.
pub const MIN_PREFERRED_BYTES: u64 = 10 * 1024 * 1024;

/// Whether `name` carries a recognized video extension.
pub fn has_video_extension(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| {
            let ext = ext.to_ascii_lowercase();
            VIDEO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn is_sample_like(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SAMPLE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Selects the video file a stream should play.
///
/// Policy: keep files with a video extension, drop sample-like basenames,
/// prefer files of at least [`MIN_PREFERRED_BYTES`] (falling back to the
/// largest remaining candidate when none qualify), and pick the largest.
///
/// # Errors
///
/// - `TorrentError::NoMedia` - no file survives the filters
pub fn select_video_file(files: &[TorrentFileInfo]) -> Result<&TorrentFileInfo, TorrentError> {
    let mut candidates: Vec<&TorrentFileInfo> = files
        .iter()
        .filter(|f| has_video_extension(f.file_name()))
        .filter(|f| !is_sample_like(f.file_name()))
        .collect();

    if candidates.is_empty() {
        return Err(TorrentError::NoMedia);
    }

    let preferred: Vec<&TorrentFileInfo> = candidates
        .iter()
        .copied()
        .filter(|f| f.size >= MIN_PREFERRED_BYTES)
        .collect();
    if !preferred.is_empty() {
        candidates = preferred;
    }

    candidates.sort_by(|a, b| b.size.cmp(&a.size));
    candidates.into_iter().next().ok_or(TorrentError::NoMedia)
}
