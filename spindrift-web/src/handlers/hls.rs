//! Range-aware serving of playlist and segment files from a stream's HLS
//! directory.

use std::io::SeekFrom;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use super::range::{
    build_range_response, extract_range_header, parse_range_header, validate_range_bounds,
};
use super::streams::parse_stream_id;
use crate::server::AppState;

/// `GET /hls/:id/:file` — serves any file inside the stream's HLS
/// directory, honouring `Range` requests. Segments are immutable and
/// cached aggressively; playlists roll and are never cached.
///
/// # Errors
///
/// `400` for a malformed stream ID, `404` for unknown streams, unsafe
/// names or missing files, `416` for ranges past the end of the file.
pub async fn serve_hls_file(
    State(state): State<AppState>,
    Path((id, file)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    let id = parse_stream_id(&id)?;

    if !is_safe_file_name(&file) {
        return Err(StatusCode::NOT_FOUND);
    }

    // Unknown (or already swept) streams 404 before touching the disk
    state
        .coordinator
        .registry()
        .get(id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    state.coordinator.keep_alive(id).await;

    let path = state.coordinator.paths().hls_dir(id).join(&file);
    let mut handle = tokio::fs::File::open(&path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let total_size = handle
        .metadata()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .len();

    let range_header = extract_range_header(&headers);
    let is_range_request = range_header.is_some();
    let (start, end, _) = match &range_header {
        Some(range) => parse_range_header(range, total_size),
        None => (0, total_size.saturating_sub(1), total_size),
    };
    let (start, end, length) = validate_range_bounds(start, end, total_size)?;

    handle
        .seek(SeekFrom::Start(start))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let mut data = vec![0u8; length as usize];
    handle
        .read_exact(&mut data)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    debug!(
        "Serving {} bytes {}-{}/{} (range={})",
        file, start, end, total_size, is_range_request
    );

    build_range_response(
        is_range_request,
        data,
        content_type_for(&file),
        cache_control_for(&file),
        start,
        end,
        total_size,
    )
}

/// Rejects anything that could escape the stream's HLS directory.
fn is_safe_file_name(file: &str) -> bool {
    !file.is_empty()
        && !file.contains('/')
        && !file.contains('\\')
        && !file.contains("..")
        && !file.starts_with('.')
}

fn content_type_for(file: &str) -> &'static str {
    if file.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if file.ends_with(".ts") {
        "video/mp2t"
    } else {
        "application/octet-stream"
    }
}

fn cache_control_for(file: &str) -> &'static str {
    if file.ends_with(".m3u8") {
        // Rolling playlists must always be re-fetched
        "no-cache"
    } else {
        // Segments never change once written
        "public, max-age=31536000"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_file_names() {
        assert!(is_safe_file_name("playlist.m3u8"));
        assert!(is_safe_file_name("segment003.ts"));

        assert!(!is_safe_file_name("../secret"));
        assert!(!is_safe_file_name("a/b.ts"));
        assert!(!is_safe_file_name("a\\b.ts"));
        assert!(!is_safe_file_name(".hidden"));
        assert!(!is_safe_file_name(""));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("playlist.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for("segment000.ts"), "video/mp2t");
        assert_eq!(content_type_for("stray.bin"), "application/octet-stream");
    }

    #[test]
    fn test_cache_policies() {
        assert_eq!(cache_control_for("playlist.m3u8"), "no-cache");
        assert_eq!(cache_control_for("segment000.ts"), "public, max-age=31536000");
    }
}
