//! HTTP Range request handling for segment serving.
//!
//! Implements RFC 7233 byte ranges with proper Content-Range and partial
//! content responses, so players can replay and seek within segments.

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;

/// Parse an HTTP Range header into (start, end, content_length).
///
/// Handles the standard `bytes=start-end` form, including the open-ended
/// `bytes=start-` variant. Returns the full range when the header is
/// missing or malformed.
pub fn parse_range_header(range: &str, total_size: u64) -> (u64, u64, u64) {
    if !range.starts_with("bytes=") {
        return (0, total_size.saturating_sub(1), total_size);
    }

    let range_spec = &range[6..];
    if let Some((start_str, end_str)) = range_spec.split_once('-') {
        let start = start_str.parse::<u64>().unwrap_or(0);
        let end = if end_str.is_empty() {
            total_size.saturating_sub(1)
        } else {
            end_str
                .parse::<u64>()
                .unwrap_or(total_size.saturating_sub(1))
        };
        let content_length = end.saturating_sub(start) + 1;
        (start, end, content_length)
    } else {
        (0, total_size.saturating_sub(1), total_size)
    }
}

/// Validate range bounds against the bytes actually available.
///
/// Returns the clamped `(start, end, length)` triple that is safe to serve.
///
/// # Errors
///
/// Returns `RANGE_NOT_SATISFIABLE` when the start position lies beyond the
/// available size.
pub fn validate_range_bounds(
    start: u64,
    end: u64,
    available_size: u64,
) -> Result<(u64, u64, u64), StatusCode> {
    if start >= available_size && available_size > 0 {
        return Err(StatusCode::RANGE_NOT_SATISFIABLE);
    }
    if available_size == 0 {
        return Err(StatusCode::RANGE_NOT_SATISFIABLE);
    }

    let safe_end = end.min(available_size.saturating_sub(1));
    let safe_length = safe_end.saturating_sub(start) + 1;

    Ok((start, safe_end, safe_length))
}

/// Extract the Range header value, if any.
pub fn extract_range_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("range")
        .and_then(|range| range.to_str().ok())
        .map(|s| s.to_string())
}

/// Build the response for a (possibly ranged) file request.
///
/// Adds `Accept-Ranges`, `Content-Length` and, for range requests, a `206`
/// status with `Content-Range`.
///
/// # Errors
///
/// Returns `INTERNAL_SERVER_ERROR` if response construction fails.
pub fn build_range_response(
    is_range_request: bool,
    data: Vec<u8>,
    content_type: &str,
    cache_control: &str,
    start: u64,
    end: u64,
    total_size: u64,
) -> Result<Response<Body>, StatusCode> {
    let mut response = Response::builder()
        .header("Content-Type", content_type)
        .header("Accept-Ranges", "bytes")
        .header("Content-Length", data.len().to_string())
        .header("Cache-Control", cache_control);

    if is_range_request {
        response = response
            .status(StatusCode::PARTIAL_CONTENT)
            .header("Content-Range", format!("bytes {start}-{end}/{total_size}"));
    } else {
        response = response.status(StatusCode::OK);
    }

    response
        .body(Body::from(data))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
