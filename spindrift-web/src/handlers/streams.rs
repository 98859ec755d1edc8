//! Stream lifecycle endpoints: creation, status polling, playlist gating.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use spindrift_core::registry::{Stream, StreamStatus};

use crate::server::AppState;

/// Body of `POST /stream`.
#[derive(Debug, Deserialize)]
pub struct CreateStreamRequest {
    /// The magnet link to acquire and repackage
    #[serde(rename = "magnetUrl")]
    pub magnet_url: Option<String>,
}

/// Response of `POST /stream`.
#[derive(Debug, Serialize)]
pub struct CreateStreamResponse {
    /// The new stream's ID
    #[serde(rename = "streamId")]
    pub stream_id: Uuid,
    /// Status at creation time
    pub status: StreamStatus,
    /// Where the playlist will be served
    #[serde(rename = "hlsUrl")]
    pub hls_url: String,
    /// Where to poll for progress
    #[serde(rename = "statusUrl")]
    pub status_url: String,
}

/// Response of `GET /stream/:id/status`.
#[derive(Debug, Serialize)]
pub struct StreamStatusResponse {
    /// The stream's ID
    #[serde(rename = "streamId")]
    pub stream_id: Uuid,
    /// Current lifecycle state
    pub status: StreamStatus,
    /// Overall download percentage in [0, 100]
    pub progress: f64,
    /// Failure message once status is `error`
    pub error: Option<String>,
    /// Creation time, unix milliseconds
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    /// Last update time, unix milliseconds
    #[serde(rename = "updatedAt")]
    pub updated_at: u64,
}

impl StreamStatusResponse {
    fn from_stream(stream: &Stream) -> Self {
        Self {
            stream_id: stream.id,
            status: stream.status,
            progress: stream.progress,
            error: stream.error.clone(),
            created_at: unix_millis(stream.created_at),
            updated_at: unix_millis(stream.updated_at),
        }
    }
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `POST /stream` — create a stream from a magnet link.
///
/// Creation never fails asynchronously: a valid magnet always yields `200`
/// with an ID to poll, even when the stream later dies.
///
/// # Errors
///
/// `400` with a JSON error body when the magnet is missing or malformed.
pub async fn create_stream(
    State(state): State<AppState>,
    Json(request): Json<CreateStreamRequest>,
) -> Result<Json<CreateStreamResponse>, (StatusCode, Json<serde_json::Value>)> {
    let Some(magnet_url) = request.magnet_url.filter(|m| !m.trim().is_empty()) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "magnetUrl is required" })),
        ));
    };

    let ticket = state
        .coordinator
        .create_stream(&magnet_url)
        .await
        .map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.user_message() })),
            )
        })?;

    debug!("Created stream {} via HTTP", ticket.id);
    Ok(Json(CreateStreamResponse {
        stream_id: ticket.id,
        status: ticket.status,
        hls_url: format!("/stream/{}", ticket.id),
        status_url: format!("/stream/{}/status", ticket.id),
    }))
}

/// `GET /stream/:id/status` — progress polling. Also serves as the
/// stream's keep-alive touch.
///
/// # Errors
///
/// `400` for a malformed stream ID, `404` for an unknown one.
pub async fn stream_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StreamStatusResponse>, StatusCode> {
    let id = parse_stream_id(&id)?;

    let stream = state
        .coordinator
        .registry()
        .get(id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    state.coordinator.keep_alive(id).await;

    Ok(Json(StreamStatusResponse::from_stream(&stream)))
}

/// `GET /stream/:id` — the playlist once the stream is `ready`, `202` with
/// progress while it is still coming up, `404` for unknown streams.
///
/// # Errors
///
/// `400` for a malformed stream ID, `404` for unknown or errored streams.
pub async fn stream_playlist(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, StatusCode> {
    let id = parse_stream_id(&id)?;

    let stream = state
        .coordinator
        .registry()
        .get(id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    state.coordinator.keep_alive(id).await;

    match stream.status {
        StreamStatus::Ready => {
            let playlist = tokio::fs::read(state.coordinator.paths().playlist_path(id))
                .await
                .map_err(|_| StatusCode::NOT_FOUND)?;

            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/vnd.apple.mpegurl")
                .header("Cache-Control", "no-cache")
                .body(axum::body::Body::from(playlist))
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
        }
        StreamStatus::Error => Err(StatusCode::NOT_FOUND),
        status => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "status": status,
                "progress": stream.progress,
                "message": "stream is not ready yet",
            })),
        )
            .into_response()),
    }
}

/// `GET /health` — liveness.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "OK",
        "timestamp": unix_millis(SystemTime::now()),
    }))
}

pub(crate) fn parse_stream_id(raw: &str) -> Result<Uuid, StatusCode> {
    Uuid::parse_str(raw).map_err(|_| StatusCode::BAD_REQUEST)
}
