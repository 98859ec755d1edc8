//! Router assembly and server bootstrap.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tracing::info;

use spindrift_core::config::SpindriftConfig;
use spindrift_core::coordinator::StreamCoordinator;
use spindrift_core::janitor::Janitor;
use spindrift_core::packager::segmenter::FfmpegSegmenter;
use spindrift_core::packager::HlsPackager;
use spindrift_core::paths::StreamPaths;
use spindrift_core::registry::StreamRegistry;
use spindrift_core::torrent::acquirer::TorrentAcquirer;
use spindrift_core::torrent::rqbit::RqbitEngine;

use crate::handlers::{create_stream, health, serve_hls_file, stream_playlist, stream_status};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// The stream coordinator; registry and paths are reached through it
    pub coordinator: StreamCoordinator,
}

/// Builds the gateway router over an already-wired coordinator.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/stream", post(create_stream))
        .route("/stream/{id}", get(stream_playlist))
        .route("/stream/{id}/status", get(stream_status))
        .route("/hls/{id}/{file}", get(serve_hls_file))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Wires the production components and serves the gateway until the
/// process ends.
///
/// # Errors
///
/// Returns an error when the engine, listener or server fail to start.
pub async fn run_server(config: SpindriftConfig) -> Result<(), Box<dyn std::error::Error>> {
    let registry = Arc::new(StreamRegistry::new());
    let paths = StreamPaths::new(config.paths.temp_root.clone());

    let engine = Arc::new(
        RqbitEngine::new(
            config.torrent.clone(),
            config.paths.temp_root.join("engine"),
        )
        .await?,
    );
    let acquirer = Arc::new(TorrentAcquirer::new(
        engine,
        Arc::clone(&registry),
        config.torrent.clone(),
    ));
    let packager = Arc::new(HlsPackager::new(
        Arc::new(FfmpegSegmenter::new(config.packager.clone())),
        Arc::clone(&registry),
        config.packager.clone(),
    ));
    let coordinator = StreamCoordinator::new(
        Arc::clone(&registry),
        paths,
        acquirer,
        packager,
        config.coordinator.clone(),
    );

    Janitor::new(
        Arc::clone(&registry),
        coordinator.clone(),
        config.janitor.clone(),
    )
    .spawn();

    let app = build_router(AppState { coordinator });

    let addr = format!("0.0.0.0:{}", config.http.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Spindrift gateway listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
