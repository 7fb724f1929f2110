//! HTTP server for Torrest
//!
//! Builds the router over a running session and serves it until the shared
//! shutdown context fires.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use torrest_core::{Session, Shutdown};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers::{
    add_file, add_uri, download_file, file_info, file_status, get_settings, pause_session,
    pause_torrent, remove_torrent, resume_session, resume_torrent, session_info, session_status,
    set_settings, shutdown, stop_file, stream_file, stream_file_head, torrent_files, torrent_info,
    torrent_status, torrents,
};

/// Upper bound for `.torrent` downloads started by `/service/add/uri`.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<Session>,
    pub shutdown: Shutdown,
    pub http: reqwest::Client,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(session: Arc<Session>, shutdown: Shutdown) -> Self {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            session,
            shutdown,
            http,
            started_at: Utc::now(),
        }
    }
}

/// Errors that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Router with every API route.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(session_status))
        .route("/pause", get(pause_session))
        .route("/resume", get(resume_session))
        .route("/info", get(session_info))
        .route("/shutdown", get(shutdown))
        .route("/service/add/uri", get(add_uri))
        .route("/service/add/file", post(add_file))
        .route("/settings/get", get(get_settings))
        .route("/settings/set", post(set_settings))
        .route("/torrents", get(torrents))
        .route("/torrents/{hash}/info", get(torrent_info))
        .route("/torrents/{hash}/status", get(torrent_status))
        .route("/torrents/{hash}/files", get(torrent_files))
        .route("/torrents/{hash}/pause", get(pause_torrent))
        .route("/torrents/{hash}/resume", get(resume_torrent))
        .route("/torrents/{hash}/remove", get(remove_torrent))
        .route("/torrents/{hash}/files/{index}/download", get(download_file))
        .route("/torrents/{hash}/files/{index}/stop", get(stop_file))
        .route("/torrents/{hash}/files/{index}/info", get(file_info))
        .route("/torrents/{hash}/files/{index}/status", get(file_status))
        .route(
            "/torrents/{hash}/files/{index}/stream/{name}",
            get(stream_file).head(stream_file_head),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the API on `addr` until the shutdown context is triggered.
///
/// # Errors
///
/// - `ServerError::Bind` - The address could not be bound
/// - `ServerError::Io` - The server failed while running
pub async fn run_server(state: AppState, addr: SocketAddr) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(addr = %listener.local_addr()?, "Torrest server listening");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Torrest server stopped");
    Ok(())
}
