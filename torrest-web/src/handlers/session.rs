//! Session-wide endpoints: status, pause, adding torrents and shutdown.

use axum::Json;
use axum::extract::{Multipart, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};
use torrest_core::StorageType;
use torrest_core::torrent::Torrent;
use tracing::{debug, info};
use url::Url;

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct AddUriQuery {
    #[serde(default)]
    pub uri: String,
    pub storage: Option<String>,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddFileQuery {
    pub storage: Option<String>,
    #[serde(default)]
    pub paused: bool,
}

fn parse_storage(value: Option<&str>) -> ApiResult<StorageType> {
    value
        .unwrap_or_default()
        .parse::<StorageType>()
        .map_err(ApiError::bad_request)
}

fn added(torrent: &Torrent) -> Json<Value> {
    Json(json!({
        "success": true,
        "hash": torrent.info_hash(),
        "name": torrent.name(),
    }))
}

/// Session summary with the latest transfer counters.
pub async fn session_status(State(state): State<AppState>) -> Json<Value> {
    let status = state.session.status();
    let counters = state.session.counters();
    Json(json!({
        "torrents_count": status.torrents_count,
        "is_paused": status.is_paused,
        "download_rate": counters.download_rate,
        "upload_rate": counters.upload_rate,
        "total_download": counters.total_download,
        "total_upload": counters.total_upload,
        "started_at": state.started_at.to_rfc3339(),
    }))
}

pub async fn pause_session(State(state): State<AppState>) -> Json<Value> {
    state.session.pause();
    Json(json!({"success": true}))
}

pub async fn resume_session(State(state): State<AppState>) -> Json<Value> {
    state.session.resume();
    Json(json!({"success": true}))
}

/// Adds a magnet link, a local `.torrent` path or an http(s) `.torrent` URL.
pub async fn add_uri(
    State(state): State<AppState>,
    Query(query): Query<AddUriQuery>,
) -> ApiResult<Json<Value>> {
    let storage = parse_storage(query.storage.as_deref())?;
    let uri = query.uri.trim();
    if uri.is_empty() {
        return Err(ApiError::bad_request("Missing uri parameter"));
    }

    let remote = Url::parse(uri)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"));
    let torrent = if let Some(url) = remote {
        let metainfo = fetch_torrent(&state.http, url)
            .await
            .map_err(ApiError::Fetch)?;
        state.session.add_metainfo(metainfo, query.paused, storage)?
    } else {
        state.session.add_torrent(uri, query.paused, storage)?
    };
    Ok(added(&torrent))
}

/// Adds the `.torrent` uploaded in the multipart field `file`.
pub async fn add_file(
    State(state): State<AppState>,
    Query(query): Query<AddFileQuery>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let storage = parse_storage(query.storage.as_deref())?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {e}")))?;
        debug!(size = bytes.len(), "Received torrent upload");

        let torrent = state.session.add_metainfo(bytes.to_vec(), query.paused, storage)?;
        return Ok(added(&torrent));
    }

    Err(ApiError::bad_request("Missing file field"))
}

async fn fetch_torrent(client: &reqwest::Client, url: Url) -> anyhow::Result<Vec<u8>> {
    info!(url = %url, "Fetching torrent file");
    let response = client.get(url.clone()).send().await?.error_for_status()?;
    let body = response.bytes().await?;
    anyhow::ensure!(!body.is_empty(), "empty response from {url}");
    Ok(body.to_vec())
}

/// Plain-text dump of every torrent.
pub async fn session_info(State(state): State<AppState>) -> String {
    let status = state.session.status();
    let mut out = format!(
        "Torrest session: {} torrents, paused: {}\n\n",
        status.torrents_count, status.is_paused
    );
    for torrent in state.session.torrents() {
        out.push_str(&torrent.dump());
        out.push('\n');
    }
    out
}

pub async fn shutdown(State(state): State<AppState>) -> Json<Value> {
    info!("Shutdown requested over HTTP");
    state.shutdown.trigger();
    Json(json!({"success": true}))
}
