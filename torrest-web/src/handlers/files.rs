//! File selection, buffering and file status endpoints.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};
use torrest_core::engine::priority;
use torrest_core::torrent::FileStatus;
use tracing::info;

use super::lookup_file;
use super::torrents::FileInfoResponse;
use crate::error::ApiResult;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    pub buffer: bool,
}

/// Selects the file for download, optionally prefetching its head and tail.
pub async fn download_file(
    State(state): State<AppState>,
    Path((hash, index)): Path<(String, usize)>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Json<Value>> {
    let (torrent, file) = lookup_file(&state, &hash, index)?;
    file.set_priority(&torrent, priority::DEFAULT);
    if query.buffer {
        file.start_buffer(&torrent)?;
    }
    info!(info_hash = %torrent.info_hash(), file = index, buffer = query.buffer, "Selected file");
    Ok(Json(json!({
        "success": true,
        "hash": torrent.info_hash(),
        "id": index,
    })))
}

/// Deselects the file and stops buffering it.
pub async fn stop_file(
    State(state): State<AppState>,
    Path((hash, index)): Path<(String, usize)>,
) -> ApiResult<Json<Value>> {
    let (torrent, file) = lookup_file(&state, &hash, index)?;
    file.stop_buffer();
    file.set_priority(&torrent, priority::DONT_DOWNLOAD);
    Ok(Json(json!({
        "success": true,
        "hash": torrent.info_hash(),
        "id": index,
    })))
}

pub async fn file_info(
    State(state): State<AppState>,
    Path((hash, index)): Path<(String, usize)>,
) -> ApiResult<Json<FileInfoResponse>> {
    let (_, file) = lookup_file(&state, &hash, index)?;
    Ok(Json(FileInfoResponse::from_file(&file)))
}

pub async fn file_status(
    State(state): State<AppState>,
    Path((hash, index)): Path<(String, usize)>,
) -> ApiResult<Json<FileStatus>> {
    let (torrent, file) = lookup_file(&state, &hash, index)?;
    Ok(Json(torrent.file_status(&file)))
}
