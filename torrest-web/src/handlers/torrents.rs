//! Per-torrent endpoints.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use torrest_core::torrent::{Torrent, TorrentStatus, TrackerInfo};
use torrest_core::{File, InfoHash, StorageType};

use super::lookup_torrent;
use crate::error::ApiResult;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct TorrentInfoResponse {
    pub info_hash: InfoHash,
    pub name: String,
    pub size: u64,
    pub has_metadata: bool,
    pub storage: StorageType,
    pub piece_length: u32,
    pub piece_count: u32,
    pub memory_size: u64,
    pub readers: usize,
    pub added_at: String,
    pub trackers: BTreeMap<String, TrackerInfo>,
}

impl TorrentInfoResponse {
    pub fn from_torrent(torrent: &Torrent) -> Self {
        Self {
            info_hash: torrent.info_hash(),
            name: torrent.name(),
            size: torrent.size(),
            has_metadata: torrent.has_metadata(),
            storage: torrent.storage_type(),
            piece_length: torrent.piece_length(),
            piece_count: torrent.piece_count(),
            memory_size: torrent.memory_size(),
            readers: torrent.reader_count(),
            added_at: torrent.added_at().to_rfc3339(),
            trackers: torrent.trackers(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TorrentListEntry {
    #[serde(flatten)]
    pub info: TorrentInfoResponse,
    pub status: TorrentStatus,
}

#[derive(Debug, Serialize)]
pub struct FileInfoResponse {
    pub id: usize,
    pub name: String,
    pub path: String,
    pub size: u64,
    pub offset: u64,
    pub piece_start: u32,
    pub piece_end: u32,
    pub selected: bool,
    pub buffering: bool,
    pub stream_uri: String,
}

impl FileInfoResponse {
    pub fn from_file(file: &File) -> Self {
        Self {
            id: file.index(),
            name: file.name().to_string(),
            path: file.path().to_string(),
            size: file.size(),
            offset: file.offset(),
            piece_start: file.piece_start().as_u32(),
            piece_end: file.piece_end().as_u32(),
            selected: file.is_selected(),
            buffering: file.is_buffering(),
            stream_uri: file.stream_uri(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub delete: bool,
}

/// Every torrent with its status, oldest first.
pub async fn torrents(State(state): State<AppState>) -> Json<Vec<TorrentListEntry>> {
    let list = state
        .session
        .torrents()
        .iter()
        .map(|torrent| TorrentListEntry {
            info: TorrentInfoResponse::from_torrent(torrent),
            status: torrent.status(),
        })
        .collect();
    Json(list)
}

pub async fn torrent_info(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<TorrentInfoResponse>> {
    let torrent = lookup_torrent(&state, &hash)?;
    Ok(Json(TorrentInfoResponse::from_torrent(&torrent)))
}

pub async fn torrent_status(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<TorrentStatus>> {
    let torrent = lookup_torrent(&state, &hash)?;
    Ok(Json(torrent.status()))
}

/// Files of the torrent; empty until metadata arrives.
pub async fn torrent_files(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<Vec<FileInfoResponse>>> {
    let torrent = lookup_torrent(&state, &hash)?;
    let files = torrent
        .files()
        .iter()
        .map(|file| FileInfoResponse::from_file(file))
        .collect();
    Ok(Json(files))
}

pub async fn pause_torrent(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<Value>> {
    let torrent = lookup_torrent(&state, &hash)?;
    torrent.pause();
    Ok(Json(json!({"success": true, "hash": torrent.info_hash()})))
}

pub async fn resume_torrent(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<Value>> {
    let torrent = lookup_torrent(&state, &hash)?;
    torrent.resume();
    Ok(Json(json!({"success": true, "hash": torrent.info_hash()})))
}

/// Removes the torrent; `delete=true` also deletes its persisted and downloaded files.
pub async fn remove_torrent(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> ApiResult<Json<Value>> {
    let torrent = lookup_torrent(&state, &hash)?;
    state
        .session
        .remove_torrent(torrent.info_hash(), query.delete, query.delete)?;
    Ok(Json(json!({"success": true, "hash": torrent.info_hash()})))
}
