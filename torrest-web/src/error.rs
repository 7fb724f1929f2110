//! API error type and its JSON rendering.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use torrest_core::{EngineError, TorrentError, TorrestError};
use tracing::warn;

/// Errors returned by API handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Torrest(#[from] TorrestError),

    #[error("{reason}")]
    BadRequest { reason: String },

    #[error("Failed to fetch torrent: {0:#}")]
    Fetch(anyhow::Error),
}

impl From<TorrentError> for ApiError {
    fn from(error: TorrentError) -> Self {
        ApiError::Torrest(error.into())
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        ApiError::Torrest(error.into())
    }
}

impl ApiError {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        ApiError::BadRequest {
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Torrest(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            ApiError::Torrest(e) if e.is_user_error() => StatusCode::BAD_REQUEST,
            ApiError::Torrest(TorrestError::Engine(EngineError::Metainfo { .. })) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Torrest(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest { .. } | ApiError::Fetch(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Torrent hash and file index the error refers to, when known.
    fn subject(&self) -> (Option<String>, Option<usize>) {
        match self {
            ApiError::Torrest(TorrestError::Torrent(e)) => match e {
                TorrentError::TorrentNotFound { info_hash }
                | TorrentError::MetadataUnavailable { info_hash } => {
                    (Some(info_hash.to_string()), None)
                }
                TorrentError::FileNotFound { info_hash, index } => {
                    (Some(info_hash.to_string()), Some(*index))
                }
                _ => (None, None),
            },
            ApiError::Torrest(TorrestError::Engine(
                EngineError::DuplicateTorrent { info_hash }
                | EngineError::TorrentNotFound { info_hash },
            )) => (Some(info_hash.to_string()), None),
            _ => (None, None),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Torrest(e) if e.is_not_found() || e.is_user_error() => e.user_message(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }

        let (hash, id) = self.subject();
        let body = json!({
            "success": false,
            "hash": hash,
            "id": id,
            "error": self.message(),
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
