//! Runtime configuration endpoints.

use axum::Json;
use axum::extract::State;
use torrest_core::TorrestConfig;
use tracing::info;

use crate::error::ApiResult;
use crate::server::AppState;

pub async fn get_settings(State(state): State<AppState>) -> Json<TorrestConfig> {
    Json(state.session.config())
}

/// Replaces the runtime configuration and returns the applied one.
///
/// Sections missing from the body fall back to their defaults.
pub async fn set_settings(
    State(state): State<AppState>,
    Json(config): Json<TorrestConfig>,
) -> ApiResult<Json<TorrestConfig>> {
    info!("Updating settings");
    state.session.reconfigure(config)?;
    Ok(Json(state.session.config()))
}
