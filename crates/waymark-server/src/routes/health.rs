//! Health check endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub sequence_id: u64,
    pub version: String,
}

/// Health check endpoint.
/// GET /health
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let sequence_id = state.service().current_sequence_id().await?;

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        sequence_id: sequence_id.value(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}
