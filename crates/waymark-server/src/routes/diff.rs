//! Diff upload endpoint.

use axum::{extract::State, Extension, Json};

use crate::error::ApiResult;
use crate::middleware::SequencePoint;
use crate::state::AppState;
use waymark_core::{DiffBatch, DiffResult};

/// Apply a batch of creates, modifies and deletes atomically.
/// POST /api/diff
pub async fn submit_diff(
    State(state): State<AppState>,
    Json(batch): Json<DiffBatch>,
) -> ApiResult<(Extension<SequencePoint>, Json<DiffResult>)> {
    tracing::Span::current().record("changeset_id", batch.changeset_id);

    let service = state.service();
    let result = service.submit_diff(&batch).await?;
    let committed = match result.last_sequence_id() {
        Some(sequence_id) => sequence_id,
        None => service.current_sequence_id().await?,
    };
    tracing::debug!(
        assigned = result.entries.len(),
        attempts = result.attempts,
        "Diff applied"
    );
    Ok((Extension(SequencePoint(committed)), Json(result)))
}
