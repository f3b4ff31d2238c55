use super::AppState;
use crate::protocol::JournalCallback;
use crate::service;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;

/// Resources post their results here. Always acknowledged with 2xx: a
/// callback for an unknown correlation is a late arrival from a cancelled
/// or completed run and is dropped.
pub async fn callback(
    State(state): State<AppState>,
    Json(event): Json<JournalCallback>,
) -> StatusCode {
    let Some(correlation_id) = event.correlation_id.clone() else {
        tracing::debug!(source = %event.source, "callback without correlation id, dropping");
        return StatusCode::OK;
    };

    service::deliver(&state.registry, &correlation_id, event).await;
    StatusCode::OK
}
