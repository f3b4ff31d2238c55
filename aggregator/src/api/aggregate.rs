use super::AppState;
use crate::protocol::{AggregatedJournalResponse, JournalRequest, JournalResponse, Strategy};
use axum::Json;
use axum::extract::State;
use serde::Serialize;

/// The immediate answer depends on the strategy: the streaming path hands
/// back a correlation id right away, WAIT_FOR_EVERYONE blocks and returns
/// the merged payload.
#[derive(Serialize)]
#[serde(untagged)]
pub enum AggregateResponse {
    Streaming(JournalResponse),
    Aggregated(AggregatedJournalResponse),
}

pub async fn aggregate(
    State(state): State<AppState>,
    Json(request): Json<JournalRequest>,
) -> Json<AggregateResponse> {
    match request.strategy {
        Some(Strategy::WaitForEveryone) => Json(AggregateResponse::Aggregated(
            state.service.aggregate_direct(request).await,
        )),
        _ => Json(AggregateResponse::Streaming(
            state.service.aggregate(request).await,
        )),
    }
}
