//! HTTP surface of the gateway.

pub mod aggregate;
pub mod callback;
pub mod health;
pub mod signaling;
pub mod stream;

use crate::config::Config;
use crate::errors::{AggregatorError, SignalingError};
use crate::registry::CorrelationRegistry;
use crate::service::AggregatorService;
use crate::signaling::SessionMap;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

/// Process-wide shared state: one correlation registry, one aggregation
/// facade, one signaling-session map.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AggregatorService>,
    pub registry: Arc<CorrelationRegistry>,
    pub sessions: Arc<SessionMap>,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let registry = Arc::new(CorrelationRegistry::new());
        Self {
            service: Arc::new(AggregatorService::new(config, registry.clone())),
            registry,
            sessions: Arc::new(SessionMap::new(&config.signaling)),
        }
    }

    /// Flushes all live state: cancels pending deadlines and dispatch
    /// groups, closes every event channel without a summary, and expires
    /// every signaling session.
    pub fn shutdown(&self) {
        for (correlation_id, sink) in self.registry.drain() {
            tracing::debug!(correlation_id = %correlation_id, "closing stream on shutdown");
            sink.cancel_all();
            sink.close_channel();
        }
        self.sessions.shutdown();
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/aggregate/journals", post(aggregate::aggregate))
        .route("/aggregate/stream", get(stream::stream))
        .route("/aggregate/callback", post(callback::callback))
        .route("/aggregate/webrtc/create", post(signaling::create))
        .route("/aggregate/webrtc/{id}/stream", get(signaling::subscribe))
        .route("/aggregate/webrtc/{id}/signal", post(signaling::signal))
        .with_state(state)
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

impl IntoResponse for SignalingError {
    fn into_response(self) -> Response {
        let status = match self {
            SignalingError::NotFound => StatusCode::NOT_FOUND,
            SignalingError::Unauthorized => StatusCode::UNAUTHORIZED,
            SignalingError::SubscriberLimit => StatusCode::CONFLICT,
        };

        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
        });
        (status, body).into_response()
    }
}

impl IntoResponse for AggregatorError {
    fn into_response(self) -> Response {
        let status = match self {
            AggregatorError::StreamConflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
        });
        (status, body).into_response()
    }
}
