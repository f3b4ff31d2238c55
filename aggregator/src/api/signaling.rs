//! Signaling-session endpoints. Unlike the aggregation surface these fail
//! loudly: 401 on a bad token, 404 on an unknown or expired session, 409
//! on a duplicate subscribe.

use super::AppState;
use crate::errors::SignalingError;
use crate::signaling::{SessionCreated, SessionMap};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use serde::Deserialize;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub async fn create(State(state): State<AppState>) -> Json<SessionCreated> {
    Json(state.sessions.create())
}

#[derive(Deserialize)]
pub struct SubscribeParams {
    token: String,
}

pub async fn subscribe(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<SubscribeParams>,
) -> Result<Sse<KeepAliveStream<SignalStream>>, SignalingError> {
    let rx = state.sessions.subscribe(&session_id, &params.token)?;

    let stream = SignalStream {
        inner: ReceiverStream::new(rx),
        _guard: SubscriberGuard {
            sessions: state.sessions.clone(),
            session_id,
        },
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    ))
}

#[derive(Deserialize)]
pub struct SignalRequest {
    token: String,
    payload: serde_json::Value,
}

pub async fn signal(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<SignalRequest>,
) -> Result<StatusCode, SignalingError> {
    state
        .sessions
        .signal(&session_id, &request.token, request.payload)
        .await?;
    Ok(StatusCode::OK)
}

/// Notifies the session map when this subscriber's stream is dropped so a
/// drained session can be torn down ahead of its TTL.
struct SubscriberGuard {
    sessions: Arc<SessionMap>,
    session_id: String,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.sessions.on_subscriber_gone(&self.session_id);
    }
}

pub struct SignalStream {
    inner: ReceiverStream<serde_json::Value>,
    _guard: SubscriberGuard,
}

impl Stream for SignalStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(payload)) => Poll::Ready(Some(Ok(Event::default().data(payload.to_string())))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
