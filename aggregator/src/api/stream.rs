//! Long-lived server-to-client event stream for one correlation.
//!
//! At most one subscriber per correlation: the channel receiver is handed
//! out once, a second subscribe gets Conflict. Client disconnect is
//! detected by the stream being dropped, which cancels the dispatch group
//! and the deadline and removes the registry entry, without a summary.

use super::AppState;
use crate::errors::AggregatorError;
use crate::metrics_defs::STREAM_DISCONNECTS;
use crate::protocol::JournalCallback;
use crate::registry::CorrelationRegistry;
use crate::service;
use axum::extract::{Query, State};
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

#[derive(Deserialize)]
pub struct StreamParams {
    #[serde(rename = "correlationId")]
    correlation_id: String,
}

pub async fn stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<KeepAliveStream<EventStream>>, AggregatorError> {
    let correlation_id = params.correlation_id;

    let stream = match state.registry.get(&correlation_id) {
        None => {
            // The client may have arrived after termination; answer with an
            // empty stream that closes immediately rather than an error.
            tracing::debug!(correlation_id = %correlation_id, "stream requested for unknown correlation");
            EventStream::empty()
        }
        Some(sink) => match sink.take_receiver() {
            Some(rx) => EventStream::live(rx, state.registry.clone(), correlation_id),
            None => return Err(AggregatorError::StreamConflict(correlation_id)),
        },
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    ))
}

/// Cancels the correlation when the subscriber goes away. Termination that
/// already happened (normal completion) makes the cancel a no-op, so
/// dropping this unconditionally is safe.
struct DisconnectGuard {
    registry: Arc<CorrelationRegistry>,
    correlation_id: String,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if service::cancel(&self.registry, &self.correlation_id) {
            tracing::info!(correlation_id = %self.correlation_id, "client disconnected, aggregation cancelled");
            metrics::counter!(STREAM_DISCONNECTS.name).increment(1);
        }
    }
}

pub struct EventStream {
    inner: Option<ReceiverStream<JournalCallback>>,
    _guard: Option<DisconnectGuard>,
}

impl EventStream {
    fn empty() -> Self {
        Self {
            inner: None,
            _guard: None,
        }
    }

    fn live(
        rx: tokio::sync::mpsc::Receiver<JournalCallback>,
        registry: Arc<CorrelationRegistry>,
        correlation_id: String,
    ) -> Self {
        Self {
            inner: Some(ReceiverStream::new(rx)),
            _guard: Some(DisconnectGuard {
                registry,
                correlation_id,
            }),
        }
    }
}

impl Stream for EventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match Pin::new(inner).poll_next(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(to_sse_event(&event)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn to_sse_event(callback: &JournalCallback) -> Event {
    match serde_json::to_string(callback) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize event, sending comment instead");
            Event::default().comment("event serialization failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CallbackStatus;
    use crate::{deadline, emitter};
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn live_stream_yields_events_until_channel_close() {
        let registry = Arc::new(CorrelationRegistry::new());
        let (id, sink) = registry.create();
        let rx = sink.take_receiver().unwrap();

        emitter::emit(
            &sink,
            JournalCallback::synthetic("r1", None, id.clone(), CallbackStatus::Ok),
        )
        .await;
        emitter::emit_summary(&sink, &id, 1, 0).await;
        registry.remove(&id);

        let mut stream = EventStream::live(rx, registry.clone(), id.clone());
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn empty_stream_closes_immediately() {
        let mut stream = EventStream::empty();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_correlation() {
        let registry = Arc::new(CorrelationRegistry::new());
        let (id, sink) = registry.create();
        sink.set_expected(3).unwrap();

        // Pending dispatch group and deadline, as in a live aggregation
        let dispatch = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        sink.arm_dispatch_cancel(dispatch.abort_handle());
        sink.arm_deadline(deadline::schedule(
            registry.clone(),
            id.clone(),
            "p1".into(),
            Duration::from_secs(60),
        ));

        let rx = sink.take_receiver().unwrap();
        let stream = EventStream::live(rx, registry.clone(), id.clone());

        drop(stream);

        assert!(registry.get(&id).is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dispatch.is_finished());
        // Channel was closed without a summary; late emits go nowhere
        assert!(
            !emitter::emit(
                &sink,
                JournalCallback::synthetic("r1", None, id.clone(), CallbackStatus::Ok),
            )
            .await
        );
    }

    #[tokio::test]
    async fn normal_completion_leaves_nothing_for_the_guard() {
        let registry = Arc::new(CorrelationRegistry::new());
        let (id, sink) = registry.create();
        let rx = sink.take_receiver().unwrap();

        // Terminated through the summary path before the client goes away
        service::complete_with_summary(&registry, &id).await;

        let stream = EventStream::live(rx, registry.clone(), id.clone());
        drop(stream);
        assert!(registry.get(&id).is_none());
    }
}
