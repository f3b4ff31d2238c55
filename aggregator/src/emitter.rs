//! Event emission with bounded-retry backpressure.
//!
//! The channel is bounded; when it is momentarily full the producer retries
//! for a short while and then drops the event with a warning. Liveness of
//! the callback path wins over completeness for a slow subscriber.

use crate::metrics_defs::EVENTS_DROPPED;
use crate::protocol::JournalCallback;
use crate::sink::AggregationSink;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::sleep;

const MAX_SEND_ATTEMPTS: u32 = 50;
const SEND_RETRY_DELAY: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The subscriber is gone; nothing to deliver to.
    Closed,
    /// Retries exhausted against a persistently full channel.
    Dropped,
}

/// Bounded-retry `try_send`. Shared by the aggregation event path and the
/// signaling fan-out, which follow the same backpressure discipline.
pub async fn send_with_retry<T>(tx: &mpsc::Sender<T>, value: T) -> SendOutcome {
    let mut pending = value;
    for _ in 0..MAX_SEND_ATTEMPTS {
        match tx.try_send(pending) {
            Ok(()) => return SendOutcome::Sent,
            Err(TrySendError::Closed(_)) => return SendOutcome::Closed,
            Err(TrySendError::Full(value)) => {
                pending = value;
                sleep(SEND_RETRY_DELAY).await;
            }
        }
    }
    SendOutcome::Dropped
}

/// Pushes one event onto the correlation's channel. Returns whether the
/// subscriber will see it.
pub async fn emit(sink: &AggregationSink, event: JournalCallback) -> bool {
    let Some(tx) = sink.sender() else {
        // Channel already closed by termination; late event, nothing to do.
        return false;
    };

    match send_with_retry(&tx, event).await {
        SendOutcome::Sent => true,
        SendOutcome::Closed => false,
        SendOutcome::Dropped => {
            tracing::warn!("subscriber too slow, dropping event after retries");
            metrics::counter!(EVENTS_DROPPED.name).increment(1);
            false
        }
    }
}

/// Pushes the terminal summary and closes the channel. No event may follow.
pub async fn emit_summary(
    sink: &AggregationSink,
    correlation_id: &str,
    respondents: u32,
    errors: u32,
) {
    let summary = JournalCallback::summary(correlation_id.to_string(), respondents, errors);
    if !emit(sink, summary).await {
        tracing::warn!(
            correlation_id,
            "summary not delivered, subscriber gone or channel saturated"
        );
    }
    sink.close_channel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CallbackStatus;

    fn event(source: &str) -> JournalCallback {
        JournalCallback::synthetic(source, None, "c-1".into(), CallbackStatus::Ok)
    }

    #[tokio::test]
    async fn events_arrive_in_emit_order() {
        let sink = AggregationSink::new(8);
        let mut rx = sink.take_receiver().unwrap();

        for source in ["r1", "r2", "r3"] {
            assert!(emit(&sink, event(source)).await);
        }

        assert_eq!(rx.recv().await.unwrap().source, "r1");
        assert_eq!(rx.recv().await.unwrap().source, "r2");
        assert_eq!(rx.recv().await.unwrap().source, "r3");
    }

    #[tokio::test]
    async fn persistent_backpressure_drops_instead_of_blocking() {
        // Capacity 1 and no consumer: the second emit must give up.
        let sink = AggregationSink::new(1);
        let _rx = sink.take_receiver().unwrap();

        assert!(emit(&sink, event("r1")).await);
        let start = tokio::time::Instant::now();
        assert!(!emit(&sink, event("r2")).await);
        // Bounded: ~50 x 1ms, nowhere near a deadlock
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn emit_after_close_reports_failure() {
        let sink = AggregationSink::new(8);
        sink.close_channel();
        assert!(!emit(&sink, event("r1")).await);
    }

    #[tokio::test]
    async fn summary_is_last_and_closes_the_channel() {
        let sink = AggregationSink::new(8);
        let mut rx = sink.take_receiver().unwrap();

        emit(&sink, event("r1")).await;
        emit_summary(&sink, "c-1", 1, 0).await;

        // Late producer cannot append past the summary
        assert!(!emit(&sink, event("r2")).await);

        assert_eq!(rx.recv().await.unwrap().source, "r1");
        let summary = rx.recv().await.unwrap();
        assert_eq!(summary.status, CallbackStatus::Complete);
        assert_eq!(summary.respondents, Some(1));
        assert_eq!(summary.errors, Some(0));
        assert!(rx.recv().await.is_none());
    }
}
