//! One-shot, cancellable per-correlation deadline.
//!
//! The deadline bounds the callback-waiting phase, not dispatch. On fire it
//! claims termination through the registry's atomic remove; if another path
//! already terminated the correlation it performs no work.

use crate::metrics_defs::DEADLINES_FIRED;
use crate::protocol::{AGGREGATOR_SOURCE, CallbackStatus, CorrelationId, JournalCallback};
use crate::registry::CorrelationRegistry;
use crate::{emitter, service};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

/// Cancellation capability for a scheduled deadline.
pub struct DeadlineHandle {
    handle: AbortHandle,
}

impl DeadlineHandle {
    /// Idempotent cancel; returns whether the deadline had already run.
    /// Neither outcome needs handling: a fired deadline that found no
    /// state performed no work.
    pub fn cancel(&self) -> bool {
        let already_ran = self.handle.is_finished();
        self.handle.abort();
        already_ran
    }
}

/// Arms a single-fire deadline for the correlation.
pub fn schedule(
    registry: Arc<CorrelationRegistry>,
    correlation_id: CorrelationId,
    patient_id: String,
    deadline: Duration,
) -> DeadlineHandle {
    let task = tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        fire(&registry, &correlation_id, &patient_id).await;
    });
    DeadlineHandle {
        handle: task.abort_handle(),
    }
}

/// Attributes the shortfall to the deadline: each missing slot becomes a
/// synthetic TIMEOUT (counted as an error), then the summary goes out.
async fn fire(registry: &CorrelationRegistry, correlation_id: &str, patient_id: &str) {
    let Some(sink) = registry.remove(correlation_id) else {
        tracing::debug!(correlation_id, "deadline fired after termination, nothing to do");
        return;
    };

    let missing = sink.expected().saturating_sub(sink.received());
    tracing::warn!(
        correlation_id,
        received = sink.received(),
        expected = sink.expected(),
        missing,
        "deadline reached before all callbacks arrived"
    );
    metrics::counter!(DEADLINES_FIRED.name).increment(1);

    for _ in 0..missing {
        let event = JournalCallback::synthetic(
            AGGREGATOR_SOURCE,
            Some(patient_id.to_string()),
            correlation_id.to_string(),
            CallbackStatus::Timeout,
        );
        emitter::emit(&sink, event).await;
        sink.record(CallbackStatus::Timeout);
    }

    service::finish(&sink, correlation_id).await;
}
