//! Aggregation facade: accepts a journal request, registers the
//! correlation, starts the dispatch group, arms the deadline, and returns
//! the correlation id. Also owns the shared termination paths used by the
//! callback endpoint, the dispatcher, the deadline, and the stream guard.

use crate::config::Config;
use crate::deadline;
use crate::dispatcher::{Dispatcher, parse_delays};
use crate::emitter;
use crate::metrics_defs::{
    AGGREGATION_DURATION, AGGREGATIONS_STARTED, CALLBACKS_DROPPED, CALLBACKS_RECEIVED,
};
use crate::protocol::{
    AggregatedJournalResponse, CallbackStatus, JournalCallback, JournalRequest, JournalResponse,
    Strategy,
};
use crate::registry::CorrelationRegistry;
use crate::sink::{AggregationSink, RecordDecision};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct AggregatorService {
    registry: Arc<CorrelationRegistry>,
    dispatcher: Dispatcher,
    max_timeout_ms: u64,
}

impl AggregatorService {
    pub fn new(config: &Config, registry: Arc<CorrelationRegistry>) -> Self {
        Self {
            registry,
            dispatcher: Dispatcher::new(
                config.callback_url.clone(),
                config.resource_urls.clone(),
            ),
            max_timeout_ms: config.max_timeout_ms,
        }
    }

    /// Streaming strategy: returns immediately with the correlation id; the
    /// client consumes results on the event stream.
    pub async fn aggregate(&self, request: JournalRequest) -> JournalResponse {
        let (correlation_id, sink) = self.registry.create();
        let deadline = self.effective_deadline(request.timeout_ms);
        let delays = parse_delays(request.delays.as_deref(), self.dispatcher.slot_count());
        let expected = delays.len() as u32;

        tracing::info!(
            correlation_id = %correlation_id,
            patient_id = %request.patient_id,
            timeout_ms = deadline.as_millis() as u64,
            resources = expected,
            "starting aggregation"
        );
        metrics::counter!(AGGREGATIONS_STARTED.name, "strategy" => "SSE").increment(1);

        // Dispatch first; rejected or failed slots synthesize their events
        // right away and may land before set_expected below.
        let cancel = self.dispatcher.dispatch(
            self.registry.clone(),
            correlation_id.clone(),
            request.patient_id.clone(),
            delays,
            deadline,
        );
        sink.arm_dispatch_cancel(cancel);

        let decision = sink.set_expected(expected);
        sink.arm_deadline(deadline::schedule(
            self.registry.clone(),
            correlation_id.clone(),
            request.patient_id.clone(),
            deadline,
        ));

        match decision {
            Ok(RecordDecision::Terminate) => {
                // Every slot completed at dispatch time
                complete_with_summary(&self.registry, &correlation_id).await;
            }
            Ok(RecordDecision::Continue) => {}
            Err(e) => {
                tracing::error!(correlation_id = %correlation_id, error = %e, "aggregation state violation");
            }
        }

        JournalResponse {
            respondents: 0,
            correlation_id,
            strategy: request.strategy,
        }
    }

    /// WAIT_FOR_EVERYONE strategy: blocks until every resource has answered
    /// its direct endpoint and returns the merged payload. Bypasses the
    /// registry, the deadline scheduler, and the event stream.
    pub async fn aggregate_direct(&self, request: JournalRequest) -> AggregatedJournalResponse {
        let correlation_id = Uuid::new_v4().to_string();
        let deadline = self.effective_deadline(request.timeout_ms);
        let delays = parse_delays(request.delays.as_deref(), self.dispatcher.slot_count());

        tracing::info!(
            correlation_id = %correlation_id,
            patient_id = %request.patient_id,
            "starting synchronous aggregation"
        );
        metrics::counter!(AGGREGATIONS_STARTED.name, "strategy" => "WAIT_FOR_EVERYONE")
            .increment(1);

        let callbacks = self
            .dispatcher
            .direct_fan_out(&request.patient_id, delays, deadline)
            .await;

        let mut respondents = 0;
        let mut errors = 0;
        let mut notes = Vec::new();
        for callback in callbacks {
            match callback.status {
                CallbackStatus::Ok => {
                    respondents += 1;
                    notes.extend(callback.notes.unwrap_or_default());
                }
                status if status.is_technical_failure() => errors += 1,
                _ => {}
            }
        }

        AggregatedJournalResponse {
            patient_id: request.patient_id,
            respondents,
            errors,
            notes,
            correlation_id,
            strategy: Strategy::WaitForEveryone,
        }
    }

    /// Clamps the client-requested timeout to the configured maximum.
    fn effective_deadline(&self, requested_ms: Option<u64>) -> Duration {
        let effective = match requested_ms {
            Some(requested) if requested > self.max_timeout_ms => {
                tracing::warn!(
                    requested_ms = requested,
                    max_ms = self.max_timeout_ms,
                    "requested timeout exceeds maximum, clamping"
                );
                self.max_timeout_ms
            }
            Some(requested) => requested,
            None => self.max_timeout_ms,
        };
        Duration::from_millis(effective)
    }
}

/// Routes one callback event into its correlation: emit to the stream,
/// count it, and terminate if this was the crossing. The event goes onto
/// the channel before the decision so the summary can never overtake it.
pub(crate) async fn deliver(
    registry: &Arc<CorrelationRegistry>,
    correlation_id: &str,
    event: JournalCallback,
) {
    if event.status == CallbackStatus::Complete {
        tracing::warn!(correlation_id, "dropping callback carrying the reserved COMPLETE status");
        return;
    }

    let Some(sink) = registry.get(correlation_id) else {
        tracing::debug!(correlation_id, "callback for unknown correlation, acknowledged and dropped");
        metrics::counter!(CALLBACKS_DROPPED.name).increment(1);
        return;
    };

    let status = event.status;
    metrics::counter!(CALLBACKS_RECEIVED.name, "status" => status.wire_name()).increment(1);

    emitter::emit(&sink, event).await;
    if sink.record(status) == RecordDecision::Terminate {
        complete_with_summary(registry, correlation_id).await;
    }
}

/// Termination with summary. The atomic remove decides ownership: losing
/// the race means another path already completed or cancelled this
/// correlation.
pub(crate) async fn complete_with_summary(registry: &CorrelationRegistry, correlation_id: &str) {
    let Some(sink) = registry.remove(correlation_id) else {
        tracing::debug!(correlation_id, "no live state to complete");
        return;
    };
    finish(&sink, correlation_id).await;
}

/// Summary emission for a sink already removed from the registry.
pub(crate) async fn finish(sink: &AggregationSink, correlation_id: &str) {
    sink.cancel_deadline();

    let respondents = sink.respondents();
    let errors = sink.errors();
    tracing::info!(correlation_id, respondents, errors, "aggregation complete");
    metrics::histogram!(AGGREGATION_DURATION.name).record(sink.age().as_secs_f64());
    emitter::emit_summary(sink, correlation_id, respondents, errors).await;
}

/// Termination without summary, for client disconnect and shutdown. Fully
/// synchronous so the stream guard can run it from Drop. Returns whether
/// the correlation was still live.
pub(crate) fn cancel(registry: &CorrelationRegistry, correlation_id: &str) -> bool {
    let Some(sink) = registry.remove(correlation_id) else {
        return false;
    };
    tracing::info!(correlation_id, "cancelling aggregation");
    sink.cancel_all();
    sink.close_channel();
    true
}
