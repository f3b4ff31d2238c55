//! Process-wide map from correlation id to live aggregation state.
//!
//! `remove` is the serialization point for termination: among the callback,
//! deadline, and disconnect paths, only the caller whose remove returns the
//! state may emit a summary or close the channel.

use crate::metrics_defs::CORRELATIONS_LIVE;
use crate::protocol::CorrelationId;
use crate::sink::{AggregationSink, EVENT_CHANNEL_CAPACITY};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
pub struct CorrelationRegistry {
    entries: Mutex<HashMap<CorrelationId, Arc<AggregationSink>>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh correlation id and inserts its state atomically.
    pub fn create(&self) -> (CorrelationId, Arc<AggregationSink>) {
        self.create_with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn create_with_capacity(&self, capacity: usize) -> (CorrelationId, Arc<AggregationSink>) {
        let id = Uuid::new_v4().to_string();
        let sink = Arc::new(AggregationSink::new(capacity));
        self.entries.lock().insert(id.clone(), sink.clone());
        metrics::gauge!(CORRELATIONS_LIVE.name).increment(1.0);
        (id, sink)
    }

    pub fn get(&self, id: &str) -> Option<Arc<AggregationSink>> {
        self.entries.lock().get(id).cloned()
    }

    /// Atomic remove-and-return. A caller that observes None here lost the
    /// termination race and must not emit a summary or close the channel.
    pub fn remove(&self, id: &str) -> Option<Arc<AggregationSink>> {
        let removed = self.entries.lock().remove(id);
        if removed.is_some() {
            metrics::gauge!(CORRELATIONS_LIVE.name).decrement(1.0);
        }
        removed
    }

    /// Empties the registry for shutdown; returns every live entry so the
    /// caller can cancel handles and close channels.
    pub fn drain(&self) -> Vec<(CorrelationId, Arc<AggregationSink>)> {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        metrics::gauge!(CORRELATIONS_LIVE.name).decrement(drained.len() as f64);
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
