//! Metric definitions for the gateway.
//!
//! Every metric is declared here and listed in `ALL_METRICS`; the table in
//! METRICS.md is generated from that list and checked by tests, so the two
//! cannot drift apart.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Gauge => "Gauge",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

pub const AGGREGATIONS_STARTED: MetricDef = MetricDef {
    name: "aggregations.started",
    metric_type: MetricType::Counter,
    description: "Aggregation requests accepted. Tagged with strategy.",
};

pub const CALLBACKS_RECEIVED: MetricDef = MetricDef {
    name: "callbacks.received",
    metric_type: MetricType::Counter,
    description: "Callback events routed into a live correlation. Tagged with status.",
};

pub const CALLBACKS_DROPPED: MetricDef = MetricDef {
    name: "callbacks.dropped",
    metric_type: MetricType::Counter,
    description: "Callbacks acknowledged and discarded because the correlation was gone",
};

pub const EVENTS_DROPPED: MetricDef = MetricDef {
    name: "events.dropped",
    metric_type: MetricType::Counter,
    description: "Events dropped after exhausting backpressure retries on a slow subscriber",
};

pub const DEADLINES_FIRED: MetricDef = MetricDef {
    name: "deadlines.fired",
    metric_type: MetricType::Counter,
    description: "Per-correlation deadlines that fired before all callbacks arrived",
};

pub const STREAM_DISCONNECTS: MetricDef = MetricDef {
    name: "streams.disconnected",
    metric_type: MetricType::Counter,
    description: "Event streams torn down by client disconnect before completion",
};

pub const CORRELATIONS_LIVE: MetricDef = MetricDef {
    name: "correlations.live",
    metric_type: MetricType::Gauge,
    description: "Correlations currently registered and awaiting callbacks",
};

pub const AGGREGATION_DURATION: MetricDef = MetricDef {
    name: "aggregation.duration",
    metric_type: MetricType::Histogram,
    description: "Seconds from aggregation start to summary emission",
};

pub const SESSIONS_CREATED: MetricDef = MetricDef {
    name: "signaling.sessions.created",
    metric_type: MetricType::Counter,
    description: "Signaling sessions created",
};

pub const SIGNALS_FANNED_OUT: MetricDef = MetricDef {
    name: "signaling.signals.fanned_out",
    metric_type: MetricType::Counter,
    description: "Signal payloads fanned out to session subscribers",
};

pub const ALL_METRICS: &[MetricDef] = &[
    AGGREGATIONS_STARTED,
    CALLBACKS_RECEIVED,
    CALLBACKS_DROPPED,
    EVENTS_DROPPED,
    DEADLINES_FIRED,
    STREAM_DISCONNECTS,
    CORRELATIONS_LIVE,
    AGGREGATION_DURATION,
    SESSIONS_CREATED,
    SIGNALS_FANNED_OUT,
];

/// Renders the definitions as the markdown table kept in METRICS.md.
pub fn generate_metrics_table(metrics: &[MetricDef]) -> String {
    let mut lines = vec![
        "| Metric | Type | Description |".to_string(),
        "|--------|------|-------------|".to_string(),
    ];
    for m in metrics {
        lines.push(format!(
            "| `{}` | {} | {} |",
            m.name,
            m.metric_type.as_str(),
            m.description
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_md_contains_all_defined_metrics() {
        let metrics_md =
            std::fs::read_to_string("../METRICS.md").expect("Failed to read METRICS.md");

        let mut missing = Vec::new();
        for m in ALL_METRICS {
            if !metrics_md.contains(m.name) {
                missing.push(m.name);
            }
        }

        assert!(
            missing.is_empty(),
            "METRICS.md is missing these metrics: {:?}\nAdd them to METRICS.md",
            missing
        );
    }

    #[test]
    fn metrics_md_table_is_in_sync() {
        let metrics_md =
            std::fs::read_to_string("../METRICS.md").expect("Failed to read METRICS.md");

        assert!(
            metrics_md.contains(&generate_metrics_table(ALL_METRICS)),
            "METRICS.md table is out of date; regenerate it from ALL_METRICS"
        );
    }
}
