//! Process-wide metrics registry.
//!
//! Initialized exactly once behind a `OnceLock`, matching the design note in
//! `spec.md` §9: "global static metric registries are acceptable as a
//! process-wide write-mostly sink but must be initialized exactly once and
//! never block the data path." Modeled on the teacher's `log_streaming::metrics`
//! module, which wraps counters as free functions (`log_event_total(n)`)
//! rather than threading `prometheus::Counter` handles through every
//! component.

use std::sync::OnceLock;

use prometheus::{
    IntCounter,
    IntCounterVec,
    IntGauge,
    IntGaugeVec,
    Opts,
    Registry,
};

pub struct Metrics {
    pub registry: Registry,
    pub records_ingested_total: IntCounterVec,
    pub records_dropped_total: IntCounterVec,
    pub parse_errors_total: IntCounter,
    pub queue_depth: IntGauge,
    pub queue_capacity: IntGauge,
    pub batches_sent_total: IntCounterVec,
    pub batches_failed_total: IntCounterVec,
    pub retry_queue_depth: IntGauge,
    pub retry_attempts_total: IntCounter,
    pub dlq_entries_total: IntCounterVec,
    pub dedup_hits_total: IntCounter,
    pub dedup_evictions_total: IntCounter,
    pub position_flush_failures_total: IntCounter,
    pub position_truncation_detected_total: IntCounter,
    pub position_corruption_detected_total: IntCounter,
    pub circuit_breaker_state: IntGaugeVec,
    pub resource_alerts_total: IntCounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        macro_rules! register {
            ($ty:ident, $name:expr, $help:expr) => {{
                let m = $ty::new($name, $help).expect("valid metric");
                registry.register(Box::new(m.clone())).expect("unique metric name");
                m
            }};
        }
        macro_rules! register_vec {
            ($ty:ident, $name:expr, $help:expr, $labels:expr) => {{
                let m = $ty::new(Opts::new($name, $help), $labels).expect("valid metric");
                registry.register(Box::new(m.clone())).expect("unique metric name");
                m
            }};
        }

        Self {
            records_ingested_total: register_vec!(
                IntCounterVec,
                "streamship_records_ingested_total",
                "Records ingested, by source type",
                &["source_type"]
            ),
            records_dropped_total: register_vec!(
                IntCounterVec,
                "streamship_records_dropped_total",
                "Records dropped, by reason",
                &["reason"]
            ),
            parse_errors_total: register!(
                IntCounter,
                "streamship_parse_errors_total",
                "Records whose pipeline parse stage failed and were passed through tagged parse_error=true"
            ),
            queue_depth: register!(IntGauge, "streamship_queue_depth", "Dispatcher queue depth"),
            queue_capacity: register!(
                IntGauge,
                "streamship_queue_capacity",
                "Dispatcher queue capacity"
            ),
            batches_sent_total: register_vec!(
                IntCounterVec,
                "streamship_batches_sent_total",
                "Batches successfully delivered, by sink",
                &["sink"]
            ),
            batches_failed_total: register_vec!(
                IntCounterVec,
                "streamship_batches_failed_total",
                "Batches that failed delivery, by sink",
                &["sink"]
            ),
            retry_queue_depth: register!(
                IntGauge,
                "streamship_retry_queue_depth",
                "Retry manager in-memory queue depth"
            ),
            retry_attempts_total: register!(
                IntCounter,
                "streamship_retry_attempts_total",
                "Total reinjection attempts performed by the retry manager"
            ),
            dlq_entries_total: register_vec!(
                IntCounterVec,
                "streamship_dlq_entries_total",
                "Entries written to the dead-letter queue, by reason code",
                &["reason"]
            ),
            dedup_hits_total: register!(
                IntCounter,
                "streamship_dedup_hits_total",
                "Records dropped as duplicates"
            ),
            dedup_evictions_total: register!(
                IntCounter,
                "streamship_dedup_evictions_total",
                "Dedup cache evictions due to capacity"
            ),
            position_flush_failures_total: register!(
                IntCounter,
                "streamship_position_flush_failures_total",
                "Failed position-store flush attempts"
            ),
            position_truncation_detected_total: register!(
                IntCounter,
                "streamship_position_truncation_detected_total",
                "Truncations detected by the file tailer"
            ),
            position_corruption_detected_total: register!(
                IntCounter,
                "streamship_position_corruption_detected_total",
                "Position-store corruption events recovered from a fallback checkpoint"
            ),
            circuit_breaker_state: register_vec!(
                IntGaugeVec,
                "streamship_circuit_breaker_state",
                "Circuit breaker state per sink (0=closed,1=open,2=half_open)",
                &["sink"]
            ),
            resource_alerts_total: register_vec!(
                IntCounterVec,
                "streamship_resource_alerts_total",
                "Resource monitor alerts raised, by kind",
                &["kind"]
            ),
        }
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_initializes_once_and_is_idempotent() {
        let a = metrics() as *const Metrics;
        let b = metrics() as *const Metrics;
        assert_eq!(a, b);
    }
}
