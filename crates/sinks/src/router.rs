//! Batch dispatch policy (`spec.md` §4.9): a batch is shared with every
//! healthy sink in parallel, each under its own deadline; it's only
//! considered delivered once every *required* sink has returned ok. Any
//! required-sink failure (including one skipped because its breaker is
//! open) sends the whole batch to the Retry Manager.

use std::{
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use retry_manager::FailedBatch;
use streamship_common::{
    metrics::metrics,
    record::QueueItem,
};
use streamship_config::SinkConfig;

use crate::{
    batch_size::BatchSizeController,
    circuit_breaker::CircuitBreaker,
    Sink,
    SinkErrorKind,
};

pub struct SinkHandle {
    pub sink: Arc<dyn Sink>,
    pub required: bool,
    pub timeout: Duration,
    breaker: CircuitBreaker,
    batch_size: BatchSizeController,
}

impl SinkHandle {
    pub fn new(sink: Arc<dyn Sink>, config: &SinkConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(config.name.clone(), config.circuit_breaker.clone()),
            batch_size: BatchSizeController::new(config.min_batch, config.max_batch, config.batch_size),
            sink,
            required: config.required,
            timeout: config.timeout,
        }
    }

    pub fn name(&self) -> &str {
        self.sink.name()
    }

    /// Current adaptive cap this sink wants for its next batch; the caller
    /// (the dispatcher batcher upstream, wired at the binary level) can use
    /// this to pre-shrink batches, independent of whether this dispatch
    /// attempt goes through.
    pub fn current_batch_size(&self) -> usize {
        self.batch_size.current()
    }
}

pub enum DispatchOutcome {
    Delivered,
    Failed(FailedBatch),
}

pub struct SinkRouter {
    handles: Vec<SinkHandle>,
}

impl SinkRouter {
    pub fn new(handles: Vec<SinkHandle>) -> Self {
        Self { handles }
    }

    /// Dispatches one batch to every sink whose breaker currently allows a
    /// request, in parallel. Required sinks skipped because their breaker
    /// is open count as failed for this batch, same as an explicit error.
    pub async fn dispatch(&self, items: Vec<QueueItem>) -> DispatchOutcome {
        let required_count = self.handles.iter().filter(|h| h.required).count();
        let mut required_tripped = 0usize;
        let mut futures = Vec::with_capacity(self.handles.len());

        for handle in &self.handles {
            if !handle.breaker.allow_request() {
                if handle.required {
                    required_tripped += 1;
                }
                continue;
            }
            futures.push(self.dispatch_one(handle, &items));
        }

        let results = futures::future::join_all(futures).await;

        let mut all_required_ok = required_tripped == 0;
        for (_name, required, ok) in &results {
            if *required && !*ok {
                all_required_ok = false;
            }
        }

        if required_count > 0 && required_tripped == required_count {
            return DispatchOutcome::Failed(FailedBatch {
                items,
                all_sinks_tripped: true,
            });
        }

        if all_required_ok {
            DispatchOutcome::Delivered
        } else {
            DispatchOutcome::Failed(FailedBatch {
                items,
                all_sinks_tripped: false,
            })
        }
    }

    async fn dispatch_one(&self, handle: &SinkHandle, items: &[QueueItem]) -> (String, bool, bool) {
        let deadline = Instant::now() + handle.timeout;
        let name = handle.name().to_string();
        match handle.sink.send(items, deadline).await {
            Ok(()) => {
                handle.breaker.record_success();
                handle.batch_size.record_success();
                metrics().batches_sent_total.with_label_values(&[name.as_str()]).inc();
                (name, handle.required, true)
            },
            Err(e) => {
                handle.breaker.record_failure();
                if matches!(
                    e.kind,
                    SinkErrorKind::PayloadTooLarge | SinkErrorKind::RateLimited | SinkErrorKind::Timeout
                ) {
                    handle.batch_size.record_shrink_trigger();
                }
                metrics().batches_failed_total.with_label_values(&[name.as_str()]).inc();
                tracing::warn!(sink = %name, error = %e, "sink send failed");
                (name, handle.required, false)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use streamship_common::record::{
        Labels,
        Record,
        SourceType,
    };
    use streamship_config::{
        CircuitBreakerConfig,
        SinkKind,
    };

    use super::*;
    use crate::mock::MockSink;

    fn sink_config(name: &str, required: bool) -> SinkConfig {
        SinkConfig {
            name: name.to_string(),
            enabled: true,
            required,
            kind: SinkKind::Local { path: "/tmp/unused".into() },
            batch_size: 10,
            batch_timeout: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_secs(60),
            },
            min_batch: 1,
            max_batch: 100,
            max_idle: 1,
            max_per_host: 1,
            max_total: 1,
        }
    }

    fn item() -> QueueItem {
        QueueItem::new(
            Record::new(
                Duration::from_secs(0),
                b"x".to_vec(),
                SourceType::File,
                Arc::<str>::from("file:a"),
                Labels::new(),
            ),
            Duration::from_secs(0),
        )
    }

    #[tokio::test]
    async fn delivered_when_every_required_sink_succeeds() {
        let mock = Arc::new(MockSink::new("a"));
        let handle = SinkHandle::new(mock.clone(), &sink_config("a", true));
        let router = SinkRouter::new(vec![handle]);

        let outcome = router.dispatch(vec![item()]).await;
        assert!(matches!(outcome, DispatchOutcome::Delivered));
        assert_eq!(mock.received_count(), 1);
    }

    #[tokio::test]
    async fn failed_when_a_required_sink_errors() {
        let mock = Arc::new(MockSink::new("a"));
        mock.inject_failure(crate::SinkSendError::transport("down"));
        let handle = SinkHandle::new(mock, &sink_config("a", true));
        let router = SinkRouter::new(vec![handle]);

        let outcome = router.dispatch(vec![item()]).await;
        match outcome {
            DispatchOutcome::Failed(batch) => assert!(!batch.all_sinks_tripped),
            DispatchOutcome::Delivered => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn optional_sink_failure_does_not_fail_the_batch() {
        let required = Arc::new(MockSink::new("req"));
        let optional = Arc::new(MockSink::new("opt"));
        optional.inject_failure(crate::SinkSendError::transport("down"));

        let router = SinkRouter::new(vec![
            SinkHandle::new(required.clone(), &sink_config("req", true)),
            SinkHandle::new(optional, &sink_config("opt", false)),
        ]);

        let outcome = router.dispatch(vec![item()]).await;
        assert!(matches!(outcome, DispatchOutcome::Delivered));
        assert_eq!(required.received_count(), 1);
    }

    #[tokio::test]
    async fn all_required_sinks_tripped_short_circuits_to_dlq() {
        let mock = Arc::new(MockSink::new("a"));
        mock.inject_failure(crate::SinkSendError::transport("down"));
        let handle = SinkHandle::new(mock, &sink_config("a", true));
        let router = SinkRouter::new(vec![handle]);

        // First dispatch trips the breaker (threshold=1).
        let _ = router.dispatch(vec![item()]).await;
        // Second dispatch should find the breaker open and short-circuit.
        let outcome = router.dispatch(vec![item()]).await;
        match outcome {
            DispatchOutcome::Failed(batch) => assert!(batch.all_sinks_tripped),
            DispatchOutcome::Delivered => panic!("expected failure"),
        }
    }
}
