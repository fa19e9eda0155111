//! `MockSink`: in-memory recorder generalizing the teacher's `MockSink`,
//! used by dispatcher/retry-manager/sink-layer tests to assert delivery and
//! inject failures without network I/O. Unlike the teacher's version this
//! isn't a static global — each instance owns its own buffer, since our
//! tests construct multiple independent sinks rather than reaching through
//! one process-wide fixture.

use std::time::Instant;

use parking_lot::Mutex;
use streamship_common::record::QueueItem;

use crate::{
    Sink,
    SinkErrorKind,
    SinkSendError,
};

pub struct MockSink {
    name: String,
    received: Mutex<Vec<QueueItem>>,
    /// When set, `send` fails with this error instead of recording the
    /// batch, letting tests drive the router/retry-manager failure paths.
    inject_failure: Mutex<Option<SinkSendError>>,
    healthy: Mutex<bool>,
}

impl MockSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            received: Mutex::new(Vec::new()),
            inject_failure: Mutex::new(None),
            healthy: Mutex::new(true),
        }
    }

    pub fn inject_failure(&self, err: SinkSendError) {
        *self.inject_failure.lock() = Some(err);
    }

    pub fn clear_injected_failure(&self) {
        *self.inject_failure.lock() = None;
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock() = healthy;
    }

    pub fn received(&self) -> Vec<QueueItem> {
        self.received.lock().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }
}

#[async_trait::async_trait]
impl Sink for MockSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, batch: &[QueueItem], _deadline: Instant) -> Result<(), SinkSendError> {
        if let Some(err) = self.inject_failure.lock().clone() {
            return Err(err);
        }
        self.received.lock().extend_from_slice(batch);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        *self.healthy.lock()
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
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

    use super::*;

    fn item(n: u8) -> QueueItem {
        QueueItem::new(
            Record::new(
                Duration::from_secs(0),
                vec![n],
                SourceType::File,
                Arc::<str>::from("file:a"),
                Labels::new(),
            ),
            Duration::from_secs(0),
        )
    }

    #[tokio::test]
    async fn records_every_batch_it_receives() {
        let sink = MockSink::new("mock");
        sink.send(&[item(1), item(2)], Instant::now() + Duration::from_secs(1)).await.unwrap();
        assert_eq!(sink.received_count(), 2);
    }

    #[tokio::test]
    async fn injected_failure_is_returned_instead_of_recording() {
        let sink = MockSink::new("mock");
        sink.inject_failure(SinkSendError::transport("boom"));
        let result = sink.send(&[item(1)], Instant::now() + Duration::from_secs(1)).await;
        assert!(result.is_err());
        assert_eq!(sink.received_count(), 0);
    }
}
