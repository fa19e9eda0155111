//! `MessageBusSink`: a stub adapter over an injected [`BusPublisher`].
//!
//! The concrete bus protocol (Kafka, NATS, etc.) is the external
//! collaborator named in `spec.md` §1 — out of scope here. What belongs to
//! the core is the `Sink` wiring around it: encoding, deadline handling, and
//! turning a publish failure into the same retryable/terminal classification
//! every other sink reports.

use std::time::Instant;

use async_trait::async_trait;
use streamship_common::record::QueueItem;

use crate::{
    encode::encode_batch_json_array,
    Sink,
    SinkErrorKind,
    SinkSendError,
};

/// What a concrete message-bus client plugs in. `publish` gets the already
/// JSON-encoded batch; it owns its own connection/partitioning/compression
/// concerns entirely outside this crate.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), anyhow::Error>;
}

pub struct MessageBusSink {
    name: String,
    topic: String,
    publisher: Box<dyn BusPublisher>,
}

impl MessageBusSink {
    pub fn new(name: impl Into<String>, topic: impl Into<String>, publisher: Box<dyn BusPublisher>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            publisher,
        }
    }
}

#[async_trait]
impl Sink for MessageBusSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, batch: &[QueueItem], deadline: Instant) -> Result<(), SinkSendError> {
        let payload = encode_batch_json_array(batch)
            .map_err(|e| SinkSendError::new(SinkErrorKind::Client, false, e.to_string()))?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, self.publisher.publish(&self.topic, &payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SinkSendError::new(SinkErrorKind::Server, true, e.to_string())),
            Err(_) => Err(SinkSendError::timeout(format!("publishing to topic {} exceeded deadline", self.topic))),
        }
    }

    fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    };

    use streamship_common::record::{
        Labels,
        Record,
        SourceType,
    };
    use tokio::time::Duration;

    use super::*;

    struct CountingPublisher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl BusPublisher for CountingPublisher {
        async fn publish(&self, _topic: &str, _payload: &[u8]) -> Result<(), anyhow::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("publish failed");
            }
            Ok(())
        }
    }

    fn item() -> QueueItem {
        QueueItem::new(
            Record::new(
                Duration::from_secs(0),
                b"hi".to_vec(),
                SourceType::File,
                Arc::<str>::from("file:a"),
                Labels::new(),
            ),
            Duration::from_secs(0),
        )
    }

    #[tokio::test]
    async fn publishes_the_encoded_batch() {
        let publisher = Arc::new(CountingPublisher {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let sink = MessageBusSink::new("bus", "topic", Box::new(CountingPublisherHandle(publisher.clone())));
        sink.send(&[item()], Instant::now() + Duration::from_secs(1)).await.unwrap();
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_failure_is_reported_as_retryable_server_error() {
        let publisher = Arc::new(CountingPublisher {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let sink = MessageBusSink::new("bus", "topic", Box::new(CountingPublisherHandle(publisher)));
        let err = sink.send(&[item()], Instant::now() + Duration::from_secs(1)).await.unwrap_err();
        assert!(err.retryable);
    }

    struct CountingPublisherHandle(Arc<CountingPublisher>);

    #[async_trait]
    impl BusPublisher for CountingPublisherHandle {
        async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), anyhow::Error> {
            self.0.publish(topic, payload).await
        }
    }
}
