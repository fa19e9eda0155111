//! Sink Layer (C9, `spec.md` §4.9).
//!
//! [`Sink`] is the per-destination contract every adapter implements:
//! `send`/`is_healthy`/`close`. [`router::SinkRouter`] owns the fan-out
//! batch-dispatch policy (share the batch with every healthy sink in
//! parallel, require every *required* sink to succeed) and turns a failed
//! dispatch into a [`retry_manager::FailedBatch`] for the retry manager to
//! pick up. Each [`SinkHandle`] pairs one `Sink` with its own
//! [`circuit_breaker::CircuitBreaker`] and [`batch_size::BatchSizeController`],
//! grounded in the teacher's `log_streaming::sinks` module.

mod batch_size;
mod circuit_breaker;
mod encode;
mod http;
mod local_file;
mod message_bus;
#[cfg(any(test, feature = "testing"))]
mod mock;
mod router;

use std::time::Instant;

use async_trait::async_trait;
pub use batch_size::BatchSizeController;
pub use circuit_breaker::{
    BreakerState,
    CircuitBreaker,
};
pub use http::HttpSink;
pub use local_file::LocalFileSink;
pub use message_bus::{
    BusPublisher,
    MessageBusSink,
};
#[cfg(any(test, feature = "testing"))]
pub use mock::MockSink;
pub use router::{
    DispatchOutcome,
    SinkHandle,
    SinkRouter,
};
use streamship_common::record::QueueItem;

/// Error classification a sink adapter reports back so the router (and,
/// downstream, the retry manager) can decide retry vs. DLQ without knowing
/// anything about the wire protocol involved.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkErrorKind {
    /// Connection refused/reset, DNS failure, or anything else below the
    /// application layer.
    Transport,
    /// The deadline passed before the sink could complete the send.
    Timeout,
    /// 5xx or local-adapter-equivalent ("disk full", "remote unavailable").
    Server,
    /// 4xx other than 429/413, or a local-adapter-equivalent permanent
    /// rejection (e.g. malformed payload the destination will never accept).
    Client,
    /// 429 / overloaded.
    RateLimited,
    /// 413, or a local-adapter-equivalent "too big to accept".
    PayloadTooLarge,
    /// The destination rejected records as too old; carries the oldest
    /// accepted age it reported, if any, for the learning loop in
    /// [`http::HttpSink`].
    TimestampRejected { max_acceptable_age: Option<std::time::Duration> },
}

#[derive(Debug, Clone)]
pub struct SinkSendError {
    pub kind: SinkErrorKind,
    pub retryable: bool,
    pub message: String,
}

impl SinkSendError {
    pub fn new(kind: SinkErrorKind, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable,
            message: message.into(),
        }
    }

    /// Transport errors, 5xx, 429 and connection resets are retryable;
    /// 4xx other than 429 is terminal (`spec.md` §4.9). A 413 is retryable
    /// unless the batch is already a single record — splitting further is
    /// impossible, so "payload-too-large-after-splitting" is terminal.
    pub fn classify_http_status(status: u16, batch_len: usize, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => Self::new(SinkErrorKind::RateLimited, true, message),
            413 => Self::new(SinkErrorKind::PayloadTooLarge, batch_len > 1, message),
            500..=599 => Self::new(SinkErrorKind::Server, true, message),
            400..=499 => Self::new(SinkErrorKind::Client, false, message),
            _ => Self::new(SinkErrorKind::Server, true, message),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(SinkErrorKind::Transport, true, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SinkErrorKind::Timeout, true, message)
    }
}

impl std::fmt::Display for SinkSendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (retryable={}): {}", self.kind, self.retryable, self.message)
    }
}

impl std::error::Error for SinkSendError {}

/// Per-destination contract (`spec.md` §4.9). Implementors must not mutate
/// the batch they're handed — `Record`/`Labels`/`Fields` are already
/// read-only-after-construction, but the contract is restated here because
/// a batch is shared by reference across every sink fan-out to.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, batch: &[QueueItem], deadline: Instant) -> Result<(), SinkSendError>;

    /// Best-effort, non-blocking: a `false` here never stops a send from
    /// being attempted, it only informs the batch-size/circuit-breaker
    /// heuristics that live alongside each sink's `SinkHandle`.
    fn is_healthy(&self) -> bool;

    async fn close(&self) -> anyhow::Result<()>;
}
