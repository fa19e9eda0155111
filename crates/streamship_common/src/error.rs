//! Typed errors for branches callers act on programmatically. Everything
//! else ("this failed, log it, back off, retry") stays `anyhow::Error`, the
//! same split the teacher draws between its `errors::ErrorMetadata` crate and
//! plain `anyhow` contexts in `log_streaming`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamshipError {
    #[error("position store corrupted for source {source_key}: {reason}")]
    PositionCorruption { source_key: String, reason: String },

    #[error("sink {sink} send failed (retryable={retryable}): {message}")]
    SinkSend {
        sink: String,
        retryable: bool,
        message: String,
    },

    #[error("configuration error at `{key}`: {message}")]
    Config { key: String, message: String },

    #[error("retry queue at capacity ({capacity}); dropping to DLQ")]
    RetryQueueFull { capacity: usize },

    #[error("dead-letter queue write failed: {0}")]
    DlqWrite(String),
}

impl StreamshipError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamshipError::SinkSend { retryable: true, .. })
    }
}

/// Central error-observability hook, mirroring `common::errors::report_error`
/// in the teacher. The default implementation only logs; a caller that wants
/// to forward errors to an external error-tracking service plugs in there —
/// that transport is an external collaborator per `spec.md` §1.
pub fn report_error(err: &anyhow::Error) {
    tracing::error!(error = %err, "{:#}", err);
}

pub fn report_error_sync(err: &anyhow::Error) {
    report_error(err)
}
