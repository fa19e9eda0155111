//! Shared types and runtime abstractions used by every `streamship` crate:
//! the `Record` data model, the injectable `Runtime`, backoff, the typed
//! error split, the metrics registry, and structured lifecycle events.

pub mod backoff;
pub mod error;
pub mod events;
pub mod host;
pub mod metrics;
pub mod record;
pub mod runtime;

pub use backoff::Backoff;
pub use error::{
    report_error,
    report_error_sync,
    StreamshipError,
};
pub use host::hostname;
pub use record::{
    Fields,
    FieldValue,
    Labels,
    Record,
    SourceType,
};
pub use runtime::Runtime;
