//! The `Record` data model (`spec.md` §3).
//!
//! `Labels` and `Fields` are opaque, read-only-after-construction wrappers
//! around shared maps. `spec.md` §9 calls shared mutable labels "the single
//! biggest foot-gun" and mandates an immutable-view abstraction; wrapping the
//! map behind a handle that exposes only `get`/`iter`/`len` makes a sink
//! mutating a record a compile error rather than a code-review rule.

use std::{
    fmt,
    sync::Arc,
    time::Duration,
};

use indexmap::IndexMap;

/// Ordered, small, read-only string map shared by reference across every
/// sink a batch fans out to. Cloning a `Labels` is an `Arc` bump, never a
/// deep copy (`spec.md` §9's "deep-copying a batch per sink" design note).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Labels(Arc<IndexMap<String, String>>);

impl Labels {
    pub fn new() -> Self {
        Self(Arc::new(IndexMap::new()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builder used by sources/pipeline stages; produces a new, independent
    /// `Labels` by merging `self` with `extra`, without mutating anything
    /// already shared with in-flight records.
    pub fn with_extra(&self, extra: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut merged = (*self.0).clone();
        for (k, v) in extra {
            merged.insert(k, v);
        }
        Self(Arc::new(merged))
    }
}

impl FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

/// Scalar field value produced by the pipeline's `parse`/`enrich` stages
/// (`spec.md` §4.5).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(s) => write!(f, "{s}"),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Structured extensions, same read-only-after-enqueue sharing model as
/// `Labels`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Fields(Arc<std::collections::BTreeMap<String, FieldValue>>);

impl Fields {
    pub fn new() -> Self {
        Self(Arc::new(std::collections::BTreeMap::new()))
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn with_extra(&self, extra: impl IntoIterator<Item = (String, FieldValue)>) -> Self {
        let mut merged = (*self.0).clone();
        for (k, v) in extra {
            merged.insert(k, v);
        }
        Self(Arc::new(merged))
    }
}

impl FromIterator<(String, FieldValue)> for Fields {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SourceType {
    File,
    Container,
    Other,
}

/// The unit of work flowing through the pipeline, dispatcher, sinks and DLQ.
///
/// Invariants (`spec.md` §3): `source_id` is non-empty; `message` length is
/// bounded by the pipeline's configured maximum; once a `Record` has been
/// handed to the dispatcher queue it is never mutated again — every stage
/// downstream of C6 that wants to "change" a record builds a new one.
#[derive(Clone, Debug)]
pub struct Record {
    pub timestamp: Duration,
    pub message: Arc<[u8]>,
    pub source_type: SourceType,
    pub source_id: Arc<str>,
    pub labels: Labels,
    pub fields: Fields,
    pub fingerprint: Option<u64>,
    pub trace_id: Option<Arc<str>>,
    pub span_id: Option<Arc<str>>,
}

impl Record {
    pub fn new(
        timestamp: Duration,
        message: impl Into<Arc<[u8]>>,
        source_type: SourceType,
        source_id: impl Into<Arc<str>>,
        labels: Labels,
    ) -> Self {
        Self {
            timestamp,
            message: message.into(),
            source_type,
            source_id: source_id.into(),
            labels,
            fields: Fields::new(),
            fingerprint: None,
            trace_id: None,
            span_id: None,
        }
    }

    pub fn message_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.message)
    }

    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_fingerprint(mut self, fp: u64) -> Self {
        self.fingerprint = Some(fp);
        self
    }
}

/// The unit that actually flows through the Dispatcher Queue (`spec.md`
/// §3's "Queue item": `{record, source_key, retries, enqueued_at}`).
/// `source_key` is not duplicated as its own field since it is exactly
/// `record.source_id`; `retries` is incremented only by the Retry Manager.
#[derive(Clone, Debug)]
pub struct QueueItem {
    pub record: Record,
    pub retries: u32,
    pub enqueued_at: Duration,
}

impl QueueItem {
    pub fn new(record: Record, enqueued_at: Duration) -> Self {
        Self {
            record,
            retries: 0,
            enqueued_at,
        }
    }

    pub fn with_retries(record: Record, enqueued_at: Duration, retries: u32) -> Self {
        Self {
            record,
            retries,
            enqueued_at,
        }
    }

    pub fn source_key(&self) -> &str {
        &self.record.source_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_with_extra_does_not_mutate_original() {
        let base: Labels = [("host".to_string(), "a".to_string())]
            .into_iter()
            .collect();
        let extended = base.with_extra([("path".to_string(), "/var/log/x".to_string())]);
        assert_eq!(base.len(), 1);
        assert_eq!(extended.len(), 2);
        assert_eq!(extended.get("host"), Some("a"));
        assert_eq!(extended.get("path"), Some("/var/log/x"));
    }

    #[test]
    fn record_invariant_nonempty_source_id() {
        let labels = Labels::new();
        let record = Record::new(
            Duration::from_secs(1),
            b"hello".to_vec(),
            SourceType::File,
            "file:/var/log/a.log#123",
            labels,
        );
        assert!(!record.source_id.is_empty());
    }
}
