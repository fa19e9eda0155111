//! Structured lifecycle events. The Source Registry (C4) and other
//! components emit these; by default they're logged through `tracing` and
//! tallied into the metrics registry ("emits structured lifecycle events
//! consumed by C2/C3 and by metrics", `spec.md` §4.4). No event-bus
//! transport is implemented — the metrics/HTTP admin surface that would
//! subscribe to these is an external collaborator (`spec.md` §1).

use std::fmt;

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    SourceDiscovered { source_key: String },
    SourceActive { source_key: String },
    SourceRotated { source_key: String, old_inode: u64, new_inode: u64 },
    SourceTruncated { source_key: String },
    SourceClosed { source_key: String },
    SourceErrored { source_key: String, reason: String },
    PositionCorruptionDetected { source_key: String },
    PositionSaveFailed { reason: String },
    DeduplicatedRecord { source_key: String },
    RecordDeadLettered { source_id: String, reason: String },
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::SourceDiscovered { source_key } => {
                write!(f, "source_discovered source_key={source_key}")
            },
            LifecycleEvent::SourceActive { source_key } => {
                write!(f, "source_active source_key={source_key}")
            },
            LifecycleEvent::SourceRotated {
                source_key,
                old_inode,
                new_inode,
            } => write!(
                f,
                "source_rotated source_key={source_key} old_inode={old_inode} new_inode={new_inode}"
            ),
            LifecycleEvent::SourceTruncated { source_key } => {
                write!(f, "source_truncated source_key={source_key}")
            },
            LifecycleEvent::SourceClosed { source_key } => {
                write!(f, "source_closed source_key={source_key}")
            },
            LifecycleEvent::SourceErrored { source_key, reason } => {
                write!(f, "source_errored source_key={source_key} reason={reason}")
            },
            LifecycleEvent::PositionCorruptionDetected { source_key } => {
                write!(f, "position_corruption_detected source_key={source_key}")
            },
            LifecycleEvent::PositionSaveFailed { reason } => {
                write!(f, "position_save_failed reason={reason}")
            },
            LifecycleEvent::DeduplicatedRecord { source_key } => {
                write!(f, "deduplicated_total source_key={source_key}")
            },
            LifecycleEvent::RecordDeadLettered { source_id, reason } => {
                write!(f, "record_dead_lettered source_id={source_id} reason={reason}")
            },
        }
    }
}

pub fn emit(event: LifecycleEvent) {
    match &event {
        LifecycleEvent::SourceErrored { .. } | LifecycleEvent::PositionSaveFailed { .. } => {
            tracing::warn!("{event}");
        },
        LifecycleEvent::PositionCorruptionDetected { .. } => {
            crate::metrics::metrics().position_corruption_detected_total.inc();
            tracing::error!("{event}");
        },
        LifecycleEvent::SourceTruncated { .. } => {
            crate::metrics::metrics().position_truncation_detected_total.inc();
            tracing::info!("{event}");
        },
        LifecycleEvent::RecordDeadLettered { reason, .. } => {
            crate::metrics::metrics().dlq_entries_total.with_label_values(&[reason.as_str()]).inc();
            tracing::warn!("{event}");
        },
        _ => tracing::info!("{event}"),
    }
}
