//! Batcher (C7, `spec.md` §4.7): each worker runs its own collector —
//! block for the first item, then keep collecting until `max_size` records
//! are in hand or `max_wait` elapses. The timer is constructed fresh for
//! every call and dropped when the call returns, so it can neither leak
//! across batches nor carry over a stale deadline.

use std::time::Duration;

use streamship_common::{
    record::QueueItem,
    Runtime,
};
use tokio::sync::watch;

use crate::queue::DispatcherQueue;

/// One collected batch and whether `max_wait` (rather than `max_size` or
/// shutdown) is what ended collection.
pub struct CollectedBatch {
    pub records: Vec<QueueItem>,
    pub timed_out: bool,
}

/// Returns `None` only when `shutdown` fired before a first record arrived.
pub async fn collect_batch<R: Runtime>(
    queue: &DispatcherQueue,
    max_size: usize,
    max_wait: Duration,
    runtime: &R,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<CollectedBatch> {
    let first = tokio::select! {
        record = queue.dequeue() => record,
        _ = shutdown.changed() => return None,
    };

    let mut records = Vec::with_capacity(max_size);
    records.push(first);

    let timer = runtime.wait(max_wait);
    tokio::pin!(timer);
    let mut timed_out = false;

    while records.len() < max_size {
        tokio::select! {
            record = queue.dequeue() => records.push(record),
            _ = &mut timer => {
                timed_out = true;
                break;
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            },
        }
    }

    Some(CollectedBatch { records, timed_out })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use streamship_common::{
        record::{
            Labels,
            Record,
            SourceType,
        },
        runtime::testing::TestRuntime,
    };

    use super::*;

    fn record(n: u8) -> QueueItem {
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

    #[tokio::test(start_paused = true)]
    async fn stops_at_max_size_without_waiting_for_the_timer() {
        let queue = DispatcherQueue::new(10, streamship_config::BackpressurePolicy::Block);
        queue.enqueue(record(1)).await;
        queue.enqueue(record(2)).await;
        let (_tx, mut shutdown) = watch::channel(false);
        let runtime = TestRuntime::new();

        let batch = collect_batch(&queue, 2, Duration::from_secs(10), &runtime, &mut shutdown)
            .await
            .unwrap();
        assert_eq!(batch.records.len(), 2);
        assert!(!batch.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_flushes_a_partial_batch() {
        let queue = Arc::new(DispatcherQueue::new(10, streamship_config::BackpressurePolicy::Block));
        queue.enqueue(record(1)).await;
        let (_tx, mut shutdown) = watch::channel(false);
        let runtime = TestRuntime::new();

        let batch = collect_batch(&queue, 10, Duration::from_millis(50), &runtime, &mut shutdown)
            .await
            .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert!(batch.timed_out);
    }

    #[tokio::test]
    async fn shutdown_before_first_record_returns_none() {
        let queue = DispatcherQueue::new(10, streamship_config::BackpressurePolicy::Block);
        let (tx, mut shutdown) = watch::channel(false);
        let runtime = TestRuntime::new();
        tx.send(true).unwrap();

        let batch = collect_batch(&queue, 10, Duration::from_secs(10), &runtime, &mut shutdown).await;
        assert!(batch.is_none());
    }
}
