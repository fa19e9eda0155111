//! Retry Manager (C8, `spec.md` §4.8) — the core of correct failure
//! handling: a single mutex-protected vector of `retry_entry{item, ready_at,
//! attempt}`, ticked every 100 ms. Ready entries are reinjected into the
//! dispatcher queue with a non-blocking send; the whole structure is bounded
//! by `max_retry_queue_size` regardless of how long a downstream outage
//! lasts.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::Duration,
};

use dispatcher::DispatcherQueue;
use dlq::Dlq;
use parking_lot::Mutex;
use streamship_common::{
    metrics::metrics,
    record::QueueItem,
    Backoff,
    Runtime,
};
use streamship_config::{
    DispatcherConfig,
    DropPolicy,
};
use tokio::sync::{
    mpsc,
    watch,
};

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// A batch the sink layer gave up on. `all_sinks_tripped` means every
/// required sink had its circuit breaker open at dispatch time, in which
/// case the Retry Manager skips reinjection entirely (`spec.md` §4.8
/// "circuit-breaker interaction").
pub struct FailedBatch {
    pub items: Vec<QueueItem>,
    pub all_sinks_tripped: bool,
}

struct RetryEntry {
    item: QueueItem,
    /// A `tokio::time::Instant` rather than a wall-clock timestamp: under
    /// `#[tokio::test(start_paused = true)]` this advances in lockstep with
    /// `Runtime::wait`'s sleeps, so scheduling is deterministic in tests
    /// without needing a second injectable clock.
    ready_at: tokio::time::Instant,
}

pub struct RetryManager<R: Runtime> {
    queue: Arc<DispatcherQueue>,
    dlq: Arc<Dlq>,
    config: DispatcherConfig,
    runtime: R,
    entries: Mutex<VecDeque<RetryEntry>>,
}

impl<R: Runtime> RetryManager<R> {
    pub fn new(queue: Arc<DispatcherQueue>, dlq: Arc<Dlq>, config: DispatcherConfig, runtime: R) -> Self {
        Self {
            queue,
            dlq,
            config,
            runtime,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Drives the retry manager until `shutdown` fires or `failed` closes.
    /// One tick timer is pinned per 100 ms interval so a steady stream of
    /// incoming `FailedBatch`es can never starve the reinjection tick —
    /// same discipline as the dispatcher batcher's `max_wait` timer.
    pub async fn run(&self, mut failed: mpsc::Receiver<FailedBatch>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let timer = self.runtime.wait(TICK_INTERVAL);
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    batch = failed.recv() => {
                        match batch {
                            Some(batch) => self.handle_failed_batch(batch),
                            None => return,
                        }
                    },
                    _ = &mut timer => break,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    },
                }
            }
            self.tick().await;
        }
    }

    fn handle_failed_batch(&self, batch: FailedBatch) {
        if batch.all_sinks_tripped {
            if let Err(e) = self.dlq.write_batch(&batch.items, "all_sinks_failed") {
                tracing::error!("failed writing all_sinks_failed batch to dlq: {e:#}");
            }
            return;
        }
        for item in batch.items {
            self.handle_failed_item(item);
        }
    }

    fn handle_failed_item(&self, item: QueueItem) {
        if item.retries >= self.config.max_retries {
            if let Err(e) = self.dlq.write_batch(&[item], "max_retries_exceeded") {
                tracing::error!("failed writing max_retries_exceeded item to dlq: {e:#}");
            }
            return;
        }

        let mut rng = self.runtime.rng();
        let delay = Backoff::delay_for_attempt(
            self.config.initial_delay,
            self.config.max_delay,
            self.config.multiplier,
            item.retries,
            &mut rng,
        );
        let retries = item.retries + 1;
        let entry = RetryEntry {
            item: QueueItem::with_retries(item.record, item.enqueued_at, retries),
            ready_at: tokio::time::Instant::now() + delay,
        };

        let mut entries = self.entries.lock();
        if entries.len() >= self.config.max_retry_queue_size {
            match self.config.drop_policy {
                DropPolicy::Oldest => {
                    let oldest_idx = entries
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, e)| e.ready_at)
                        .map(|(i, _)| i);
                    if let Some(dropped) = oldest_idx.and_then(|i| entries.remove(i)) {
                        metrics().records_dropped_total.with_label_values(&["retry_queue_full"]).inc();
                        if let Err(e) = self.dlq.write_batch(&[dropped.item], "queue_full_on_retry") {
                            tracing::error!("failed writing queue_full_on_retry item to dlq: {e:#}");
                        }
                    }
                    entries.push_back(entry);
                },
                DropPolicy::Newest => {
                    metrics().records_dropped_total.with_label_values(&["retry_queue_full"]).inc();
                    if let Err(e) = self.dlq.write_batch(&[entry.item], "queue_full_on_retry") {
                        tracing::error!("failed writing queue_full_on_retry item to dlq: {e:#}");
                    }
                },
            }
            metrics().retry_queue_depth.set(entries.len() as i64);
            return;
        }
        entries.push_back(entry);
        metrics().retry_queue_depth.set(entries.len() as i64);
    }

    async fn tick(&self) {
        let now = tokio::time::Instant::now();
        let ready: Vec<RetryEntry> = {
            let mut entries = self.entries.lock();
            let mut ready = Vec::new();
            let mut remaining = VecDeque::with_capacity(entries.len());
            for entry in entries.drain(..) {
                if entry.ready_at <= now {
                    ready.push(entry);
                } else {
                    remaining.push_back(entry);
                }
            }
            *entries = remaining;
            metrics().retry_queue_depth.set(entries.len() as i64);
            ready
        };

        for entry in ready {
            metrics().retry_attempts_total.inc();
            if let Err(rejected) = self.queue.try_enqueue(entry.item).await {
                if let Err(e) = self.dlq.write_batch(&[rejected], "queue_full_on_retry") {
                    tracing::error!("failed writing queue_full_on_retry item to dlq: {e:#}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dlq::Dlq;
    use streamship_common::{
        record::{
            Labels,
            Record,
            SourceType,
        },
        runtime::testing::TestRuntime,
    };
    use streamship_config::{
        BackpressurePolicy,
        DlqConfig,
    };
    use tempfile::tempdir;

    use super::*;

    fn item(n: u8, retries: u32) -> QueueItem {
        QueueItem::with_retries(
            Record::new(
                Duration::from_secs(0),
                vec![n],
                SourceType::File,
                Arc::<str>::from("file:a"),
                Labels::new(),
            ),
            Duration::from_secs(0),
            retries,
        )
    }

    fn dispatcher_config() -> DispatcherConfig {
        DispatcherConfig {
            queue_size: 10,
            worker_count: 1,
            batch_size: 10,
            batch_timeout: Duration::from_secs(1),
            backpressure_policy: BackpressurePolicy::Block,
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_retry_queue_size: 2,
            drop_policy: DropPolicy::Oldest,
        }
    }

    fn dlq_config(dir: &std::path::Path) -> DlqConfig {
        DlqConfig {
            directory: dir.to_path_buf(),
            max_bytes: 1024 * 1024,
            max_age: Duration::from_secs(3600),
            segment_max_bytes: 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn item_past_max_retries_goes_straight_to_dlq() {
        let dir = tempdir().unwrap();
        let dlq = Arc::new(Dlq::open(dlq_config(dir.path())).unwrap());
        let queue = Arc::new(DispatcherQueue::new(10, BackpressurePolicy::Block));
        let manager = RetryManager::new(queue.clone(), dlq, dispatcher_config(), TestRuntime::new());

        manager.handle_failed_batch(FailedBatch {
            items: vec![item(1, 3)],
            all_sinks_tripped: false,
        });

        assert_eq!(manager.entries.lock().len(), 0);
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn item_under_max_retries_is_scheduled_with_incremented_retries() {
        let dir = tempdir().unwrap();
        let dlq = Arc::new(Dlq::open(dlq_config(dir.path())).unwrap());
        let queue = Arc::new(DispatcherQueue::new(10, BackpressurePolicy::Block));
        let manager = RetryManager::new(queue, dlq, dispatcher_config(), TestRuntime::new());

        manager.handle_failed_batch(FailedBatch {
            items: vec![item(1, 0)],
            all_sinks_tripped: false,
        });

        let entries = manager.entries.lock();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].item.retries, 1);
    }

    #[tokio::test]
    async fn all_sinks_tripped_batch_bypasses_retry_entirely() {
        let dir = tempdir().unwrap();
        let dlq = Arc::new(Dlq::open(dlq_config(dir.path())).unwrap());
        let queue = Arc::new(DispatcherQueue::new(10, BackpressurePolicy::Block));
        let manager = RetryManager::new(queue, dlq, dispatcher_config(), TestRuntime::new());

        manager.handle_failed_batch(FailedBatch {
            items: vec![item(1, 0), item(2, 0)],
            all_sinks_tripped: true,
        });

        assert_eq!(manager.entries.lock().len(), 0);
    }

    #[tokio::test]
    async fn full_retry_queue_with_oldest_policy_evicts_the_soonest_ready_entry() {
        let dir = tempdir().unwrap();
        let dlq = Arc::new(Dlq::open(dlq_config(dir.path())).unwrap());
        let queue = Arc::new(DispatcherQueue::new(10, BackpressurePolicy::Block));
        let mut config = dispatcher_config();
        config.max_retry_queue_size = 1;
        let manager = RetryManager::new(queue, dlq, config, TestRuntime::new());

        manager.handle_failed_item(item(1, 0));
        assert_eq!(manager.entries.lock().len(), 1);

        manager.handle_failed_item(item(2, 0));
        // still bounded at 1: the original entry was evicted to the DLQ
        assert_eq!(manager.entries.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_reinjects_a_failed_batch_then_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let dlq = Arc::new(Dlq::open(dlq_config(dir.path())).unwrap());
        let queue = Arc::new(DispatcherQueue::new(10, BackpressurePolicy::Block));
        let manager = Arc::new(RetryManager::new(queue.clone(), dlq, dispatcher_config(), TestRuntime::new()));

        let (failed_tx, failed_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let running = manager.clone();
        let handle = tokio::spawn(async move { running.run(failed_rx, shutdown_rx).await });

        failed_tx
            .send(FailedBatch {
                items: vec![item(1, 0)],
                all_sinks_tripped: false,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.len().await, 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn tick_reinjects_entries_once_ready() {
        let dir = tempdir().unwrap();
        let dlq = Arc::new(Dlq::open(dlq_config(dir.path())).unwrap());
        let queue = Arc::new(DispatcherQueue::new(10, BackpressurePolicy::Block));
        let runtime = TestRuntime::new();
        let manager = RetryManager::new(queue.clone(), dlq, dispatcher_config(), runtime.clone());

        {
            let mut entries = manager.entries.lock();
            entries.push_back(RetryEntry {
                item: item(1, 1),
                ready_at: tokio::time::Instant::now(),
            });
        }

        manager.tick().await;
        assert_eq!(manager.entries.lock().len(), 0);
        assert_eq!(queue.len().await, 1);
    }
}
