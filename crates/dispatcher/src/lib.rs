//! Dispatcher Queue + Batcher (C6 + C7, `spec.md` §4.6-4.7).
//!
//! [`DispatcherQueue`] is the single point of serialization between the
//! pipeline (producer) and `worker_count` independent batch collectors.
//! [`collect_batch`] is the pure collection algorithm; [`spawn_workers`]
//! wires `worker_count` of them up with the injected [`Runtime`] and hands
//! each finished batch to `output` for the retry/sink layer to consume.

mod batcher;
mod queue;

use std::{
    sync::Arc,
    time::Duration,
};

pub use batcher::{
    collect_batch,
    CollectedBatch,
};
pub use queue::DispatcherQueue;
use streamship_common::Runtime;
use tokio::sync::{
    mpsc,
    watch,
};

/// Spawns `worker_count` independent batch collectors, each running
/// `collect_batch` in a loop and forwarding completed batches on `output`.
/// Returns once every worker has exited (on `shutdown` or `output` closing).
pub async fn spawn_workers<R: Runtime>(
    queue: Arc<DispatcherQueue>,
    worker_count: usize,
    max_size: usize,
    max_wait: Duration,
    runtime: R,
    output: mpsc::Sender<CollectedBatch>,
    shutdown: watch::Receiver<bool>,
) {
    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let queue = queue.clone();
        let runtime = runtime.clone();
        let output = output.clone();
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let Some(batch) = collect_batch(&queue, max_size, max_wait, &runtime, &mut shutdown).await else {
                    return;
                };
                if output.send(batch).await.is_err() {
                    return;
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use streamship_common::{
        record::{
            Labels,
            QueueItem,
            Record,
            SourceType,
        },
        runtime::testing::TestRuntime,
    };
    use streamship_config::BackpressurePolicy;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn workers_drain_the_queue_concurrently() {
        let queue = Arc::new(DispatcherQueue::new(100, BackpressurePolicy::Block));
        for i in 0..20u8 {
            queue
                .enqueue(QueueItem::new(
                    Record::new(
                        Duration::from_secs(0),
                        vec![i],
                        SourceType::File,
                        Arc::<str>::from("file:a"),
                        Labels::new(),
                    ),
                    Duration::from_secs(0),
                ))
                .await;
        }

        let (output_tx, mut output_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runtime = TestRuntime::new();

        let workers = tokio::spawn(spawn_workers(
            queue.clone(),
            4,
            5,
            Duration::from_millis(50),
            runtime,
            output_tx,
            shutdown_rx,
        ));

        let mut collected = 0;
        while collected < 20 {
            let batch = output_rx.recv().await.unwrap();
            collected += batch.records.len();
        }

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), workers).await.unwrap().unwrap();
    }
}
