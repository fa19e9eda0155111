//! Dispatcher Queue (C6, `spec.md` §4.6): a bounded FIFO that is the single
//! point of serialization between producers (the pipeline) and workers. On
//! enqueue past capacity, the configured backpressure policy decides
//! whether the producer waits, or the newest/oldest item is dropped.

use std::collections::VecDeque;

use streamship_common::{
    metrics::metrics,
    record::QueueItem,
};
use streamship_config::BackpressurePolicy;
use tokio::sync::{
    Mutex,
    Notify,
};

pub struct DispatcherQueue {
    capacity: usize,
    policy: BackpressurePolicy,
    items: Mutex<VecDeque<QueueItem>>,
    item_available: Notify,
    space_available: Notify,
}

impl DispatcherQueue {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        metrics().queue_capacity.set(capacity as i64);
        Self {
            capacity,
            policy,
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            item_available: Notify::new(),
            space_available: Notify::new(),
        }
    }

    async fn set_depth(&self, len: usize) {
        metrics().queue_depth.set(len as i64);
    }

    /// Enqueues `item`, applying the configured backpressure policy when
    /// the queue is at capacity: `block` waits for space, `drop_newest`
    /// discards `item` itself, `drop_oldest` discards the head of the
    /// queue to make room.
    pub async fn enqueue(&self, item: QueueItem) {
        loop {
            let mut items = self.items.lock().await;
            if items.len() < self.capacity {
                items.push_back(item);
                let len = items.len();
                drop(items);
                self.set_depth(len).await;
                self.item_available.notify_one();
                return;
            }

            match self.policy {
                BackpressurePolicy::Block => {
                    drop(items);
                    self.space_available.notified().await;
                    continue;
                },
                BackpressurePolicy::DropNewest => {
                    drop(items);
                    metrics().records_dropped_total.with_label_values(&["backpressure_drop_newest"]).inc();
                    return;
                },
                BackpressurePolicy::DropOldest => {
                    items.pop_front();
                    items.push_back(item);
                    let len = items.len();
                    drop(items);
                    self.set_depth(len).await;
                    metrics().records_dropped_total.with_label_values(&["backpressure_drop_oldest"]).inc();
                    self.item_available.notify_one();
                    return;
                },
            }
        }
    }

    /// Non-blocking enqueue used by the retry manager's reinjection path,
    /// which must never block (`spec.md` §4.8): returns `Err(item)` if
    /// the queue is full regardless of backpressure policy.
    pub async fn try_enqueue(&self, item: QueueItem) -> Result<(), QueueItem> {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        let len = items.len();
        drop(items);
        self.set_depth(len).await;
        self.item_available.notify_one();
        Ok(())
    }

    /// Blocks until an item is available.
    pub async fn dequeue(&self) -> QueueItem {
        loop {
            let mut items = self.items.lock().await;
            if let Some(item) = items.pop_front() {
                let len = items.len();
                drop(items);
                self.set_depth(len).await;
                self.space_available.notify_one();
                return item;
            }
            drop(items);
            self.item_available.notified().await;
        }
    }

    pub async fn try_dequeue(&self) -> Option<QueueItem> {
        let mut items = self.items.lock().await;
        let item = items.pop_front();
        if item.is_some() {
            let len = items.len();
            drop(items);
            self.set_depth(len).await;
            self.space_available.notify_one();
        }
        item
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
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
    async fn fifo_order_is_preserved() {
        let queue = DispatcherQueue::new(10, BackpressurePolicy::Block);
        queue.enqueue(item(1)).await;
        queue.enqueue(item(2)).await;
        assert_eq!(queue.dequeue().await.record.message[0], 1);
        assert_eq!(queue.dequeue().await.record.message[0], 2);
    }

    #[tokio::test]
    async fn drop_newest_discards_the_incoming_item_when_full() {
        let queue = DispatcherQueue::new(1, BackpressurePolicy::DropNewest);
        queue.enqueue(item(1)).await;
        queue.enqueue(item(2)).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.dequeue().await.record.message[0], 1);
    }

    #[tokio::test]
    async fn drop_oldest_discards_the_head_when_full() {
        let queue = DispatcherQueue::new(1, BackpressurePolicy::DropOldest);
        queue.enqueue(item(1)).await;
        queue.enqueue(item(2)).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.dequeue().await.record.message[0], 2);
    }

    #[tokio::test]
    async fn try_enqueue_fails_without_dropping_anything_when_full() {
        let queue = DispatcherQueue::new(1, BackpressurePolicy::Block);
        queue.enqueue(item(1)).await;
        let rejected = queue.try_enqueue(item(2)).await;
        assert!(rejected.is_err());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn blocked_enqueue_unblocks_once_space_frees_up() {
        let queue = Arc::new(DispatcherQueue::new(1, BackpressurePolicy::Block));
        queue.enqueue(item(1)).await;

        let blocked = queue.clone();
        let producer = tokio::spawn(async move {
            blocked.enqueue(item(2)).await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.dequeue().await.record.message[0], 1);
        tokio::time::timeout(Duration::from_secs(1), producer).await.unwrap().unwrap();
        assert_eq!(queue.dequeue().await.record.message[0], 2);
    }
}
