//! The queue of results the node still has to run.
//!
//! The queue is fed by the event channel (a single task at a time) and by a
//! full resync with the server, which replaces the pending items wholesale.
//! Results that are being started or executed are tracked as in-flight until
//! their outcome is reported, so a resync never hands them out a second time.

use std::{
    collections::{HashSet, VecDeque},
    time::Duration,
};

use tokio::{
    sync::{Mutex, Notify},
    time,
};
use tracing::debug;
use vantage6_core::TaskResult;

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<TaskResult>,
    queued: HashSet<u64>,
    in_flight: HashSet<u64>,
}

impl Inner {
    fn push(&mut self, item: TaskResult) -> bool {
        if self.in_flight.contains(&item.id) || !self.queued.insert(item.id) {
            return false;
        }
        self.items.push_back(item);
        true
    }
}

/// A FIFO of [`TaskResult`]s shared between the producers and the main loop.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `item` to the queue. Returns `false` if the result is queued or
    /// in flight already.
    pub async fn enqueue(&self, item: TaskResult) -> bool {
        let id = item.id;
        let pushed = self.inner.lock().await.push(item);
        if pushed {
            self.notify.notify_one();
        } else {
            debug!("result {} is already queued or running", id);
        }
        pushed
    }

    /// Replaces the pending items with `items`, in order. In-flight results
    /// and duplicates are skipped. Returns the number of queued items.
    pub async fn replace<I>(&self, items: I) -> usize
    where
        I: IntoIterator<Item = TaskResult>,
    {
        let mut inner = self.inner.lock().await;
        let mut fresh = Inner {
            items: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: std::mem::take(&mut inner.in_flight),
        };
        for item in items {
            fresh.push(item);
        }
        *inner = fresh;
        let len = inner.items.len();
        drop(inner);

        if len > 0 {
            self.notify.notify_one();
        }
        len
    }

    /// Takes the oldest item and marks it as in flight. Waits at most
    /// `timeout` for an item to arrive.
    pub async fn pop(&self, timeout: Duration) -> Option<TaskResult> {
        time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(item) = inner.items.pop_front() {
                        inner.queued.remove(&item.id);
                        inner.in_flight.insert(item.id);
                        return item;
                    }
                }
                notified.await;
            }
        })
        .await
        .ok()
    }

    /// Releases the in-flight result `id`.
    pub async fn complete(&self, id: u64) -> bool {
        self.inner.lock().await.in_flight.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// The ids of the pending items, in queue order.
    pub async fn ids(&self) -> Vec<u64> {
        self.inner.lock().await.items.iter().map(|item| item.id).collect()
    }

    pub async fn in_flight(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.lock().await.in_flight.iter().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vantage6_core::TaskRef;

    use super::*;

    fn item(id: u64) -> TaskResult {
        TaskResult {
            id,
            task: TaskRef {
                id: id * 10,
                image: "harbor/average".to_string(),
                collaboration_id: 1,
                job_id: id * 10,
                parent_id: None,
            },
            input: b"input".to_vec(),
            database_label: "default".to_string(),
            run_id: id,
        }
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates() {
        let queue = TaskQueue::new();
        assert!(queue.enqueue(item(1)).await);
        assert!(!queue.enqueue(item(1)).await);
        assert!(queue.enqueue(item(2)).await);
        assert_eq!(queue.ids().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_resync_twice_keeps_the_same_ids() {
        let queue = TaskQueue::new();
        let open = || vec![item(3), item(1), item(2)];
        assert_eq!(queue.replace(open()).await, 3);
        assert_eq!(queue.replace(open()).await, 3);
        assert_eq!(queue.ids().await, vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn test_resync_replaces_earlier_items() {
        let queue = TaskQueue::new();
        queue.enqueue(item(7)).await;
        queue.enqueue(item(8)).await;
        queue.replace(vec![item(1), item(2), item(1)]).await;
        assert_eq!(queue.ids().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_resync_skips_in_flight_results() {
        let queue = TaskQueue::new();
        queue.enqueue(item(1)).await;
        let popped = queue.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(popped.id, 1);

        queue.replace(vec![item(1), item(2)]).await;
        assert_eq!(queue.ids().await, vec![2]);
        assert_eq!(queue.in_flight().await, vec![1]);

        assert!(queue.complete(1).await);
        assert!(!queue.complete(1).await);
        assert!(queue.enqueue(item(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_times_out() {
        let queue = TaskQueue::new();
        assert!(queue.pop(Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_waits_for_an_item() {
        let queue = Arc::new(TaskQueue::new());
        let producer = queue.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(500)).await;
            producer.enqueue(item(5)).await;
        });
        let popped = queue.pop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(popped.id, 5);
        assert!(queue.is_empty().await);
    }
}
