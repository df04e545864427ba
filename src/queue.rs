//! Three-lane priority FIFO feeding the batcher.
//!
//! Draining consumes strictly high → normal → low; within a lane, FIFO.
//! Starvation of low-priority work under sustained high-priority pressure is
//! the intended semantics, not a bug.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;

use crate::task::Priority;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue full at depth {depth}")]
    Full { depth: usize },
}

#[derive(Default)]
struct Lanes {
    high: VecDeque<String>,
    normal: VecDeque<String>,
    low: VecDeque<String>,
}

impl Lanes {
    fn depth(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<String> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }
}

/// Mutex-guarded lanes with a notify for the batcher's wakeups. The lock is
/// never held across an await.
pub struct PriorityQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
    max_depth: usize,
}

impl PriorityQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            notify: Notify::new(),
            max_depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.lanes.lock().depth()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    pub fn enqueue(&self, task_id: String, priority: Priority) -> Result<(), QueueError> {
        {
            let mut lanes = self.lanes.lock();
            let depth = lanes.depth();
            if depth >= self.max_depth {
                return Err(QueueError::Full { depth });
            }
            lanes.lane_mut(priority).push_back(task_id);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Enqueue a whole submission under one lock: either every item fits
    /// under the depth cap or none is admitted.
    pub fn enqueue_many(&self, items: Vec<(String, Priority)>) -> Result<(), QueueError> {
        {
            let mut lanes = self.lanes.lock();
            let depth = lanes.depth();
            if depth + items.len() > self.max_depth {
                return Err(QueueError::Full { depth });
            }
            for (task_id, priority) in items {
                lanes.lane_mut(priority).push_back(task_id);
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Remove up to `n` task ids, high lane first, then normal, then low.
    pub fn drain_up_to(&self, n: usize) -> Vec<String> {
        let mut guard = self.lanes.lock();
        let mut drained = Vec::with_capacity(n.min(guard.depth()));
        let lanes = &mut *guard;
        for lane in [&mut lanes.high, &mut lanes.normal, &mut lanes.low] {
            while drained.len() < n {
                match lane.pop_front() {
                    Some(id) => drained.push(id),
                    None => break,
                }
            }
        }
        drained
    }

    /// Remove and return everything still queued. Used by the shutdown path
    /// to fail unprocessed tasks.
    pub fn drain_all(&self) -> Vec<String> {
        let depth = self.depth();
        self.drain_up_to(depth)
    }

    /// Block until the queue is non-empty or the timeout elapses. Returns
    /// whether the queue held at least one task on wakeup.
    pub async fn await_nonempty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if !self.is_empty() {
                return true;
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return !self.is_empty(),
            };
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return !self.is_empty();
            }
        }
    }

    /// Block until the queue is non-empty, with no deadline.
    pub async fn wait_nonempty(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_high_then_normal_then_low_fifo_within_lane() {
        let queue = PriorityQueue::new(100);
        queue.enqueue("low-1".into(), Priority::Low).unwrap();
        queue.enqueue("normal-1".into(), Priority::Normal).unwrap();
        queue.enqueue("high-1".into(), Priority::High).unwrap();
        queue.enqueue("high-2".into(), Priority::High).unwrap();
        queue.enqueue("normal-2".into(), Priority::Normal).unwrap();

        let drained = queue.drain_up_to(10);
        assert_eq!(
            drained,
            vec!["high-1", "high-2", "normal-1", "normal-2", "low-1"]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_honors_requested_limit() {
        let queue = PriorityQueue::new(100);
        for i in 0..5 {
            queue.enqueue(format!("t{i}"), Priority::Normal).unwrap();
        }
        assert_eq!(queue.drain_up_to(3).len(), 3);
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn enqueue_fails_at_depth_cap() {
        let queue = PriorityQueue::new(2);
        queue.enqueue("a".into(), Priority::Normal).unwrap();
        queue.enqueue("b".into(), Priority::High).unwrap();
        let err = queue.enqueue("c".into(), Priority::Low).unwrap_err();
        assert!(matches!(err, QueueError::Full { depth: 2 }));
    }

    #[test]
    fn enqueue_many_is_all_or_nothing() {
        let queue = PriorityQueue::new(3);
        queue.enqueue("a".into(), Priority::Normal).unwrap();

        let items = vec![
            ("b".to_string(), Priority::Normal),
            ("c".to_string(), Priority::Normal),
            ("d".to_string(), Priority::Normal),
        ];
        assert!(queue.enqueue_many(items).is_err());
        assert_eq!(queue.depth(), 1);

        let items = vec![
            ("b".to_string(), Priority::Normal),
            ("c".to_string(), Priority::Normal),
        ];
        queue.enqueue_many(items).unwrap();
        assert_eq!(queue.depth(), 3);
    }

    #[tokio::test]
    async fn await_nonempty_times_out_when_idle() {
        let queue = PriorityQueue::new(10);
        assert!(!queue.await_nonempty(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn await_nonempty_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(PriorityQueue::new(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.await_nonempty(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue("a".into(), Priority::Normal).unwrap();
        assert!(waiter.await.unwrap());
    }
}
