//! Bounded per-connection outbound queue.
//!
//! Fan-out pushes without waiting; when a slow client lets its queue fill
//! up, the oldest frame is dropped so the broker never blocks on one
//! connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    frames: VecDeque<String>,
    closed: bool,
}

/// Single-consumer queue of serialized frames.
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Nothing panics while holding the lock; recover the data regardless.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a frame. Returns `false` if a frame was lost, either the
    /// oldest one to make room or this one because the queue is closed.
    pub fn push(&self, frame: String) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let mut delivered_all = true;
        if state.frames.len() >= self.capacity {
            state.frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            delivered_all = false;
        }
        state.frames.push_back(frame);
        drop(state);
        self.notify.notify_one();
        delivered_all
    }

    /// Wait for the next frame. `None` once closed and drained.
    pub async fn recv(&self) -> Option<String> {
        loop {
            {
                let mut state = self.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OutboundQueue::new(4);
        assert!(queue.push("a".into()));
        assert!(queue.push("b".into()));
        assert_eq!(queue.recv().await.as_deref(), Some("a"));
        assert_eq!(queue.recv().await.as_deref(), Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let queue = OutboundQueue::new(2);
        queue.push("1".into());
        queue.push("2".into());
        assert!(!queue.push("3".into()));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.recv().await.as_deref(), Some("2"));
        assert_eq!(queue.recv().await.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let queue = Arc::new(OutboundQueue::new(8));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push("late".into());
        let frame = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = OutboundQueue::new(8);
        queue.push("last".into());
        queue.close();
        assert!(!queue.push("ignored".into()));
        assert_eq!(queue.recv().await.as_deref(), Some("last"));
        assert_eq!(queue.recv().await, None);
    }
}
