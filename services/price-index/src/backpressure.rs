//! Backpressure and flow control for subscriber delivery
//!
//! Every connection owns a bounded outbound queue. Publishing is a
//! non-blocking enqueue; the connection's writer task is the only place
//! that waits on socket I/O. When a queue is full the configured
//! [`DropPolicy`] decides the fate of that connection alone.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Drop policy when a connection's outbound queue overflows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Disconnect the lagging connection immediately.
    #[default]
    Disconnect,
    /// Drop oldest messages to make room for newer ones.
    DropOldest,
}

/// A queued outbound frame.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Serialized JSON line, shared across all recipients of one publish.
    pub payload: Arc<str>,
    pub queued_at: Instant,
}

impl OutboundMessage {
    pub fn new(payload: Arc<str>) -> Self {
        Self {
            payload,
            queued_at: Instant::now(),
        }
    }
}

/// Action to take when an enqueue cannot proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureAction {
    /// Queue overflowed under `DropPolicy::Disconnect`.
    DisconnectClient,
    /// Queue already closed.
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<OutboundMessage>,
    dropped: u64,
    lagging: bool,
    closed: bool,
}

/// Per-connection outbound queue with bounded capacity.
#[derive(Debug)]
pub struct ConnectionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    drop_policy: DropPolicy,
}

impl ConnectionQueue {
    pub fn new(capacity: usize, drop_policy: DropPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::with_capacity(capacity.min(64)),
                ..QueueState::default()
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            drop_policy,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue without waiting. `Err` means the caller should disconnect.
    pub fn enqueue(&self, message: OutboundMessage) -> Result<(), BackpressureAction> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(BackpressureAction::Closed);
            }
            if state.messages.len() >= self.capacity {
                state.lagging = true;
                match self.drop_policy {
                    DropPolicy::Disconnect => return Err(BackpressureAction::DisconnectClient),
                    DropPolicy::DropOldest => {
                        state.messages.pop_front();
                        state.dropped += 1;
                    }
                }
            }
            state.messages.push_back(message);

            // Clear lagging flag once below half capacity.
            if state.messages.len() < self.capacity / 2 {
                state.lagging = false;
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for queued messages and take up to `max` of them.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn next_batch(&self, max: usize) -> Option<Vec<OutboundMessage>> {
        loop {
            {
                let mut state = self.state();
                if !state.messages.is_empty() {
                    let n = state.messages.len().min(max.max(1));
                    let batch: Vec<_> = state.messages.drain(..n).collect();
                    if state.messages.len() < self.capacity / 2 {
                        state.lagging = false;
                    }
                    return Some(batch);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting messages and wake the writer. Idempotent.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn len(&self) -> usize {
        self.state().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().messages.is_empty()
    }

    pub fn is_lagging(&self) -> bool {
        self.state().lagging
    }

    pub fn messages_dropped(&self) -> u64 {
        self.state().dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(s: &str) -> OutboundMessage {
        OutboundMessage::new(Arc::from(s))
    }

    #[test]
    fn test_disconnect_policy() {
        let queue = ConnectionQueue::new(2, DropPolicy::Disconnect);
        assert!(queue.enqueue(msg("a")).is_ok());
        assert!(queue.enqueue(msg("b")).is_ok());
        assert_eq!(queue.enqueue(msg("c")), Err(BackpressureAction::DisconnectClient));
        assert!(queue.is_lagging());
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_drop_oldest_policy() {
        let queue = ConnectionQueue::new(2, DropPolicy::DropOldest);
        for s in ["a", "b", "c"] {
            queue.enqueue(msg(s)).unwrap();
        }
        assert_eq!(queue.messages_dropped(), 1);

        let batch = queue.next_batch(10).await.unwrap();
        let payloads: Vec<&str> = batch.iter().map(|m| &*m.payload).collect();
        assert_eq!(payloads, vec!["b", "c"]);
        assert!(!queue.is_lagging());
    }

    #[tokio::test]
    async fn test_batches_respect_max() {
        let queue = ConnectionQueue::new(10, DropPolicy::Disconnect);
        for s in ["a", "b", "c"] {
            queue.enqueue(msg(s)).unwrap();
        }
        assert_eq!(queue.next_batch(2).await.unwrap().len(), 2);
        assert_eq!(queue.next_batch(2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = Arc::new(ConnectionQueue::new(10, DropPolicy::Disconnect));
        queue.enqueue(msg("last")).unwrap();
        queue.close();
        assert_eq!(queue.enqueue(msg("late")), Err(BackpressureAction::Closed));

        assert_eq!(queue.next_batch(10).await.unwrap().len(), 1);
        assert!(queue.next_batch(10).await.is_none());
    }

    #[tokio::test]
    async fn test_writer_wakes_on_enqueue() {
        let queue = Arc::new(ConnectionQueue::new(10, DropPolicy::Disconnect));
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_batch(10).await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(msg("hello")).unwrap();

        let batch = reader.await.unwrap().unwrap();
        assert_eq!(&*batch[0].payload, "hello");
    }
}
