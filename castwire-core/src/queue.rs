//! Bounded hand-off queues between pipeline stages
//!
//! Producers never wait: when a queue is full the configured [`DropPolicy`]
//! decides which unit is discarded. Consumers wait asynchronously. The lock is
//! only held for the duration of a `VecDeque` operation and never across an
//! await, so pushing is safe from a real-time audio callback.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// What to discard when a push finds the queue full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Discard the unit being pushed (video)
    DropNewest,
    /// Evict the oldest queued unit to make room (audio)
    DropOldest,
}

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The unit was queued
    Queued,
    /// The queue was full and the pushed unit was discarded
    DroppedNewest,
    /// The queue was full and the oldest unit was evicted
    EvictedOldest,
    /// The queue is closed; the unit was discarded
    Closed,
}

impl PushOutcome {
    /// Whether a unit was lost because the queue was full
    pub fn is_drop(&self) -> bool {
        matches!(self, Self::DroppedNewest | Self::EvictedOldest)
    }
}

/// Result of a pop with a timeout
#[derive(Debug)]
pub enum PopResult<T> {
    /// A unit was available
    Item(T),
    /// Nothing arrived before the timeout
    TimedOut,
    /// The queue is closed and empty
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A bounded multi-producer queue with an explicit drop policy
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    policy: DropPolicy,
    inner: Mutex<Inner<T>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` units (minimum 1)
    pub fn new(name: &'static str, capacity: usize, policy: DropPolicy) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            name,
            capacity,
            policy,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        })
    }

    /// Push without blocking, applying the drop policy when full
    pub fn push(&self, item: T) -> PushOutcome {
        let mut discarded = None;
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                discarded = Some(item);
                PushOutcome::Closed
            } else if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                PushOutcome::Queued
            } else {
                match self.policy {
                    DropPolicy::DropNewest => {
                        discarded = Some(item);
                        PushOutcome::DroppedNewest
                    }
                    DropPolicy::DropOldest => {
                        discarded = inner.items.pop_front();
                        inner.items.push_back(item);
                        PushOutcome::EvictedOldest
                    }
                }
            }
        };

        if outcome.is_drop() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        if matches!(outcome, PushOutcome::Queued | PushOutcome::EvictedOldest) {
            self.notify.notify_one();
        }
        // Freed outside the lock
        drop(discarded);
        outcome
    }

    /// Wait for the next unit; `None` once the queue is closed and empty
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Wait up to `timeout` for the next unit
    pub async fn pop_timeout(&self, timeout: Duration) -> PopResult<T> {
        match tokio::time::timeout(timeout, self.pop()).await {
            Ok(Some(item)) => PopResult::Item(item),
            Ok(None) => PopResult::Closed,
            Err(_) => PopResult::TimedOut,
        }
    }

    /// Take the next unit if one is queued
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Close the queue; queued units can still be popped
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Whether the queue is closed and has nothing left to pop
    pub fn is_finished(&self) -> bool {
        let inner = self.inner.lock();
        inner.closed && inner.items.is_empty()
    }

    /// Number of queued units
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued units
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop policy
    pub fn policy(&self) -> DropPolicy {
        self.policy
    }

    /// Queue name for logging
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Units lost to the drop policy since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Closes a queue when dropped
///
/// A stage holds one for each queue it produces into, so downstream stages
/// see end-of-stream even if the stage exits early or is aborted.
pub struct CloseOnDrop<T>(Arc<BoundedQueue<T>>);

impl<T> CloseOnDrop<T> {
    /// Wrap a queue
    pub fn new(queue: Arc<BoundedQueue<T>>) -> Self {
        Self(queue)
    }
}

impl<T> std::ops::Deref for CloseOnDrop<T> {
    type Target = BoundedQueue<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        self.0.close();
    }
}
