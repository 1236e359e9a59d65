//! Bounded FIFO between two pipeline stages.
//!
//! [`BoundedFrameQueue`] is the only coupling between stages. Its capacity bounds the
//! memory held by in-flight frames, and a full queue is how a slow consumer throttles its
//! producer.
//!
//! # Close and drain
//!
//! `close()` ends the stream without discarding anything: consumers keep receiving the
//! items already queued and only then see `None`. Producers pushing into a closed queue get
//! their item back.
//!
//! # Depth reads
//!
//! `len()` reads an atomic mirror of the depth, so telemetry never contends with the
//! producer or consumer for the queue lock.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// What `push` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Block the producer until space is available.
    #[default]
    Block,
    /// Return the item to the producer immediately.
    Fail,
}

/// Reason a `push` did not enqueue its item. The item is handed back.
pub enum PushError<T> {
    /// The queue was full and the policy is [`BackpressurePolicy::Fail`].
    Full(T),
    /// The queue has been closed.
    Closed(T),
}

impl<T> PushError<T> {
    /// Recover the item that was not enqueued.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("Full(..)"),
            PushError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Fixed-capacity blocking FIFO with close/drain semantics.
pub struct BoundedFrameQueue<T> {
    name: &'static str,
    capacity: usize,
    policy: BackpressurePolicy,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    depth: AtomicUsize,
}

impl<T> BoundedFrameQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(name: &'static str, capacity: usize, policy: BackpressurePolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            policy,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            depth: AtomicUsize::new(0),
        }
    }

    /// Maximum number of items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current depth. Approximate while producers and consumers are active.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Whether the queue currently holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Append an item, applying the backpressure policy when full.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PushError::Closed(item));
            }
            if state.items.len() < self.capacity {
                break;
            }
            match self.policy {
                BackpressurePolicy::Fail => return Err(PushError::Full(item)),
                BackpressurePolicy::Block => self.not_full.wait(&mut state),
            }
        }
        state.items.push_back(item);
        self.depth.store(state.items.len(), Ordering::Release);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest item, blocking until one is available.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.depth.store(state.items.len(), Ordering::Release);
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Remove the oldest item if one is available.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        let item = state.items.pop_front()?;
        self.depth.store(state.items.len(), Ordering::Release);
        drop(state);
        self.not_full.notify_one();
        Some(item)
    }

    /// End the stream. Queued items remain available to `pop`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        tracing::trace!(queue = self.name, "queue closed");
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

impl<T> fmt::Debug for BoundedFrameQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedFrameQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("len", &self.len())
            .finish()
    }
}
