//! Bounded hand-off queue between the ingest loop and the workers
//!
//! Producers never wait: `try_push` either stores the item or hands it
//! back. Consumers park on a `Notify` until an item arrives or the queue
//! is closed.

use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::ArrayQueue;
use tokio::sync::Notify;

/// Rejected push, carrying the item back to the caller
#[derive(PartialEq, Eq)]
pub enum PushError<T> {
    /// Queue is at capacity
    Full(T),
    /// Queue has been closed
    Closed(T),
}

impl<T> PushError<T> {
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

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("queue full"),
            PushError::Closed(_) => f.write_str("queue closed"),
        }
    }
}

/// Fixed-capacity MPMC queue with non-blocking push and async pop
pub struct BoundedQueue<T> {
    items: ArrayQueue<T>,
    closed: AtomicBool,
    notify: Notify,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity.max(1)),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Enqueue without waiting
    #[inline]
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        if self.is_closed() {
            return Err(PushError::Closed(item));
        }
        self.items.push(item).map_err(PushError::Full)?;
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue, waiting until an item is available.
    /// Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            if let Some(item) = self.items.pop() {
                return Some(item);
            }
            if self.is_closed() {
                return self.items.pop();
            }

            // Register before re-checking so a push or close in between is not missed
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            if let Some(item) = self.items.pop() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    /// Reject further pushes and wake every waiting consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Fill level in `[0, 1]`
    pub fn utilization(&self) -> f64 {
        self.len() as f64 / self.capacity() as f64
    }
}
