//! Bounded diagnostic message queue
//!
//! Failures that cross the C boundary collapse into `false`/`0`/null, so the
//! detail is parked here for the host to pop. Under sustained error bursts the
//! oldest messages are overwritten.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lossy FIFO of human readable error messages
#[derive(Debug)]
pub struct ErrorQueue {
    messages: ArrayQueue<String>,
    /// Messages overwritten because the queue was full
    dropped: AtomicU64,
}

impl ErrorQueue {
    /// Create a queue holding at most `capacity` messages (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a message, overwriting the oldest one when full
    pub fn push(&self, message: impl Into<String>) {
        if let Some(overwritten) = self.messages.force_push(message.into()) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::trace!(
                dropped,
                overwritten = %overwritten,
                "Error queue full, oldest message overwritten"
            );
        }
    }

    /// Pop the oldest pending message
    pub fn pop(&self) -> Option<String> {
        self.messages.pop()
    }

    /// Number of pending messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether no messages are pending
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Maximum pending messages
    pub fn capacity(&self) -> usize {
        self.messages.capacity()
    }

    /// Total messages lost to overflow since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard all pending messages
    pub fn clear(&self) {
        while self.messages.pop().is_some() {}
    }
}

impl Default for ErrorQueue {
    fn default() -> Self {
        Self::new(crate::DEFAULT_ERROR_QUEUE_CAPACITY)
    }
}
