//! Micro-batch accumulator.
//!
//! Collects items and reports readiness when either the size threshold
//! or time window is reached, whichever comes first. The owner decides
//! when to act on the time window; size is checked on every push.

use std::time::Duration;

use tokio::time::Instant;

/// Accumulates items into micro-batches.
///
/// One batcher belongs to exactly one worker instance; it is never shared
/// between workers of the same stage.
#[derive(Debug)]
pub struct MicroBatcher<T> {
    buffer: Vec<T>,
    max_size: usize,
    max_wait: Option<Duration>,
    batch_started: Option<Instant>,
}

impl<T> MicroBatcher<T> {
    /// Create a new batcher.
    ///
    /// - `max_size`: full when this many items are buffered (minimum 1).
    /// - `max_wait`: expired when this long has passed since the first item
    ///   of the current batch was pushed. `None` disables the time window.
    pub fn new(max_size: usize, max_wait: Option<Duration>) -> Self {
        let max_size = max_size.max(1);
        Self {
            buffer: Vec::with_capacity(max_size),
            max_size,
            max_wait,
            batch_started: None,
        }
    }

    /// Add an item. Starts the batch timer on the first push. Returns `true` when full.
    pub fn push(&mut self, item: T) -> bool {
        if self.batch_started.is_none() {
            self.batch_started = Some(Instant::now());
        }
        self.buffer.push(item);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.max_size
    }

    /// Non-empty and open longer than `max_wait`.
    pub fn is_expired(&self) -> bool {
        match (self.max_wait, self.batch_started) {
            (Some(wait), Some(started)) if !self.buffer.is_empty() => started.elapsed() >= wait,
            _ => false,
        }
    }

    /// Check if the batch should be flushed.
    pub fn should_flush(&self) -> bool {
        !self.buffer.is_empty() && (self.is_full() || self.is_expired())
    }

    /// Buffered items, oldest first.
    pub fn items(&self) -> &[T] {
        &self.buffer
    }

    /// Drop the accumulated items and reset for the next batch.
    pub fn clear(&mut self) {
        self.batch_started = None;
        self.buffer.clear();
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
