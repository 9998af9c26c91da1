use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::DeltaBatch;
use crate::Update;

/// Updates waiting to be flushed to one connection
pub struct BatchBuffer {
    max_batch_size: usize,
    min_batching_age: Duration,
    buffer: Vec<Update>,
    /// When the oldest buffered update was applied by the cache
    oldest: Option<Instant>,
}

/// Contents of a flushed [`BatchBuffer`]
#[derive(Debug)]
pub struct PendingBatch {
    pub updates: Vec<Update>,
    pub oldest: Instant,
}

impl BatchBuffer {
    pub fn new(
        max_batch_size: usize,
        min_batching_age: Duration,
    ) -> Self {
        Self {
            max_batch_size,
            min_batching_age,
            buffer: Vec::with_capacity(max_batch_size.min(1024)),
            oldest: None,
        }
    }

    /// Buffers a cache batch. Returns the buffered count once a flush is due by size.
    pub fn push(
        &mut self,
        batch: &DeltaBatch,
    ) -> Option<usize> {
        if batch.updates.is_empty() {
            return None;
        }
        self.oldest.get_or_insert(batch.applied_at);
        self.buffer.extend(batch.updates.iter().cloned());
        trace!(
            "BatchBuffer::push, self.max_batch_size={}, self.buffer.len()={}",
            self.max_batch_size,
            self.buffer.len()
        );
        if self.is_full() {
            Some(self.buffer.len())
        } else {
            None
        }
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.max_batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Instant by which the buffer must be flushed
    pub fn deadline(&self) -> Option<Instant> {
        self.oldest.map(|oldest| oldest + self.min_batching_age)
    }

    pub fn should_flush(
        &self,
        now: Instant,
    ) -> bool {
        !self.buffer.is_empty() && (self.is_full() || self.deadline().is_some_and(|d| now >= d))
    }

    pub fn take(&mut self) -> Option<PendingBatch> {
        let oldest = self.oldest.take()?;
        Some(PendingBatch {
            updates: std::mem::take(&mut self.buffer),
            oldest,
        })
    }
}

/// Splits `items` into ordered groups of at most `max_items` entries and, where
/// possible, at most `max_bytes` of estimated size.
///
/// An item larger than `max_bytes` on its own travels alone rather than being dropped.
pub fn split_into_messages<T>(
    items: Vec<T>,
    max_items: usize,
    max_bytes: usize,
    size_of: impl Fn(&T) -> usize,
) -> Vec<Vec<T>> {
    let max_items = max_items.max(1);
    let mut messages = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0;

    for item in items {
        let size = size_of(&item);
        if !current.is_empty() && (current.len() >= max_items || current_bytes + size > max_bytes) {
            messages.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(item);
    }
    if !current.is_empty() {
        messages.push(current);
    }
    messages
}
