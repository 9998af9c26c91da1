use std::collections::VecDeque;

use tokio::time::Instant;

use crate::Revision;
use crate::Update;

/// Bounded window of the most recently applied updates.
///
/// The buffer holds every applied update with a revision above `base_revision`,
/// oldest first. Pushing past capacity evicts the oldest entry and moves the base up
/// to its revision.
#[derive(Debug)]
pub struct ReplayBuffer {
    entries: VecDeque<Update>,
    /// When each entry of `entries` was applied, same order
    applied_at: VecDeque<Instant>,
    capacity: usize,
    base_revision: Revision,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            applied_at: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            base_revision: 0,
        }
    }

    /// Appends an applied update. Revisions must be pushed in increasing order.
    pub fn push(
        &mut self,
        update: Update,
        applied_at: Instant,
    ) {
        debug_assert!(update.revision > self.last_revision());
        if self.capacity == 0 {
            self.base_revision = update.revision;
            return;
        }
        if self.entries.len() == self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.base_revision = evicted.revision;
                self.applied_at.pop_front();
            }
        }
        self.entries.push_back(update);
        self.applied_at.push_back(applied_at);
    }

    /// Whether every update after `from` is still held
    pub fn covers(
        &self,
        from: Revision,
    ) -> bool {
        from >= self.base_revision && from <= self.last_revision()
    }

    /// Number of held updates with a revision above `from`
    pub fn count_after(
        &self,
        from: Revision,
    ) -> usize {
        self.entries.len() - self.entries.partition_point(|u| u.revision <= from)
    }

    /// Updates after `from`, or `None` when a consumer at `from` cannot be brought
    /// current incrementally within `max_records`.
    pub fn since(
        &self,
        from: Revision,
        max_records: usize,
    ) -> Option<Vec<Update>> {
        if !self.covers(from) {
            return None;
        }
        let start = self.entries.partition_point(|u| u.revision <= from);
        if self.entries.len() - start > max_records {
            return None;
        }
        Some(self.entries.range(start..).cloned().collect())
    }

    /// When the oldest held update above `from` was applied
    pub fn applied_after(
        &self,
        from: Revision,
    ) -> Option<Instant> {
        let start = self.entries.partition_point(|u| u.revision <= from);
        self.applied_at.get(start).copied()
    }

    /// Revision of the newest update ever pushed
    pub fn last_revision(&self) -> Revision {
        self.entries.back().map_or(self.base_revision, |u| u.revision)
    }

    pub fn base_revision(&self) -> Revision {
        self.base_revision
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
