use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::Revision;
use crate::SyncStatus;
use crate::Update;

/// Immutable point-in-time copy of the state table
#[derive(Debug)]
pub struct Snapshot {
    pub revision: Revision,
    pub status: SyncStatus,
    /// Sorted by key
    pub entries: Vec<(String, Bytes)>,
    pub taken_at: Instant,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Updates applied together in one cache step
#[derive(Debug)]
pub struct DeltaBatch {
    pub updates: Vec<Update>,
    /// Revision of the last update in the batch
    pub revision: Revision,
    pub applied_at: Instant,
}

/// What a subscriber receives after its starting point
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Deltas(Arc<DeltaBatch>),
    Status(SyncStatus),
}

/// Where a new subscriber starts
#[derive(Debug)]
pub enum SubscriptionStart {
    /// Full state at the snapshot's revision
    Snapshot(Arc<Snapshot>),
    /// Every update after `from` up to and including `revision`
    Replay {
        from: Revision,
        updates: Vec<Update>,
        /// When the first of `updates` was applied
        oldest_applied_at: Instant,
        revision: Revision,
        status: SyncStatus,
    },
}

impl SubscriptionStart {
    /// Revision the subscriber is at once the start has been delivered
    pub fn revision(&self) -> Revision {
        match self {
            SubscriptionStart::Snapshot(s) => s.revision,
            SubscriptionStart::Replay { revision, .. } => *revision,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, SubscriptionStart::Snapshot(_))
    }
}

/// A registered consumer: its starting point plus the live feed after it.
///
/// `events` only carries changes with revisions above `start.revision()`. The cache
/// closes it when the subscriber cannot keep up.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub start: SubscriptionStart,
    pub events: mpsc::Receiver<CacheEvent>,
}

/// Point-in-time counters of the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub revision: Revision,
    pub status: SyncStatus,
    pub entries: usize,
    pub subscribers: usize,
    pub replay_len: usize,
    pub replay_base: Revision,
}
