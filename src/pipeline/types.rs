use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::RECORD_OVERHEAD_BYTES;

/// Monotonic position in the upstream change stream
pub type Revision = u64;

/// Upstream datastore synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncStatus {
    /// No connection to the datastore yet
    #[default]
    WaitForDatastore,
    /// Initial listing (or a re-list) is underway; data may be incomplete
    ResyncInProgress,
    /// Caught up with the datastore
    InSync,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::WaitForDatastore => "wait_for_datastore",
            SyncStatus::ResyncInProgress => "resync_in_progress",
            SyncStatus::InSync => "in_sync",
        }
    }
}

/// One key change. A `None` value is a tombstone (the key was deleted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub key: String,
    pub value: Option<Bytes>,
    pub revision: Revision,
}

impl Update {
    pub fn put(
        key: impl Into<String>,
        value: impl Into<Bytes>,
        revision: Revision,
    ) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            revision,
        }
    }

    pub fn delete(
        key: impl Into<String>,
        revision: Revision,
    ) -> Self {
        Self {
            key: key.into(),
            value: None,
            revision,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Approximate wire size, used to keep messages under the byte cap
    pub fn encoded_len(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, Bytes::len) + RECORD_OVERHEAD_BYTES
    }
}

/// What flows between pipeline stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    Status(SyncStatus),
    Updates(Vec<Update>),
}
