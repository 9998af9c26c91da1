//! Messages exchanged between the proxy and its downstream clients.
//!
//! # Wire Format
//!
//! Every message is one frame: a 4-byte big-endian payload length followed by the
//! bincode encoding of a [`ServerMessage`] or [`ClientMessage`].
//!
//! # Sequencing
//!
//! ```text
//! client                         server
//!   ClientHello      ──────▶
//!                    ◀──────     ServerHello
//!                    ◀──────     SnapshotBegin, SnapshotChunk*, SnapshotEnd
//!   Ack(rev)         ──────▶
//!                    ◀──────     Deltas | SyncStatus | Ping   (repeated)
//!   Ack(rev) | Pong  ──────▶
//!                    ◀──────     Close
//! ```
//!
//! A resuming client that the server can catch up incrementally skips the snapshot
//! frames and receives `Deltas` directly.

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::Revision;
use crate::SyncStatus;
use crate::Update;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub hostname: String,
    /// Free-form client description, logged only
    pub info: String,
    pub version: u32,
    /// Last revision the client fully applied, if it holds earlier state
    pub resume_from: Option<Revision>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    Hello(ClientHello),
    Pong { ping_timestamp_ms: u64 },
    /// Everything up to and including `revision` was applied
    Ack { revision: Revision },
    Goodbye,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Hello {
        version: u32,
        server_id: String,
    },
    SnapshotBegin {
        revision: Revision,
        status: SyncStatus,
        total_entries: u64,
    },
    SnapshotChunk {
        entries: Vec<(String, Bytes)>,
    },
    SnapshotEnd {
        revision: Revision,
    },
    /// Ordered updates; `revision` is that of the last one
    Deltas {
        updates: Vec<Update>,
        revision: Revision,
    },
    SyncStatus {
        status: SyncStatus,
    },
    Ping {
        timestamp_ms: u64,
    },
    Close {
        reason: CloseReason,
    },
}

impl ServerMessage {
    /// Label for per-kind message counters
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Hello { .. } => "hello",
            ServerMessage::SnapshotBegin { .. } => "snapshot_begin",
            ServerMessage::SnapshotChunk { .. } => "snapshot_chunk",
            ServerMessage::SnapshotEnd { .. } => "snapshot_end",
            ServerMessage::Deltas { .. } => "deltas",
            ServerMessage::SyncStatus { .. } => "sync_status",
            ServerMessage::Ping { .. } => "ping",
            ServerMessage::Close { .. } => "close",
        }
    }

    /// Messages the client must acknowledge
    pub fn acked_revision(&self) -> Option<Revision> {
        match self {
            ServerMessage::SnapshotEnd { revision } | ServerMessage::Deltas { revision, .. } => Some(*revision),
            _ => None,
        }
    }
}

/// Why the server ended a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    ServerShutdown,
    TooManyConnections,
    /// Dropped to spread load; reconnect, ideally elsewhere
    Rebalance,
    VersionMismatch,
    FellBehind,
    PongTimeout,
    ProtocolViolation,
}
