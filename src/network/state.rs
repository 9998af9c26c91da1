use serde::Serialize;

/// Lifecycle of one downstream connection.
///
/// `Connecting → SnapshotSending → Streaming → Draining → Closed`, with `Failed`
/// reachable from every non-terminal state. A streaming connection that was detached
/// by the cache goes back to `SnapshotSending` for a fresh snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Connecting,
    SnapshotSending,
    Streaming,
    Draining,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    pub fn can_transition_to(
        &self,
        next: ConnectionState,
    ) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed | Failed, _) => false,
            (_, Failed) => true,
            (Connecting, SnapshotSending | Streaming | Draining | Closed) => true,
            (SnapshotSending, Streaming | Draining | Closed) => true,
            (Streaming, SnapshotSending | Draining | Closed) => true,
            (Draining, Closed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::SnapshotSending => "snapshot_sending",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Draining => "draining",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}
