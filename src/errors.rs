//! Fan-out Proxy Error Hierarchy
//!
//! Errors are grouped by where they originate: infrastructure (network, wire codec),
//! the update pipeline, and individual downstream connections. Connection faults are
//! terminal for that one connection only and never propagate past its task.

use std::time::Duration;

use config::ConfigError;
use tokio::task::JoinError;

use crate::Revision;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure-level failures (network, wire codec)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Failures moving updates between pipeline stages
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// A single downstream connection failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Retry policy exhausted while waiting on an external collaborator
    #[error("Task failed after {attempts} attempts: {reason}")]
    RetryExhausted { attempts: usize, reason: String },

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Server failed to start: {0}")]
    ServerStartFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Listener could not be bound
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    #[error("{0}")]
    SignalSendFailed(String),
}

/// Wire codec failures
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Bincode serialization failed: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Downstream stage stopped accepting input
    #[error("Pipeline queue {0} is closed")]
    QueueClosed(&'static str),

    /// The snapshot cache processing loop is no longer running
    #[error("Snapshot cache is not running")]
    CacheStopped,
}

/// Why an update was rejected by the validation filter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Malformed key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("Invalid value for {key:?}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Per-connection faults. Each one terminates that connection only.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Client did not complete the handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Client protocol version {client} outside supported range {min}..={max}")]
    VersionMismatch { client: u32, min: u32, max: u32 },

    #[error("No pong received for {0:?}")]
    PongTimeout(Duration),

    #[error("Client fell behind by {lag:?} (limit {max:?})")]
    FellBehind { lag: Duration, max: Duration },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Client acknowledged revision {acked} but only {sent} was sent")]
    AckBeyondSent { acked: Revision, sent: Revision },

    #[error("Connection limit of {max} reached")]
    ConnectionLimit { max: usize },

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Snapshot cache unavailable")]
    CacheUnavailable,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ConnectionError {
    /// Label used for the dropped-connection metrics
    pub fn reason(&self) -> &'static str {
        match self {
            ConnectionError::HandshakeTimeout(_) => "handshake_timeout",
            ConnectionError::VersionMismatch { .. } => "version_mismatch",
            ConnectionError::PongTimeout(_) => "pong_timeout",
            ConnectionError::FellBehind { .. } => "fell_behind",
            ConnectionError::ProtocolViolation(_) | ConnectionError::AckBeyondSent { .. } => {
                "protocol_violation"
            }
            ConnectionError::ConnectionLimit { .. } => "connection_limit",
            ConnectionError::ClientDisconnected => "client_disconnected",
            ConnectionError::CacheUnavailable => "cache_unavailable",
            ConnectionError::Protocol(ProtocolError::FrameTooLarge { .. }) => "oversized_message",
            ConnectionError::Protocol(_) => "protocol_error",
        }
    }
}

// ============== Conversion Implementations ============== //
impl From<NetworkError> for Error {
    fn from(e: NetworkError) -> Self {
        Error::System(SystemError::Network(e))
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::System(SystemError::Protocol(e))
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        NetworkError::TaskFailed(err).into()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        NetworkError::Io(err).into()
    }
}
