use std::time::Duration;

use crate::constants::PROTOCOL_VERSION;

/// Settings for one downstream sync client
#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    /// Reported to the server in the hello, logged there
    pub hostname: String,

    /// Free-form description of the client
    pub info: String,

    /// Protocol version announced in the hello
    /// Default: [`PROTOCOL_VERSION`]
    pub version: u32,

    /// Maximum time to wait for the TCP connection and the server hello
    /// Default: 5 seconds
    pub handshake_timeout: Duration,

    /// Largest inbound frame accepted from the server
    /// Default: 64MB
    pub max_frame_bytes: usize,

    /// Acknowledge snapshots and deltas once applied.
    /// A client that never acks is eventually dropped as fallen behind.
    /// Default: true
    pub send_acks: bool,

    /// Answer keepalive pings.
    /// Default: true
    pub respond_to_pings: bool,
}

impl Default for SyncClientConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            info: concat!("fanout-sync/", env!("CARGO_PKG_VERSION")).to_string(),
            version: PROTOCOL_VERSION,
            handshake_timeout: Duration::from_secs(5),
            max_frame_bytes: 64 * 1024 * 1024,
            send_acks: true,
            respond_to_pings: true,
        }
    }
}
