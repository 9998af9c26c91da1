use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Tunables for accepting and feeding downstream connections
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Listen port (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum update records carried by one delta or snapshot message
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Soft cap on the encoded size of one message; larger batches are split
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Longest a record may sit in a connection's batch before it is flushed
    #[serde(default = "default_min_batching_age")]
    pub min_batching_age_in_ms: u64,

    /// How long a client may leave data unacknowledged before it is dropped
    #[serde(default = "default_max_fall_behind")]
    pub max_fall_behind_in_ms: u64,

    /// Keepalive ping period
    #[serde(default = "default_ping_interval")]
    pub ping_interval_in_ms: u64,

    /// A connection with no pong for this long is failed
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_in_ms: u64,

    /// Time allowed for the client hello after accept
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_in_ms: u64,

    /// Period of the connection governor; at most one connection is dropped per period
    #[serde(default = "default_drop_interval")]
    pub drop_interval_in_ms: u64,

    /// Hard cap on concurrent connections
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,

    /// Delta batches queued per connection before the cache detaches it
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,

    /// Inbound frames larger than this are a protocol fault
    #[serde(default = "default_max_client_message_bytes")]
    pub max_client_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            port: default_port(),
            max_message_size: default_max_message_size(),
            max_message_bytes: default_max_message_bytes(),
            min_batching_age_in_ms: default_min_batching_age(),
            max_fall_behind_in_ms: default_max_fall_behind(),
            ping_interval_in_ms: default_ping_interval(),
            pong_timeout_in_ms: default_pong_timeout(),
            handshake_timeout_in_ms: default_handshake_timeout(),
            drop_interval_in_ms: default_drop_interval(),
            max_conns: default_max_conns(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            max_client_message_bytes: default_max_client_message_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_message_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "server.max_message_size must be greater than 0".into(),
            )));
        }

        if self.max_message_bytes < 1024 {
            return Err(Error::Config(ConfigError::Message(format!(
                "server.max_message_bytes {} too small, minimum 1024 bytes",
                self.max_message_bytes
            ))));
        }

        if self.ping_interval_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "server.ping_interval_in_ms must be greater than 0".into(),
            )));
        }

        if self.pong_timeout_in_ms <= self.ping_interval_in_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "server.pong_timeout_in_ms {}ms must exceed ping interval {}ms",
                self.pong_timeout_in_ms, self.ping_interval_in_ms
            ))));
        }

        if self.max_fall_behind_in_ms == 0 || self.handshake_timeout_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "server.max_fall_behind_in_ms and server.handshake_timeout_in_ms must be > 0"
                    .into(),
            )));
        }

        if self.drop_interval_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "server.drop_interval_in_ms must be greater than 0".into(),
            )));
        }

        if self.max_conns == 0 || self.subscriber_queue_capacity == 0 {
            return Err(Error::Config(ConfigError::Message(
                "server.max_conns and server.subscriber_queue_capacity must be > 0".into(),
            )));
        }

        if self.max_client_message_bytes < 64 {
            return Err(Error::Config(ConfigError::Message(format!(
                "server.max_client_message_bytes {} too small, minimum 64 bytes",
                self.max_client_message_bytes
            ))));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }

    pub fn min_batching_age(&self) -> Duration {
        Duration::from_millis(self.min_batching_age_in_ms)
    }

    pub fn max_fall_behind(&self) -> Duration {
        Duration::from_millis(self.max_fall_behind_in_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_in_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_in_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_in_ms)
    }

    pub fn drop_interval(&self) -> Duration {
        Duration::from_millis(self.drop_interval_in_ms)
    }

    /// How often a connection re-checks its pong and fall-behind deadlines.
    ///
    /// A quarter of the tightest deadline, never below 10ms.
    pub fn health_check_interval(&self) -> Duration {
        let tightest = self
            .ping_interval_in_ms
            .min(self.pong_timeout_in_ms)
            .min(self.max_fall_behind_in_ms);
        Duration::from_millis((tightest / 4).max(10))
    }
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5473
}
fn default_max_message_size() -> usize {
    100
}
fn default_max_message_bytes() -> usize {
    1024 * 1024
}
fn default_min_batching_age() -> u64 {
    10
}
fn default_max_fall_behind() -> u64 {
    90_000
}
fn default_ping_interval() -> u64 {
    10_000
}
fn default_pong_timeout() -> u64 {
    60_000
}
fn default_handshake_timeout() -> u64 {
    10_000
}
fn default_drop_interval() -> u64 {
    1_000
}
fn default_max_conns() -> usize {
    64_000
}
fn default_subscriber_queue_capacity() -> usize {
    256
}
fn default_max_client_message_bytes() -> usize {
    64 * 1024
}
