use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Snapshot cache sizing
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacheConfig {
    /// Most updates applied per processing step before subscribers are notified
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Capacity of the queue feeding the cache
    #[serde(default = "default_input_queue_capacity")]
    pub input_queue_capacity: usize,

    /// Applied updates retained for resuming clients
    #[serde(default = "default_replay_buffer_capacity")]
    pub replay_buffer_capacity: usize,

    /// A resume needing more records than this gets a full snapshot instead
    #[serde(default = "default_max_catch_up_records")]
    pub max_catch_up_records: usize,

    /// Idle wake-up period; each wake-up reports cache health
    #[serde(default = "default_wake_up_interval")]
    pub wake_up_interval_in_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            input_queue_capacity: default_input_queue_capacity(),
            replay_buffer_capacity: default_replay_buffer_capacity(),
            max_catch_up_records: default_max_catch_up_records(),
            wake_up_interval_in_ms: default_wake_up_interval(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "cache.max_batch_size must be greater than 0".into(),
            )));
        }

        if self.input_queue_capacity == 0 {
            return Err(Error::Config(ConfigError::Message(
                "cache.input_queue_capacity must be greater than 0".into(),
            )));
        }

        if self.max_catch_up_records > self.replay_buffer_capacity {
            return Err(Error::Config(ConfigError::Message(format!(
                "cache.max_catch_up_records {} exceeds cache.replay_buffer_capacity {}",
                self.max_catch_up_records, self.replay_buffer_capacity
            ))));
        }

        if self.wake_up_interval_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "cache.wake_up_interval_in_ms must be greater than 0".into(),
            )));
        }

        Ok(())
    }

    pub fn wake_up_interval(&self) -> Duration {
        Duration::from_millis(self.wake_up_interval_in_ms)
    }
}

fn default_max_batch_size() -> usize {
    100
}
fn default_input_queue_capacity() -> usize {
    1000
}
fn default_replay_buffer_capacity() -> usize {
    10_000
}
fn default_max_catch_up_records() -> usize {
    5_000
}
fn default_wake_up_interval() -> u64 {
    1_000
}
