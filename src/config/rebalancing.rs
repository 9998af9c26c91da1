use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::ServerConfig;
use crate::Error;
use crate::Result;

/// How the per-instance connection limit is chosen
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RebalancingMode {
    /// Fixed limit of `server.max_conns`
    #[default]
    None,
    /// Limit derived from the number of proxies and clients in the deployment
    Topology,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RebalancingConfig {
    #[serde(default)]
    pub mode: RebalancingMode,

    /// Base period between topology polls; each wait is jittered by up to 10%
    #[serde(default = "default_poll_interval")]
    pub poll_interval_in_ms: u64,

    #[serde(default = "default_max_conns_lower_limit")]
    pub max_conns_lower_limit: usize,

    #[serde(default = "default_max_conns_upper_limit")]
    pub max_conns_upper_limit: usize,

    /// Extra share of the fair per-proxy load each instance is allowed to carry
    #[serde(default = "default_headroom_percent")]
    pub headroom_percent: u32,
}

impl Default for RebalancingConfig {
    fn default() -> Self {
        Self {
            mode: RebalancingMode::default(),
            poll_interval_in_ms: default_poll_interval(),
            max_conns_lower_limit: default_max_conns_lower_limit(),
            max_conns_upper_limit: default_max_conns_upper_limit(),
            headroom_percent: default_headroom_percent(),
        }
    }
}

impl RebalancingConfig {
    pub fn validate(
        &self,
        server: &ServerConfig,
    ) -> Result<()> {
        if self.mode == RebalancingMode::None {
            return Ok(());
        }

        if self.poll_interval_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "rebalancing.poll_interval_in_ms must be greater than 0".into(),
            )));
        }

        if self.max_conns_lower_limit == 0 || self.max_conns_lower_limit > self.max_conns_upper_limit {
            return Err(Error::Config(ConfigError::Message(format!(
                "rebalancing limits invalid: lower {} upper {}",
                self.max_conns_lower_limit, self.max_conns_upper_limit
            ))));
        }

        if self.max_conns_upper_limit > server.max_conns {
            return Err(Error::Config(ConfigError::Message(format!(
                "rebalancing.max_conns_upper_limit {} exceeds server.max_conns {}",
                self.max_conns_upper_limit, server.max_conns
            ))));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_in_ms)
    }
}

fn default_poll_interval() -> u64 {
    10_000
}
fn default_max_conns_lower_limit() -> usize {
    400
}
fn default_max_conns_upper_limit() -> usize {
    10_000
}
fn default_headroom_percent() -> u32 {
    20
}
