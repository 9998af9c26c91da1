use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitoringConfig {
    #[serde(default = "default_prometheus_enabled")]
    pub prometheus_enabled: bool,

    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,

    #[serde(default = "default_health_enabled")]
    pub health_enabled: bool,

    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// A component that has not reported for this long is considered unhealthy
    #[serde(default = "default_health_report_interval")]
    pub health_report_interval_in_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: default_prometheus_enabled(),
            prometheus_port: default_prometheus_port(),
            health_enabled: default_health_enabled(),
            health_port: default_health_port(),
            health_report_interval_in_ms: default_health_report_interval(),
        }
    }
}

impl MonitoringConfig {
    /// Validates monitoring configuration
    /// # Errors
    /// Returns `Error::Config` when:
    /// - An endpoint is enabled with port 0
    /// - Both endpoints are enabled on the same port
    /// - The health report interval is 0
    pub fn validate(&self) -> Result<()> {
        if self.prometheus_enabled && self.prometheus_port == 0 {
            return Err(Error::Config(ConfigError::Message(
                "monitoring.prometheus_port cannot be 0 when enabled".into(),
            )));
        }

        if self.health_enabled && self.health_port == 0 {
            return Err(Error::Config(ConfigError::Message(
                "monitoring.health_port cannot be 0 when enabled".into(),
            )));
        }

        if self.prometheus_enabled && self.health_enabled && self.prometheus_port == self.health_port {
            return Err(Error::Config(ConfigError::Message(format!(
                "monitoring.prometheus_port and monitoring.health_port both set to {}",
                self.health_port
            ))));
        }

        if self.health_report_interval_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "monitoring.health_report_interval_in_ms must be greater than 0".into(),
            )));
        }

        #[cfg(debug_assertions)]
        if !self.prometheus_enabled && self.prometheus_port != default_prometheus_port() {
            warn!(
                "prometheus_port configured to {} but metrics are disabled",
                self.prometheus_port
            );
        }

        Ok(())
    }

    pub fn health_report_interval(&self) -> Duration {
        Duration::from_millis(self.health_report_interval_in_ms)
    }
}

fn default_prometheus_enabled() -> bool {
    false
}
fn default_prometheus_port() -> u16 {
    9093
}
fn default_health_enabled() -> bool {
    false
}
fn default_health_port() -> u16 {
    9098
}
fn default_health_report_interval() -> u64 {
    30_000
}
