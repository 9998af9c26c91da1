//! Configuration management for the fan-out proxy.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support
//! - Environment variable overrides
//! - Section-wise validation
mod cache;
mod monitoring;
mod pipeline;
mod rebalancing;
mod retry;
mod server;
pub use cache::*;
pub use monitoring::*;
pub use pipeline::*;
pub use rebalancing::*;
pub use retry::*;
pub use server::*;

#[cfg(test)]
mod server_test;

use std::env;
use std::fmt::Debug;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Prefix of environment variable overrides, e.g. `FANOUT__SERVER__PORT`
pub const ENV_PREFIX: &str = "FANOUT";

/// Main configuration container for every proxy component
///
/// Combines all subsystem configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables (highest priority)
#[derive(Serialize, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Downstream connection serving
    #[serde(default)]
    pub server: ServerConfig,
    /// Snapshot cache sizing
    #[serde(default)]
    pub cache: CacheConfig,
    /// Decoupler queues and validation rules
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Prometheus and health endpoints
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// Connection rebalancing across proxy instances
    #[serde(default)]
    pub rebalancing: RebalancingConfig,
    /// Backoff for the datastore readiness check
    #[serde(default = "default_readiness_retry")]
    pub retry: BackoffPolicy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
            pipeline: PipelineConfig::default(),
            monitoring: MonitoringConfig::default(),
            rebalancing: RebalancingConfig::default(),
            retry: default_readiness_retry(),
        }
    }
}

impl Debug for ProxyConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("server", &self.server)
            .field("cache", &self.cache)
            .finish()
    }
}

impl ProxyConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Configuration sources are merged in the following order (later sources override earlier):
    /// 1. Type defaults (lowest priority)
    /// 2. Configuration file from `CONFIG_PATH` environment variable (if set)
    /// 3. Environment variables with `FANOUT__` prefix (highest priority)
    ///
    /// # Note
    /// Validation is deferred so callers can layer `with_override_config()` first.
    /// Callers MUST call `validate()` before using the configuration.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("FANOUT__SERVER__PORT", "5474");
    /// let cfg = ProxyConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(env_source());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional configuration overrides from file without validation.
    ///
    /// Merging order (later sources override earlier):
    /// 1. Current configuration values
    /// 2. New configuration file
    /// 3. Latest environment variables (highest priority)
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates every section and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        self.server.validate()?;
        self.cache.validate()?;
        self.pipeline.validate()?;
        self.monitoring.validate()?;
        self.rebalancing.validate(&self.server)?;
        self.retry.validate()?;
        Ok(self)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}

fn default_readiness_retry() -> BackoffPolicy {
    BackoffPolicy::readiness()
}
