use std::sync::Arc;
use std::time::Duration;

use super::SyncClient;
use super::SyncClientConfig;
use crate::SyncerCallbacks;

pub struct SyncClientBuilder {
    address: String,
    config: SyncClientConfig,
}

impl SyncClientBuilder {
    /// Create a new builder with default config for the server at `address`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            config: SyncClientConfig::default(),
        }
    }

    pub fn hostname(
        mut self,
        hostname: impl Into<String>,
    ) -> Self {
        self.config.hostname = hostname.into();
        self
    }

    pub fn info(
        mut self,
        info: impl Into<String>,
    ) -> Self {
        self.config.info = info.into();
        self
    }

    /// Set handshake timeout (default: 5s)
    pub fn handshake_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Enable/disable acknowledgements (default: enabled)
    pub fn send_acks(
        mut self,
        enable: bool,
    ) -> Self {
        self.config.send_acks = enable;
        self
    }

    /// Enable/disable pong replies (default: enabled)
    pub fn respond_to_pings(
        mut self,
        enable: bool,
    ) -> Self {
        self.config.respond_to_pings = enable;
        self
    }

    /// Completely replaces the default configuration, discarding earlier setters
    pub fn set_config(
        mut self,
        config: SyncClientConfig,
    ) -> Self {
        self.config = config;
        self
    }

    /// Builds a client that reports what it receives to `sink`
    pub fn build(
        self,
        sink: Arc<dyn SyncerCallbacks>,
    ) -> SyncClient {
        SyncClient::new(self.address, self.config, sink)
    }
}
