use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Capacity of each decoupler queue between pipeline stages
    #[serde(default = "default_decoupler_queue_capacity")]
    pub decoupler_queue_capacity: usize,

    #[serde(default)]
    pub validation: ValidationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            decoupler_queue_capacity: default_decoupler_queue_capacity(),
            validation: ValidationConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.decoupler_queue_capacity == 0 {
            return Err(Error::Config(ConfigError::Message(
                "pipeline.decoupler_queue_capacity must be greater than 0".into(),
            )));
        }
        self.validation.validate()
    }
}

/// Rules applied to every upstream update
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default = "default_max_key_bytes")]
    pub max_key_bytes: usize,

    #[serde(default = "default_max_value_bytes")]
    pub max_value_bytes: usize,

    /// Values must parse as JSON documents
    #[serde(default = "default_require_json_values")]
    pub require_json_values: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_key_bytes: default_max_key_bytes(),
            max_value_bytes: default_max_value_bytes(),
            require_json_values: default_require_json_values(),
        }
    }
}

impl ValidationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_key_bytes < 2 {
            return Err(Error::Config(ConfigError::Message(format!(
                "pipeline.validation.max_key_bytes {} too small, minimum 2",
                self.max_key_bytes
            ))));
        }
        if self.max_value_bytes == 0 {
            return Err(Error::Config(ConfigError::Message(
                "pipeline.validation.max_value_bytes must be greater than 0".into(),
            )));
        }
        Ok(())
    }
}

fn default_decoupler_queue_capacity() -> usize {
    1000
}
fn default_max_key_bytes() -> usize {
    1024
}
fn default_max_value_bytes() -> usize {
    512 * 1024
}
fn default_require_json_values() -> bool {
    true
}
