use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use serde::de::IgnoredAny;
use tracing::debug;
use tracing::warn;

use super::Revision;
use super::SyncStatus;
use super::SyncerCallbacks;
use super::Update;
use crate::ValidationConfig;
use crate::ValidationError;
use crate::VALIDATION_CONVERTED_TOTAL;
use crate::VALIDATION_DROPPED_TOTAL;

/// Structural rules for keys and values
#[cfg_attr(test, automock)]
pub trait Validator: Send + Sync + 'static {
    fn validate_key(
        &self,
        key: &str,
    ) -> std::result::Result<(), ValidationError>;

    fn validate_value(
        &self,
        key: &str,
        value: &[u8],
    ) -> std::result::Result<(), ValidationError>;
}

/// Path-shaped keys (`/a/b/c`) and optionally JSON values
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    config: ValidationConfig,
}

impl SchemaValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }
}

impl Validator for SchemaValidator {
    fn validate_key(
        &self,
        key: &str,
    ) -> std::result::Result<(), ValidationError> {
        let invalid = |reason| {
            Err(ValidationError::InvalidKey {
                key: key.to_string(),
                reason,
            })
        };

        if key.is_empty() {
            return invalid("empty key");
        }
        if key.len() > self.config.max_key_bytes {
            return invalid("key too long");
        }
        if !key.starts_with('/') {
            return invalid("key must start with '/'");
        }
        if key.ends_with('/') {
            return invalid("key must not end with '/'");
        }
        if key[1..].split('/').any(str::is_empty) {
            return invalid("empty path segment");
        }
        if !key.bytes().all(|b| b.is_ascii_graphic()) {
            return invalid("non-printable or non-ascii character");
        }
        Ok(())
    }

    fn validate_value(
        &self,
        key: &str,
        value: &[u8],
    ) -> std::result::Result<(), ValidationError> {
        if value.len() > self.config.max_value_bytes {
            return Err(ValidationError::InvalidValue {
                key: key.to_string(),
                reason: format!("{} bytes exceeds limit of {}", value.len(), self.config.max_value_bytes),
            });
        }
        if self.config.require_json_values {
            if let Err(e) = serde_json::from_slice::<IgnoredAny>(value) {
                return Err(ValidationError::InvalidValue {
                    key: key.to_string(),
                    reason: format!("not a JSON document: {e}"),
                });
            }
        }
        Ok(())
    }
}

/// Drops or corrects bad updates and suppresses no-op ones before they reach the cache.
///
/// Only the last revision and value of each present key is remembered.
pub struct ValidationFilter {
    sink: Arc<dyn SyncerCallbacks>,
    validator: Box<dyn Validator>,
    last_seen: Mutex<HashMap<String, (Revision, Bytes)>>,
}

impl ValidationFilter {
    pub fn new(
        sink: Arc<dyn SyncerCallbacks>,
        validator: Box<dyn Validator>,
    ) -> Self {
        Self {
            sink,
            validator,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the update to forward, or `None` when it must be dropped.
    ///
    /// - malformed key: dropped
    /// - invalid value: forwarded as a deletion of the key
    /// - revision not newer than the key's last forwarded revision: dropped
    /// - same value as last forwarded, or deletion of an absent key: dropped
    pub fn process(
        &self,
        mut update: Update,
    ) -> Option<Update> {
        if let Err(e) = self.validator.validate_key(&update.key) {
            warn!("dropping update at revision {}: {}", update.revision, e);
            VALIDATION_DROPPED_TOTAL.with_label_values(&["invalid_key"]).inc();
            return None;
        }

        if let Some(value) = &update.value {
            if let Err(e) = self.validator.validate_value(&update.key, value) {
                warn!("treating update at revision {} as deletion: {}", update.revision, e);
                VALIDATION_CONVERTED_TOTAL.inc();
                update.value = None;
            }
        }

        let mut last_seen = self.last_seen.lock();
        let previous = last_seen.get(&update.key).cloned();

        if let Some((last_revision, _)) = &previous {
            if update.revision <= *last_revision {
                warn!(
                    key = %update.key,
                    "dropping update at revision {}, key already at {}",
                    update.revision, last_revision
                );
                VALIDATION_DROPPED_TOTAL.with_label_values(&["revision_regression"]).inc();
                return None;
            }
        }

        match (&update.value, &previous) {
            (None, None) => {
                debug!(key = %update.key, "deletion of absent key suppressed");
                VALIDATION_DROPPED_TOTAL.with_label_values(&["duplicate"]).inc();
                None
            }
            (Some(value), Some((_, last_value))) if value == last_value => {
                debug!(key = %update.key, "identical value suppressed");
                VALIDATION_DROPPED_TOTAL.with_label_values(&["duplicate"]).inc();
                None
            }
            (Some(value), _) => {
                last_seen.insert(update.key.clone(), (update.revision, value.clone()));
                Some(update)
            }
            (None, Some(_)) => {
                last_seen.remove(&update.key);
                Some(update)
            }
        }
    }

    /// Keys currently known to be present
    pub fn tracked_keys(&self) -> usize {
        self.last_seen.lock().len()
    }
}

#[async_trait]
impl SyncerCallbacks for ValidationFilter {
    async fn on_status_updated(
        &self,
        status: SyncStatus,
    ) -> crate::Result<()> {
        self.sink.on_status_updated(status).await
    }

    async fn on_updates(
        &self,
        updates: Vec<Update>,
    ) -> crate::Result<()> {
        let valid: Vec<Update> = updates.into_iter().filter_map(|u| self.process(u)).collect();
        if valid.is_empty() {
            return Ok(());
        }
        self.sink.on_updates(valid).await
    }
}
