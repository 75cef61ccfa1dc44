use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use soulstore_engine::EngineConfig;
///
/// let config = EngineConfig::from_json(r#"{"debounce_ms": 50}"#).unwrap();
/// assert_eq!(config.debounce_ms, 50);
/// assert_eq!(config.record_marker, "SSR1:");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quiet window before pending entities are flushed (ms).
    pub debounce_ms: u64,
    /// Version written into every record envelope.
    pub persister_version: u32,
    /// Fixed prefix of stored records.
    pub record_marker: String,
    /// Deleting an entity also drops its backend record right away.
    pub tombstone_purges_backend: bool,
    /// Consecutive failed flushes after which an entity is given up on.
    pub max_flush_retries: u32,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// How long a restore waits for peers when the backend has no record (ms).
    pub sync_restore_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 25,
            persister_version: 1,
            record_marker: "SSR1:".to_string(),
            tombstone_purges_backend: false,
            max_flush_retries: 5,
            event_capacity: 256,
            sync_restore_timeout_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Parses a configuration from JSON, filling unset fields with defaults.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.record_marker.is_empty() {
            return Err(EngineError::Config("record_marker must not be empty".into()));
        }
        if self.event_capacity == 0 {
            return Err(EngineError::Config("event_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn sync_restore_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_restore_timeout_ms)
    }
}
