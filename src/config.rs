//! Pool configuration.
//!
//! A [`PoolConfig`] carries everything `MetadataPool::create` needs besides
//! the registry and the optional worker. It can be built in code or loaded
//! from JSON; every field except `pool_type` and `capacity` has a default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};
use crate::pool::PoolType;

/// Largest supported slot window.
pub const MAX_POOL_CAPACITY: usize = 128;

/// Default bound on waiting for deferred pool creation.
pub const DEFAULT_CREATION_TIMEOUT_MS: u64 = 5000;

/// Default upper bound on one slot's property blob.
pub const DEFAULT_MAX_BLOB_BYTES: usize = 1 << 20;

/// Tags at or below this size are zero-filled under [`InputZeroFill::Small`].
pub const MAX_INPLACE_TAG_SIZE: usize = 8;

/// What an input-pool read does when the attached buffer lacks the tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputZeroFill {
    /// Report the tag as absent.
    #[default]
    Off,
    /// Insert zeroes for small tags and properties.
    Small,
    /// Insert zeroes for every tag.
    All,
}

fn default_name() -> String {
    "pool".to_string()
}

fn default_creation_timeout_ms() -> u64 {
    DEFAULT_CREATION_TIMEOUT_MS
}

fn default_max_blob_bytes() -> usize {
    DEFAULT_MAX_BLOB_BYTES
}

/// Construction parameters for a metadata pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Role of the pool; fixes storage mode and legal operations.
    pub pool_type: PoolType,
    /// Number of slots in the circular window.
    pub capacity: usize,
    /// Pipeline reported to observers.
    #[serde(default)]
    pub pipeline_id: u32,
    /// Name used in log lines.
    #[serde(default = "default_name")]
    pub name: String,
    /// Width of the sticky-buffer grace window after a flush.
    #[serde(default)]
    pub early_tag_count: u32,
    /// Bound on waiting for deferred creation, in milliseconds.
    #[serde(default = "default_creation_timeout_ms")]
    pub creation_timeout_ms: u64,
    /// Upper bound on one slot's property blob, in bytes.
    #[serde(default = "default_max_blob_bytes")]
    pub max_blob_bytes: usize,
    /// Input-pool zero-fill policy.
    #[serde(default)]
    pub zero_fill_input: InputZeroFill,
}

impl PoolConfig {
    /// Configuration with defaults for everything but type and capacity.
    pub fn new(pool_type: PoolType, capacity: usize) -> Self {
        Self {
            pool_type,
            capacity,
            pipeline_id: 0,
            name: default_name(),
            early_tag_count: 0,
            creation_timeout_ms: DEFAULT_CREATION_TIMEOUT_MS,
            max_blob_bytes: DEFAULT_MAX_BLOB_BYTES,
            zero_fill_input: InputZeroFill::Off,
        }
    }

    /// Set the pool name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the pipeline id reported to observers.
    pub fn with_pipeline_id(mut self, pipeline_id: u32) -> Self {
        self.pipeline_id = pipeline_id;
        self
    }

    /// Set the sticky-buffer grace window.
    pub fn with_early_tag_count(mut self, early_tag_count: u32) -> Self {
        self.early_tag_count = early_tag_count;
        self
    }

    /// Set the creation wait bound.
    pub fn with_creation_timeout(mut self, timeout: Duration) -> Self {
        self.creation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the blob size bound.
    pub fn with_max_blob_bytes(mut self, max_blob_bytes: usize) -> Self {
        self.max_blob_bytes = max_blob_bytes;
        self
    }

    /// Set the input zero-fill policy.
    pub fn with_zero_fill_input(mut self, zero_fill: InputZeroFill) -> Self {
        self.zero_fill_input = zero_fill;
        self
    }

    /// Creation wait bound as a [`Duration`].
    pub fn creation_timeout(&self) -> Duration {
        Duration::from_millis(self.creation_timeout_ms)
    }

    /// Parse a configuration from JSON.
    pub fn from_json_str(json: &str) -> PoolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> PoolResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check the type/capacity pairing and the window bounds.
    pub fn validate(&self) -> PoolResult<()> {
        if self.pool_type.is_single_slot() {
            if self.capacity != 1 {
                return Err(PoolError::InvalidArg(format!(
                    "{} pool requires exactly one slot, got {}",
                    self.pool_type, self.capacity
                )));
            }
        } else if self.capacity < 2 || self.capacity > MAX_POOL_CAPACITY {
            return Err(PoolError::InvalidArg(format!(
                "{} pool capacity {} outside 2..={}",
                self.pool_type, self.capacity, MAX_POOL_CAPACITY
            )));
        }
        if self.early_tag_count as usize > self.capacity {
            return Err(PoolError::InvalidArg(format!(
                "early tag count {} exceeds capacity {}",
                self.early_tag_count, self.capacity
            )));
        }
        if self.creation_timeout_ms == 0 {
            return Err(PoolError::InvalidArg(
                "creation timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_json() {
        let config =
            PoolConfig::from_json_str(r#"{"pool_type": "per_frame_result", "capacity": 8}"#)
                .unwrap();
        assert_eq!(config.pool_type, PoolType::PerFrameResult);
        assert_eq!(config.capacity, 8);
        assert_eq!(config.name, "pool");
        assert_eq!(config.creation_timeout_ms, DEFAULT_CREATION_TIMEOUT_MS);
        assert_eq!(config.zero_fill_input, InputZeroFill::Off);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_capacity_rejected() {
        let result = PoolConfig::from_json_str(r#"{"pool_type": "static"}"#);
        assert!(matches!(result, Err(PoolError::Config(_))));
    }

    #[test]
    fn test_single_slot_pairing() {
        assert!(PoolConfig::new(PoolType::Static, 1).validate().is_ok());
        assert!(PoolConfig::new(PoolType::PerUsecase, 1).validate().is_ok());
        assert!(PoolConfig::new(PoolType::Static, 2).validate().is_err());
        assert!(PoolConfig::new(PoolType::PerFrameInput, 1).validate().is_err());
        assert!(PoolConfig::new(PoolType::PerFrameInternal, MAX_POOL_CAPACITY + 1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_early_tag_window_bounded_by_capacity() {
        let config = PoolConfig::new(PoolType::PerFrameResult, 4).with_early_tag_count(5);
        assert!(matches!(config.validate(), Err(PoolError::InvalidArg(_))));
        let config = PoolConfig::new(PoolType::PerFrameResult, 4).with_early_tag_count(4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_and_file_roundtrip() {
        let config = PoolConfig::new(PoolType::PerFrameInput, 6)
            .with_name("input")
            .with_pipeline_id(3)
            .with_zero_fill_input(InputZeroFill::Small)
            .with_creation_timeout(Duration::from_millis(250));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&config).unwrap().as_bytes())
            .unwrap();
        let loaded = PoolConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.creation_timeout(), Duration::from_millis(250));
    }
}
