//! Engine configuration structures.
//!
//! These structures define all configurable aspects of a KilnDB instance.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::DEFAULT_POLL_PERIOD_ROWS;
use crate::types::{MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// Main engine configuration.
///
/// # Example
///
/// ```rust
/// use kiln_common::config::EngineConfig;
///
/// let config = EngineConfig::default();
/// assert_eq!(config.max_key_size, 16 * 1024);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Data directory for run files and the recovery log.
    pub data_dir: PathBuf,

    /// Maximum key size in bytes.
    /// Default: 16384 (16 KB)
    pub max_key_size: usize,

    /// Maximum value size in bytes.
    /// Default: 1048576 (1 MB)
    pub max_value_size: usize,

    /// Sync run files and the recovery log to disk on every durable write.
    /// Default: true
    pub sync_writes: bool,

    /// Number of rows between progress polls during a destination build.
    /// Default: 1000
    pub poll_period_rows: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_key_size: MAX_KEY_SIZE,
            max_value_size: MAX_VALUE_SIZE,
            sync_writes: true,
            poll_period_rows: DEFAULT_POLL_PERIOD_ROWS,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with the specified data directory.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Creates a configuration for testing.
    ///
    /// Disables syncing so tests run fast.
    #[must_use]
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            sync_writes: false,
            ..Default::default()
        }
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_key_size == 0 || self.max_key_size > MAX_KEY_SIZE {
            return Err(format!(
                "max_key_size must be between 1 and {MAX_KEY_SIZE} bytes"
            ));
        }

        if self.max_value_size > MAX_VALUE_SIZE {
            return Err(format!(
                "max_value_size must be at most {MAX_VALUE_SIZE} bytes"
            ));
        }

        if self.poll_period_rows == 0 {
            return Err("poll_period_rows must be at least 1".to_string());
        }

        Ok(())
    }
}
