//! Recovery log configuration.

use std::path::PathBuf;

use kiln_common::constants::{MAX_WAL_RECORD_SIZE, WAL_FILE_NAME, WAL_RECORD_HEADER_SIZE};

/// Sync policy for log writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Sync after every appended record (safest, slowest).
    #[default]
    EveryWrite,
    /// Sync only when the log is closed. Commit and checkpoint records
    /// still sync immediately.
    OnClose,
}

/// Configuration for the recovery log.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the log file.
    pub dir: PathBuf,

    /// Maximum size of a single log record.
    pub max_record_size: usize,

    /// Sync policy for durability.
    pub sync_policy: SyncPolicy,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            max_record_size: MAX_WAL_RECORD_SIZE,
            sync_policy: SyncPolicy::default(),
        }
    }
}

impl WalConfig {
    /// Creates a configuration with the specified directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Sets the maximum record size.
    #[must_use]
    pub fn with_max_record_size(mut self, size: usize) -> Self {
        self.max_record_size = size;
        self
    }

    /// Sets the sync policy.
    #[must_use]
    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    /// Returns the path of the log file.
    pub fn log_path(&self) -> PathBuf {
        self.dir.join(WAL_FILE_NAME)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_record_size <= WAL_RECORD_HEADER_SIZE {
            return Err(format!(
                "max record size must exceed the header size ({WAL_RECORD_HEADER_SIZE} bytes)"
            ));
        }

        if self.max_record_size > MAX_WAL_RECORD_SIZE {
            return Err(format!(
                "max record size must be at most {MAX_WAL_RECORD_SIZE} bytes"
            ));
        }

        Ok(())
    }
}
