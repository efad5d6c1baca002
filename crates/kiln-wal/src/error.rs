//! Recovery log error types.

use std::io;
use thiserror::Error;

use kiln_common::error::KilnError;
use kiln_common::types::Lsn;

/// Result type for recovery log operations.
pub type WalResult<T> = Result<T, WalError>;

/// Errors that can occur during recovery log operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// I/O error during log operations.
    #[error("recovery log I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: io::Error,
    },

    /// Invalid log file magic number.
    #[error("invalid recovery log magic: expected {expected:#010x}, found {found:#010x}")]
    InvalidMagic {
        /// Expected magic value.
        expected: u32,
        /// Magic value found in the file.
        found: u32,
    },

    /// Unsupported log file version.
    #[error("unsupported recovery log version: expected {expected}, found {found}")]
    UnsupportedVersion {
        /// Highest supported version.
        expected: u32,
        /// Version found in the file.
        found: u32,
    },

    /// Log content is corrupted.
    #[error("recovery log corrupted at LSN {lsn}: {reason}")]
    Corrupted {
        /// LSN of the damaged record.
        lsn: Lsn,
        /// What was wrong.
        reason: String,
    },

    /// Record checksum mismatch.
    #[error(
        "recovery log checksum mismatch at LSN {lsn}: expected {expected:#010x}, computed {computed:#010x}"
    )]
    ChecksumMismatch {
        /// LSN of the damaged record.
        lsn: Lsn,
        /// Checksum stored in the record.
        expected: u32,
        /// Checksum computed from the bytes read.
        computed: u32,
    },

    /// Record too large.
    #[error("recovery log record too large: {size} bytes exceeds maximum {max} bytes")]
    RecordTooLarge {
        /// Size of the offending record.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Record deserialization error.
    #[error("failed to deserialize recovery log record: {reason}")]
    DeserializationError {
        /// What was wrong.
        reason: String,
    },

    /// Record serialization error.
    #[error("failed to serialize recovery log record: {reason}")]
    SerializationError {
        /// What was wrong.
        reason: String,
    },

    /// Configuration error.
    #[error("recovery log configuration error: {reason}")]
    ConfigError {
        /// What was wrong.
        reason: String,
    },

    /// The log has been closed.
    #[error("recovery log is closed")]
    Closed,
}

impl WalError {
    /// Creates a corruption error.
    pub fn corrupted(lsn: Lsn, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            lsn,
            reason: reason.into(),
        }
    }

    /// Creates a checksum mismatch error.
    pub fn checksum_mismatch(lsn: Lsn, expected: u32, computed: u32) -> Self {
        Self::ChecksumMismatch {
            lsn,
            expected,
            computed,
        }
    }

    /// Creates a record too large error.
    pub fn record_too_large(size: usize, max: usize) -> Self {
        Self::RecordTooLarge { size, max }
    }

    /// Creates a deserialization error.
    pub fn deserialization_error(reason: impl Into<String>) -> Self {
        Self::DeserializationError {
            reason: reason.into(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization_error(reason: impl Into<String>) -> Self {
        Self::SerializationError {
            reason: reason.into(),
        }
    }

    /// Creates a config error.
    pub fn config_error(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
        }
    }

    /// Returns true if this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupted { .. }
                | Self::ChecksumMismatch { .. }
                | Self::InvalidMagic { .. }
                | Self::DeserializationError { .. }
        )
    }
}

impl From<WalError> for KilnError {
    fn from(err: WalError) -> Self {
        match err {
            WalError::Corrupted { lsn, reason } => KilnError::WalCorrupted { lsn, reason },
            WalError::ChecksumMismatch { lsn, .. } => KilnError::WalCorrupted {
                lsn,
                reason: "checksum mismatch".to_string(),
            },
            WalError::InvalidMagic { .. }
            | WalError::UnsupportedVersion { .. }
            | WalError::DeserializationError { .. } => KilnError::WalCorrupted {
                lsn: Lsn::INVALID,
                reason: err.to_string(),
            },
            other => KilnError::WalWriteFailed {
                reason: other.to_string(),
            },
        }
    }
}
