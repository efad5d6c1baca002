//! Engine error types.
//!
//! Provides error types for all engine operations.

use std::fmt;
use thiserror::Error;

use crate::types::{Key, Lsn, TableId, TxnId};

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Unknown or unspecified error.
    Unknown = 0x0000,
    /// Internal error (bug).
    Internal = 0x0001,
    /// Invalid argument provided.
    InvalidArgument = 0x0002,
    /// Operation not valid in the current state.
    InvalidState = 0x0003,
    /// Operation was cancelled.
    Cancelled = 0x0004,

    // I/O errors (0x0100 - 0x01FF)
    /// General I/O error.
    Io = 0x0100,
    /// Data corruption detected.
    Corruption = 0x0101,

    // Store errors (0x0200 - 0x02FF)
    /// Table not found.
    TableNotFound = 0x0200,
    /// Key too large.
    KeyTooLarge = 0x0201,
    /// Value too large.
    ValueTooLarge = 0x0202,
    /// Duplicate key in a unique destination.
    DuplicateKey = 0x0203,
    /// Destination table is not empty.
    DestinationNotEmpty = 0x0204,
    /// Destination table has a build in progress.
    DestinationBusy = 0x0205,

    // Transaction errors (0x0300 - 0x03FF)
    /// Transaction not found.
    TxnNotFound = 0x0300,
    /// Transaction has already finished.
    TxnRetired = 0x0301,
    /// Lock acquisition failed.
    LockUnavailable = 0x0302,

    // Recovery log errors (0x0400 - 0x04FF)
    /// Recovery log is corrupted.
    WalCorrupted = 0x0400,
    /// Recovery log write failed.
    WalWriteFailed = 0x0401,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "I/O",
            0x02 => "Store",
            0x03 => "Transaction",
            0x04 => "Log",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The main error type for KilnDB.
///
/// This enum covers all errors that can occur during engine operations.
/// Each variant includes relevant context for debugging.
///
/// Errors are cloneable: a failed build remembers its first error and
/// returns a copy of it from every later call on the same handle.
///
/// # Example
///
/// ```rust
/// use kiln_common::error::{KilnError, KilnResult};
/// use kiln_common::types::TableId;
///
/// fn open_table(table_id: TableId) -> KilnResult<()> {
///     Err(KilnError::TableNotFound { table_id })
/// }
/// ```
#[derive(Debug, Clone, Error)]
pub enum KilnError {
    // ==========================================================================
    // General Errors
    // ==========================================================================
    /// Internal error - this indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// Operation not valid in the current state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Error message.
        message: String,
    },

    /// Operation was cancelled by a poll callback.
    #[error("operation was cancelled")]
    Cancelled,

    // ==========================================================================
    // I/O Errors
    // ==========================================================================
    /// I/O error from the underlying system.
    ///
    /// Carries the rendered message rather than the source error so the
    /// variant stays cloneable.
    #[error("I/O error: {message}")]
    Io {
        /// Rendered I/O error message.
        message: String,
    },

    /// Data corruption detected.
    #[error("data corruption detected: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    // ==========================================================================
    // Store Errors
    // ==========================================================================
    /// Table not found.
    #[error("table {table_id} not found")]
    TableNotFound {
        /// The missing table ID.
        table_id: TableId,
    },

    /// Key is too large.
    #[error("key size {size} exceeds maximum {max_size}")]
    KeyTooLarge {
        /// Actual key size.
        size: usize,
        /// Maximum allowed size.
        max_size: usize,
    },

    /// Value is too large.
    #[error("value size {size} exceeds maximum {max_size}")]
    ValueTooLarge {
        /// Actual value size.
        size: usize,
        /// Maximum allowed size.
        max_size: usize,
    },

    /// Duplicate key generated for a unique destination.
    #[error("duplicate key {key} in destination {table_id}")]
    DuplicateKey {
        /// The destination table.
        table_id: TableId,
        /// The duplicated key.
        key: Key,
    },

    /// Destination table is not empty.
    #[error("destination table {table_id} is not empty")]
    DestinationNotEmpty {
        /// The non-empty destination.
        table_id: TableId,
    },

    /// Destination table already has a build in progress.
    #[error("destination table {table_id} has a build in progress")]
    DestinationBusy {
        /// The busy destination.
        table_id: TableId,
    },

    // ==========================================================================
    // Transaction Errors
    // ==========================================================================
    /// Transaction not found.
    #[error("transaction {txn_id} not found")]
    TxnNotFound {
        /// The missing transaction.
        txn_id: TxnId,
    },

    /// Transaction has already committed or aborted.
    #[error("transaction {txn_id} has already finished")]
    TxnRetired {
        /// The finished transaction.
        txn_id: TxnId,
    },

    /// Lock acquisition failed.
    #[error("lock unavailable for transaction {txn_id}: {reason}")]
    LockUnavailable {
        /// The transaction that could not acquire the lock.
        txn_id: TxnId,
        /// Reason for failure.
        reason: String,
    },

    // ==========================================================================
    // Recovery Log Errors
    // ==========================================================================
    /// Recovery log is corrupted.
    #[error("recovery log corrupted at LSN {lsn}: {reason}")]
    WalCorrupted {
        /// The LSN where corruption was detected.
        lsn: Lsn,
        /// Reason for corruption.
        reason: String,
    },

    /// Recovery log write failed.
    #[error("recovery log write failed: {reason}")]
    WalWriteFailed {
        /// Reason for failure.
        reason: String,
    },
}

impl KilnError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Internal { .. } => ErrorCode::Internal,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Io { .. } => ErrorCode::Io,
            Self::Corruption { .. } | Self::ChecksumMismatch { .. } => ErrorCode::Corruption,
            Self::TableNotFound { .. } => ErrorCode::TableNotFound,
            Self::KeyTooLarge { .. } => ErrorCode::KeyTooLarge,
            Self::ValueTooLarge { .. } => ErrorCode::ValueTooLarge,
            Self::DuplicateKey { .. } => ErrorCode::DuplicateKey,
            Self::DestinationNotEmpty { .. } => ErrorCode::DestinationNotEmpty,
            Self::DestinationBusy { .. } => ErrorCode::DestinationBusy,
            Self::TxnNotFound { .. } => ErrorCode::TxnNotFound,
            Self::TxnRetired { .. } => ErrorCode::TxnRetired,
            Self::LockUnavailable { .. } => ErrorCode::LockUnavailable,
            Self::WalCorrupted { .. } => ErrorCode::WalCorrupted,
            Self::WalWriteFailed { .. } => ErrorCode::WalWriteFailed,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockUnavailable { .. } | Self::DestinationBusy { .. }
        )
    }

    /// Returns true if this error indicates on-disk or in-log corruption.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. } | Self::ChecksumMismatch { .. } | Self::WalCorrupted { .. }
        )
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    #[must_use]
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = KilnError::TableNotFound {
            table_id: TableId::new(42),
        };
        assert_eq!(err.code(), ErrorCode::TableNotFound);
        assert_eq!(err.code().category(), "Store");
    }

    #[test]
    fn test_error_display() {
        let err = KilnError::TableNotFound {
            table_id: TableId::new(42),
        };
        assert_eq!(err.to_string(), "table 42 not found");
    }

    #[test]
    fn test_error_clone() {
        let err = KilnError::DuplicateKey {
            table_id: TableId::new(1),
            key: Key::from_str("dup"),
        };
        let copy = err.clone();
        assert_eq!(copy.code(), ErrorCode::DuplicateKey);
        assert_eq!(copy.to_string(), err.to_string());
    }

    #[test]
    fn test_retryable() {
        let busy = KilnError::DestinationBusy {
            table_id: TableId::new(3),
        };
        assert!(busy.is_retryable());
        assert!(!KilnError::Cancelled.is_retryable());
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KilnError = io_err.into();
        assert_eq!(err.code(), ErrorCode::Io);
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_corruption_category() {
        let err = KilnError::ChecksumMismatch {
            expected: 0x1234,
            actual: 0x5678,
        };
        assert!(err.is_corruption());
        assert_eq!(err.code().category(), "I/O");
    }
}
