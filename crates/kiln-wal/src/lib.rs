//! # kiln-wal
//!
//! Recovery log and checkpointing for KilnDB.
//!
//! This crate provides the durability bookkeeping the engine writes
//! alongside its in-memory state:
//!
//! - **Recovery Log**: A single-file append-only log of transaction
//!   outcomes, hot index build brackets, and checkpoint brackets.
//!   Every record carries a CRC32 checksum; reopening validates the
//!   log and resumes after the last complete record.
//!
//! - **Hot Index Registration**: Begin records list the run files an
//!   in-progress build is writing, so an interrupted build's files
//!   can be identified after restart.
//!
//! - **Checkpointing**: [`checkpoint::CheckpointManager`] brackets a
//!   caller-supplied flush with begin and end records.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                   CheckpointManager                    │
//! │           begin record → flush → end record            │
//! └───────────────────────────┬────────────────────────────┘
//!                             │
//! ┌───────────────────────────▼────────────────────────────┐
//! │                      RecoveryLog                       │
//! │     append_* / records() / open_hot_indexes()          │
//! └───────────────────────────┬────────────────────────────┘
//!                             │
//! ┌───────────────────────────▼────────────────────────────┐
//! │              kiln.wal (header + records)               │
//! │   RecordHeader (32 B, CRC32) + payload per record      │
//! └────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error types for recovery log operations.
pub mod error;

/// Recovery log configuration.
pub mod config;

/// Record types and serialization.
///
/// This module provides:
/// - [`record::RecordHeader`]: Fixed-size checksummed record header
/// - [`record::RecordType`] and [`record::WalRecord`]: Typed records
/// - [`record::Payload`]: Payload serialization trait
pub mod record;

/// The append-only recovery log.
pub mod log;

/// Checkpoint coordination.
pub mod checkpoint;

// Re-export commonly used types

pub use checkpoint::{CheckpointInfo, CheckpointManager, CheckpointState, CheckpointStats};
pub use config::{SyncPolicy, WalConfig};
pub use error::{WalError, WalResult};
pub use log::{RecoveryLog, WalStats};
pub use record::{RecordHeader, RecordType, WalPayload, WalRecord};
