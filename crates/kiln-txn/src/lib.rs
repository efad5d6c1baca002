//! # kiln-txn
//!
//! Transaction management for KilnDB.
//!
//! This crate coordinates the transactions that bulk builds run
//! inside:
//!
//! - **Transaction Lifecycle**: Begin, prepare, commit, and abort,
//!   with provisional versions flipped or removed per the write set.
//!
//! - **Row and Table Locks**: Fail-fast shared/exclusive locks. Rows
//!   are locked by ordinary writers; build destinations are held
//!   exclusively by their creating transaction.
//!
//! - **Capture and Pinning**: A state freeze plus owner pins let a
//!   replay observe a row's provisional owners and keep them from
//!   retiring until the row reaches its destination.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   TransactionManager                     │
//! │                           │                              │
//! │         ┌─────────────────┼─────────────────┐            │
//! │         ▼                 ▼                 ▼            │
//! │  ┌─────────────┐  ┌───────────────┐  ┌─────────────┐     │
//! │  │ LockManager │  │  write  sets  │  │ StateFreeze │     │
//! │  │ (rows and   │  │  (per  txn)   │  │  + PinSet   │     │
//! │  │  tables)    │  └───────────────┘  └─────────────┘     │
//! │  └─────────────┘          │                              │
//! │                           ▼                              │
//! │              TableStore / TableDirectory                 │
//! │                     (kiln-store)                         │
//! └──────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Transaction lifecycle management.
///
/// This module provides:
/// - [`manager::TransactionManager`]: Main coordinator for transactions
/// - [`manager::TxnState`]: Transaction lifecycle states
/// - [`manager::StateFreeze`] and [`manager::PinSet`]: Capture support
pub mod manager;

/// Row and table lock implementation.
///
/// This module provides:
/// - [`lock::LockManager`]: Fail-fast locks over rows and tables
/// - [`lock::ResourceId`]: What gets locked
/// - [`lock::LockMode`]: Shared and exclusive modes
pub mod lock;

// Re-export commonly used types

pub use manager::{
    AbortOutcome, CommitOutcome, PinSet, StateFreeze, TransactionManager, TxnOutcome, TxnState,
    TxnStats,
};

pub use lock::{LockManager, LockMode, LockResult, LockStats, ResourceId};
