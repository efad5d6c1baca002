//! # kiln-common
//!
//! Common types, errors, and utilities for KilnDB.
//!
//! This crate provides the foundational types and abstractions used across
//! all KilnDB components. It includes:
//!
//! - **Types**: Core identifiers (`TableId`, `TxnId`, `CommitSeq`), keys, and values
//! - **Errors**: Unified error handling with `KilnError`
//! - **Config**: Engine configuration structures
//! - **Constants**: System-wide constants and limits
//!
//! ## Example
//!
//! ```rust
//! use kiln_common::types::{TableId, TxnId, Key, Value};
//! use kiln_common::error::KilnResult;
//!
//! fn example() -> KilnResult<()> {
//!     let table_id = TableId::new(42);
//!     let txn_id = TxnId::new(1);
//!     let key = Key::from_bytes(b"hello");
//!     let value = Value::from_bytes(b"world");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use error::{KilnError, KilnResult};
pub use types::{CommitSeq, FileId, Key, Lsn, TableId, TxnId, Value, VersionId};
