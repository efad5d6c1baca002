//! Type definitions for KilnDB.
//!
//! This module contains all core type definitions used across the engine.

mod ids;
mod keys;

pub use ids::{CommitSeq, FileId, Lsn, TableId, TxnId, VersionId};
pub use keys::{Key, Value, MAX_KEY_SIZE, MAX_VALUE_SIZE};
