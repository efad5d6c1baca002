//! Error handling for KilnDB.
//!
//! This module provides a unified error type and result alias used
//! across all KilnDB components.

mod engine;

pub use engine::{ErrorCode, KilnError};

/// Result type alias for KilnDB operations.
pub type KilnResult<T> = std::result::Result<T, KilnError>;
