//! Configuration for KilnDB.
//!
//! This module provides the top-level engine configuration.

mod engine;

pub use engine::EngineConfig;
