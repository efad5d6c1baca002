//! # kiln-store
//!
//! Multi-version table storage for KilnDB.
//!
//! This crate implements:
//! - Version chains (committed prefix, provisional suffix)
//! - Table stores with ordered traversal
//! - Forward-only cursors over live stores
//! - The table directory with transactional binding redirects
//! - Run files and their crash-leftover sweep

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Forward-only cursors
pub mod cursor;

/// The table directory
pub mod directory;

/// Run file naming
pub mod namer;

/// Run file reading and writing
pub mod runfile;

/// Multi-version table stores
pub mod table;

/// Version chain storage
pub mod version;
