//! System-wide constants for KilnDB.
//!
//! This module defines constants used across the engine.

// =============================================================================
// Run File Constants
// =============================================================================

/// Magic number for run file headers.
pub const RUN_FILE_MAGIC: u32 = 0x4B52_554E; // "KRUN" in ASCII

/// Version number for the run file format.
pub const RUN_FILE_VERSION: u32 = 1;

/// Run file header size in bytes.
///
/// The header contains: magic (4), version (4), table_id (8),
/// row_count (8), payload checksum (4) = 28 bytes. We round up
/// to 32 for alignment.
pub const RUN_FILE_HEADER_SIZE: usize = 32;

/// File extension for finished run files.
pub const RUN_FILE_EXT: &str = "run";

/// File extension for run files still being written.
///
/// Files with this extension are orphans after a crash and are removed
/// when the engine opens.
pub const RUN_TMP_EXT: &str = "tmp";

// =============================================================================
// Recovery Log Constants
// =============================================================================

/// File name of the recovery log inside the data directory.
pub const WAL_FILE_NAME: &str = "kiln.wal";

/// Magic number for the recovery log header.
pub const WAL_MAGIC: u32 = 0x4B4C_5741; // "KLWA" in ASCII

/// Recovery log record header size in bytes.
///
/// Contains: lsn (8), txn_id (8), type (1), reserved (1),
/// payload length (4), checksum (4) = 26 bytes, rounded to 32.
pub const WAL_RECORD_HEADER_SIZE: usize = 32;

/// Maximum recovery log record size (10 MB).
pub const MAX_WAL_RECORD_SIZE: usize = 10 * 1024 * 1024;

// =============================================================================
// Destination Build Constants
// =============================================================================

/// Default number of rows between progress polls during a build.
pub const DEFAULT_POLL_PERIOD_ROWS: u64 = 1000;
