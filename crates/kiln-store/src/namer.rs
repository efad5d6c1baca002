//! Run file naming.
//!
//! File names convey provenance: which transaction created the file,
//! which destination of its build the file backs, and whether it came
//! from a finished build or an error-path empty redirect. That makes
//! leftovers attributable when inspecting a data directory by hand.

use std::sync::atomic::{AtomicU64, Ordering};

use kiln_common::constants::RUN_FILE_EXT;
use kiln_common::types::{FileId, TableId, TxnId};

/// Allocates file IDs and formats run file names.
#[derive(Debug)]
pub struct FileNamer {
    next_file_id: AtomicU64,
}

impl FileNamer {
    /// Creates a namer starting at the first valid file ID.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_file_id: AtomicU64::new(FileId::FIRST.as_u64()),
        }
    }

    /// Creates a namer starting at a specific raw ID.
    #[must_use]
    pub const fn starting_at(id: u64) -> Self {
        Self {
            next_file_id: AtomicU64::new(id),
        }
    }

    /// Allocates the next file ID. IDs are never reused.
    pub fn next_file_id(&self) -> FileId {
        FileId::new(self.next_file_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Name for a table's initial (empty) backing file.
    #[must_use]
    pub fn table_file_name(&self, table_id: TableId, file_id: FileId) -> String {
        format!(
            "table-{}-{:08x}.{}",
            table_id,
            file_id.as_u64(),
            RUN_FILE_EXT
        )
    }

    /// Name for a run file produced by a destination build.
    #[must_use]
    pub fn build_file_name(&self, txn: TxnId, dest_index: usize, file_id: FileId) -> String {
        format!(
            "t{}-d{}-build-{:08x}.{}",
            txn,
            dest_index,
            file_id.as_u64(),
            RUN_FILE_EXT
        )
    }

    /// Name for an empty run file, from pre-emptying or an error-path
    /// redirect.
    #[must_use]
    pub fn empty_file_name(&self, txn: TxnId, dest_index: usize, file_id: FileId) -> String {
        format!(
            "t{}-d{}-empty-{:08x}.{}",
            txn,
            dest_index,
            file_id.as_u64(),
            RUN_FILE_EXT
        )
    }
}

impl Default for FileNamer {
    fn default() -> Self {
        Self::new()
    }
}
