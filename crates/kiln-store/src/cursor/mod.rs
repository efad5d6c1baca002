//! Forward-only cursors over live table stores.
//!
//! A destination build walks its source table with a
//! [`MultiVersionCursor`]. The cursor takes the store's read lock only
//! long enough to copy one row, so writers interleave freely with the
//! scan. Rows inserted ahead of the cursor's position are picked up by
//! later advances; rows inserted at or behind it are not (the write
//! path is responsible for those).

use std::sync::Arc;

use kiln_common::types::Key;

use crate::table::TableStore;
use crate::version::RowSnapshot;

/// Cursor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// The cursor has more rows to visit.
    Scanning,
    /// The cursor has walked past the last row.
    Exhausted,
}

/// Statistics collected during a cursor scan.
#[derive(Debug, Clone, Default)]
pub struct CursorStats {
    /// Number of rows handed out by `advance`.
    pub rows_read: u64,
    /// Number of re-reads of the current row.
    pub rereads: u64,
    /// Number of rows that carried provisional versions when read.
    pub rows_with_provisional: u64,
}

/// A forward-only cursor over a live table store.
///
/// The cursor remembers the key of the last row it returned and always
/// moves to the smallest key strictly greater than it. It never holds
/// the store lock between calls.
#[derive(Debug)]
pub struct MultiVersionCursor {
    store: Arc<TableStore>,
    position: Option<Key>,
    state: CursorState,
    stats: CursorStats,
}

impl MultiVersionCursor {
    /// Creates a cursor positioned before the first row of `store`.
    #[must_use]
    pub fn new(store: Arc<TableStore>) -> Self {
        Self {
            store,
            position: None,
            state: CursorState::Scanning,
            stats: CursorStats::default(),
        }
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub const fn state(&self) -> CursorState {
        self.state
    }

    /// Returns true if the cursor has walked past the last row.
    #[inline]
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.state == CursorState::Exhausted
    }

    /// Returns the key of the last row returned, if any.
    #[must_use]
    pub fn last_key(&self) -> Option<&Key> {
        self.position.as_ref()
    }

    /// Moves to the next row and returns a snapshot of it.
    ///
    /// Returns `None` when no row remains beyond the current position.
    /// A later `advance` may still find rows if writers insert ahead of
    /// the position afterwards, so exhaustion is judged per call by the
    /// build loop.
    pub fn advance(&mut self) -> Option<RowSnapshot> {
        match self.store.next_row_after(self.position.as_ref()) {
            Some(snapshot) => {
                self.position = Some(snapshot.key.clone());
                self.state = CursorState::Scanning;
                self.stats.rows_read += 1;
                if snapshot.has_provisional() {
                    self.stats.rows_with_provisional += 1;
                }
                Some(snapshot)
            }
            None => {
                self.state = CursorState::Exhausted;
                None
            }
        }
    }

    /// Re-reads the row at the current position.
    ///
    /// Returns `None` before the first `advance`, or if the row has
    /// disappeared since it was read.
    pub fn reread_current(&mut self) -> Option<RowSnapshot> {
        let key = self.position.as_ref()?;
        self.stats.rereads += 1;
        self.store.read_row(key)
    }

    /// Returns the statistics collected so far.
    #[must_use]
    pub const fn stats(&self) -> &CursorStats {
        &self.stats
    }
}
