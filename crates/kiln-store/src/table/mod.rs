//! Multi-version table stores.
//!
//! A [`TableStore`] is the in-memory content of one table binding: a
//! sorted map from row keys to version chains. All access goes through
//! the store's lock; chains themselves are plain data.
//!
//! Stores support ordered traversal (`next_row_after`), which is what
//! destination build cursors are made of: a cursor never holds the
//! store lock between rows, so writers interleave freely with a scan.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use kiln_common::types::{CommitSeq, Key, TableId, TxnId, Value, VersionId};

use crate::version::{RowSnapshot, RowVersion, VersionChain, VersionIdGenerator, VersionOp};

/// Statistics for a table store.
#[derive(Debug, Default)]
pub struct TableStats {
    /// Provisional versions appended.
    provisional_appends: AtomicU64,
    /// Versions flipped to committed.
    versions_committed: AtomicU64,
    /// Provisional versions removed by aborts.
    versions_aborted: AtomicU64,
    /// Committed baseline versions installed by replays or bulk loads.
    baseline_inserts: AtomicU64,
}

impl TableStats {
    fn record_append(&self) {
        self.provisional_appends.fetch_add(1, Ordering::Relaxed);
    }

    fn record_committed(&self, count: u64) {
        self.versions_committed.fetch_add(count, Ordering::Relaxed);
    }

    fn record_aborted(&self, count: u64) {
        self.versions_aborted.fetch_add(count, Ordering::Relaxed);
    }

    fn record_baseline(&self, count: u64) {
        self.baseline_inserts.fetch_add(count, Ordering::Relaxed);
    }

    /// Returns the number of provisional versions appended.
    #[must_use]
    pub fn provisional_appends(&self) -> u64 {
        self.provisional_appends.load(Ordering::Relaxed)
    }

    /// Returns the number of versions flipped to committed.
    #[must_use]
    pub fn versions_committed(&self) -> u64 {
        self.versions_committed.load(Ordering::Relaxed)
    }

    /// Returns the number of provisional versions removed by aborts.
    #[must_use]
    pub fn versions_aborted(&self) -> u64 {
        self.versions_aborted.load(Ordering::Relaxed)
    }

    /// Returns the number of committed baseline versions installed.
    #[must_use]
    pub fn baseline_inserts(&self) -> u64 {
        self.baseline_inserts.load(Ordering::Relaxed)
    }
}

/// The in-memory content of one table binding.
#[derive(Debug)]
pub struct TableStore {
    table_id: TableId,
    rows: RwLock<BTreeMap<Key, VersionChain>>,
    id_gen: VersionIdGenerator,
    stats: TableStats,
}

impl TableStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new(table_id: TableId) -> Self {
        Self {
            table_id,
            rows: RwLock::new(BTreeMap::new()),
            id_gen: VersionIdGenerator::new(),
            stats: TableStats::default(),
        }
    }

    /// Creates a store whose rows are the committed baseline `rows`,
    /// all at sequence `seq`.
    ///
    /// This is how the content of a finished run file becomes a live
    /// table binding.
    #[must_use]
    pub fn from_rows(table_id: TableId, rows: impl IntoIterator<Item = (Key, Value)>, seq: CommitSeq) -> Self {
        let store = Self::new(table_id);
        {
            let mut map = store.rows.write();
            let mut count = 0u64;
            for (key, value) in rows {
                let mut chain = VersionChain::new();
                chain.insert_committed(
                    store.id_gen.next(),
                    TxnId::INVALID,
                    seq,
                    VersionOp::Insert(value),
                );
                map.insert(key, chain);
                count += 1;
            }
            store.stats.record_baseline(count);
        }
        store
    }

    /// Returns the table this store backs.
    #[inline]
    #[must_use]
    pub const fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Returns the number of rows with at least one version.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    /// Returns true if the store has no rows at all, committed or
    /// provisional.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Appends a provisional version for `key` owned by `txn`.
    pub fn append_provisional(&self, key: Key, txn: TxnId, op: VersionOp) -> VersionId {
        let id = self.id_gen.next();
        let mut rows = self.rows.write();
        rows.entry(key)
            .or_default()
            .append_provisional(RowVersion::provisional(id, txn, op));
        self.stats.record_append();
        id
    }

    /// Installs a committed baseline version for `key` at sequence `seq`.
    ///
    /// Used by replays to carry a source row's resolved committed state
    /// into a destination. The version's author is unknown by then, so
    /// it is recorded as `TxnId::INVALID`.
    pub fn insert_baseline(&self, key: Key, seq: CommitSeq, op: VersionOp) -> VersionId {
        let id = self.id_gen.next();
        let mut rows = self.rows.write();
        rows.entry(key)
            .or_default()
            .insert_committed(id, TxnId::INVALID, seq, op);
        self.stats.record_baseline(1);
        id
    }

    /// Flips every provisional version of `key` owned by `txn` to
    /// committed at sequence `seq`. Returns the number flipped.
    pub fn commit_provisional(&self, key: &Key, txn: TxnId, seq: CommitSeq) -> usize {
        let mut rows = self.rows.write();
        let Some(chain) = rows.get_mut(key) else {
            return 0;
        };
        let moved = chain.commit_owned(txn, seq);
        self.stats.record_committed(moved as u64);
        moved
    }

    /// Removes every provisional version of `key` owned by `txn`.
    /// Returns the number removed. Rows left with no versions are
    /// pruned.
    pub fn abort_provisional(&self, key: &Key, txn: TxnId) -> usize {
        let mut rows = self.rows.write();
        let Some(chain) = rows.get_mut(key) else {
            return 0;
        };
        let removed = chain.abort_owned(txn);
        if chain.is_empty() {
            rows.remove(key);
        }
        self.stats.record_aborted(removed as u64);
        removed
    }

    /// Returns the resolved committed value of `key`, if present.
    #[must_use]
    pub fn resolved(&self, key: &Key) -> Option<Value> {
        self.rows.read().get(key).and_then(|c| c.resolved().cloned())
    }

    /// Takes a point-in-time copy of one row.
    #[must_use]
    pub fn read_row(&self, key: &Key) -> Option<RowSnapshot> {
        self.rows
            .read()
            .get(key)
            .map(|chain| chain.snapshot(key.clone()))
    }

    /// Returns a snapshot of the first row strictly after `position`,
    /// or of the first row when `position` is `None`.
    #[must_use]
    pub fn next_row_after(&self, position: Option<&Key>) -> Option<RowSnapshot> {
        let rows = self.rows.read();
        let mut range = match position {
            Some(key) => rows.range((Bound::Excluded(key.clone()), Bound::Unbounded)),
            None => rows.range::<Key, _>(..),
        };
        range
            .next()
            .map(|(key, chain)| chain.snapshot(key.clone()))
    }

    /// Returns the resolved committed view of the whole table, in key
    /// order. Deleted and purely provisional rows are absent.
    #[must_use]
    pub fn scan_resolved(&self) -> Vec<(Key, Value)> {
        self.rows
            .read()
            .iter()
            .filter_map(|(key, chain)| chain.resolved().map(|v| (key.clone(), v.clone())))
            .collect()
    }

    /// Returns the store's statistics.
    #[must_use]
    pub const fn stats(&self) -> &TableStats {
        &self.stats
    }

    /// Returns the total size of all versions in bytes.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.rows.read().values().map(VersionChain::total_size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Key {
        Key::from_str(s)
    }

    fn val(s: &str) -> Value {
        Value::from_str(s)
    }

    #[test]
    fn test_append_and_commit() {
        let store = TableStore::new(TableId::new(1));
        let txn = TxnId::new(7);

        store.append_provisional(key("a"), txn, VersionOp::Insert(val("v1")));
        assert!(store.resolved(&key("a")).is_none());
        assert!(!store.is_empty());

        let flipped = store.commit_provisional(&key("a"), txn, CommitSeq::new(3));
        assert_eq!(flipped, 1);
        assert_eq!(store.resolved(&key("a")), Some(val("v1")));
        assert_eq!(store.stats().versions_committed(), 1);
    }

    #[test]
    fn test_abort_prunes_empty_row() {
        let store = TableStore::new(TableId::new(1));
        let txn = TxnId::new(7);

        store.append_provisional(key("a"), txn, VersionOp::Insert(val("v1")));
        assert_eq!(store.row_count(), 1);

        let removed = store.abort_provisional(&key("a"), txn);
        assert_eq!(removed, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_from_rows() {
        let rows = vec![(key("a"), val("1")), (key("b"), val("2"))];
        let store = TableStore::from_rows(TableId::new(2), rows, CommitSeq::new(1));

        assert_eq!(store.row_count(), 2);
        assert_eq!(store.resolved(&key("a")), Some(val("1")));
        assert_eq!(store.stats().baseline_inserts(), 2);
    }

    #[test]
    fn test_next_row_after() {
        let rows = vec![
            (key("a"), val("1")),
            (key("c"), val("3")),
            (key("e"), val("5")),
        ];
        let store = TableStore::from_rows(TableId::new(1), rows, CommitSeq::new(1));

        let first = store.next_row_after(None).unwrap();
        assert_eq!(first.key, key("a"));

        let second = store.next_row_after(Some(&key("a"))).unwrap();
        assert_eq!(second.key, key("c"));

        // Keys between positions are found, exact matches are skipped
        let third = store.next_row_after(Some(&key("d"))).unwrap();
        assert_eq!(third.key, key("e"));

        assert!(store.next_row_after(Some(&key("e"))).is_none());
    }

    #[test]
    fn test_read_row_snapshot() {
        let store = TableStore::new(TableId::new(1));
        store.append_provisional(key("a"), TxnId::new(7), VersionOp::Insert(val("v1")));
        store.commit_provisional(&key("a"), TxnId::new(7), CommitSeq::new(2));
        store.append_provisional(key("a"), TxnId::new(8), VersionOp::Delete);

        let snap = store.read_row(&key("a")).unwrap();
        assert_eq!(snap.resolved, Some(val("v1")));
        assert_eq!(snap.last_seq, Some(CommitSeq::new(2)));
        assert_eq!(snap.provisional.len(), 1);
        assert_eq!(snap.provisional[0].owner, TxnId::new(8));
    }

    #[test]
    fn test_baseline_delete_orders_by_seq() {
        let store = TableStore::new(TableId::new(1));

        // A writer's shortcut insert committed at sequence 25
        store.append_provisional(key("k"), TxnId::new(5), VersionOp::Insert(val("w")));
        store.commit_provisional(&key("k"), TxnId::new(5), CommitSeq::new(25));

        // The replay later carries a committed delete from sequence 30
        store.insert_baseline(key("k"), CommitSeq::new(30), VersionOp::Delete);
        assert!(store.resolved(&key("k")).is_none());

        // An older baseline would not have won
        let store2 = TableStore::new(TableId::new(2));
        store2.append_provisional(key("k"), TxnId::new(5), VersionOp::Insert(val("w")));
        store2.commit_provisional(&key("k"), TxnId::new(5), CommitSeq::new(25));
        store2.insert_baseline(key("k"), CommitSeq::new(20), VersionOp::Delete);
        assert_eq!(store2.resolved(&key("k")), Some(val("w")));
    }

    #[test]
    fn test_scan_resolved_skips_deleted_and_provisional() {
        let store = TableStore::new(TableId::new(1));
        let txn = TxnId::new(7);

        store.append_provisional(key("a"), txn, VersionOp::Insert(val("1")));
        store.append_provisional(key("b"), txn, VersionOp::Insert(val("2")));
        store.commit_provisional(&key("a"), txn, CommitSeq::new(1));
        store.commit_provisional(&key("b"), txn, CommitSeq::new(1));

        // Delete "b", leave "c" provisional
        store.append_provisional(key("b"), txn, VersionOp::Delete);
        store.commit_provisional(&key("b"), txn, CommitSeq::new(2));
        store.append_provisional(key("c"), TxnId::new(8), VersionOp::Insert(val("3")));

        let resolved = store.scan_resolved();
        assert_eq!(resolved, vec![(key("a"), val("1"))]);
    }
}
