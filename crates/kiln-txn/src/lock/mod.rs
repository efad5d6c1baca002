//! Row and table locks for write isolation.
//!
//! Table locks serialize bulk builds: the destination tables of a
//! build are held exclusively by the transaction that created it,
//! from creation until the transaction retires, so writers and other
//! builds are turned away. Row locks serialize ordinary writers on a
//! key. The build loop's replay takes no row locks at all; it relies
//! on capture and pinning instead.
//!
//! Lock acquisition never waits: a request that cannot be granted
//! fails immediately and the caller surfaces the conflict. With no
//! waiting there are no lock-wait cycles to detect.
//!
//! # Lock Compatibility
//!
//! ```text
//!          │ S  │ X  │
//! ─────────┼────┼────┤
//!     S    │ ✓  │ ✗  │
//!     X    │ ✗  │ ✗  │
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::RwLock;

use kiln_common::types::{Key, TableId, TxnId};

/// Lock mode for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared lock (readers).
    Shared,
    /// Exclusive lock (writers and build destinations).
    Exclusive,
}

impl LockMode {
    /// Checks if this lock mode is compatible with another.
    #[must_use]
    pub const fn is_compatible_with(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}

/// The kind of resource being locked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    /// A whole table. Held exclusively by build creators.
    Table(TableId),
    /// One row of a table. Held by ordinary writers.
    Row(TableId, Key),
}

impl ResourceId {
    /// Creates a table resource ID.
    #[must_use]
    pub const fn table(table_id: TableId) -> Self {
        ResourceId::Table(table_id)
    }

    /// Creates a row resource ID.
    #[must_use]
    pub const fn row(table_id: TableId, key: Key) -> Self {
        ResourceId::Row(table_id, key)
    }

    /// Returns the table this resource belongs to.
    #[must_use]
    pub const fn table_id(&self) -> TableId {
        match self {
            ResourceId::Table(id) | ResourceId::Row(id, _) => *id,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Table(id) => write!(f, "Table({id})"),
            ResourceId::Row(id, key) => write!(f, "Row({id}, {key:?})"),
        }
    }
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// Lock was granted.
    Granted,
    /// Transaction already holds the lock in this mode or stronger.
    AlreadyHeld,
    /// Lock was upgraded from shared to exclusive.
    Upgraded,
    /// Another transaction holds the resource in an incompatible mode.
    Conflict,
}

impl LockResult {
    /// Returns true if the lock is held after the attempt.
    #[must_use]
    pub const fn is_success(self) -> bool {
        !matches!(self, LockResult::Conflict)
    }
}

/// The holders of one resource's lock.
#[derive(Debug)]
struct LockInfo {
    /// Current lock mode. Meaningless while `holders` is empty.
    mode: LockMode,
    /// Transactions holding the lock.
    holders: HashSet<TxnId>,
}

impl LockInfo {
    fn new() -> Self {
        Self {
            mode: LockMode::Shared,
            holders: HashSet::new(),
        }
    }

    fn release(&mut self, txn_id: TxnId) -> bool {
        self.holders.remove(&txn_id)
    }

    fn is_free(&self) -> bool {
        self.holders.is_empty()
    }
}

/// Statistics about the lock manager.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Total lock acquisitions.
    pub acquisitions: AtomicU64,
    /// Total lock releases.
    pub releases: AtomicU64,
    /// Total conflicts.
    pub conflicts: AtomicU64,
    /// Total shared-to-exclusive upgrades.
    pub upgrades: AtomicU64,
}

impl LockStats {
    /// Creates new stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record_acquisition(&self) {
        self.acquisitions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_release(&self) {
        self.releases.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_conflict(&self) {
        self.conflicts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_upgrade(&self) {
        self.upgrades.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

/// Fail-fast lock manager for tables and rows.
pub struct LockManager {
    /// All locks, keyed by resource.
    locks: RwLock<HashMap<ResourceId, LockInfo>>,
    /// Resources locked by each transaction.
    txn_locks: RwLock<HashMap<TxnId, HashSet<ResourceId>>>,
    /// Statistics.
    stats: LockStats,
}

impl LockManager {
    /// Creates a new lock manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            txn_locks: RwLock::new(HashMap::new()),
            stats: LockStats::new(),
        }
    }

    /// Tries to acquire a lock, failing immediately on conflict.
    ///
    /// Re-acquisition by the holding transaction is idempotent; a
    /// sole shared holder requesting exclusive is upgraded.
    pub fn try_lock(&self, txn_id: TxnId, resource: ResourceId, mode: LockMode) -> LockResult {
        let mut locks = self.locks.write();
        let info = locks
            .entry(resource.clone())
            .or_insert_with(LockInfo::new);

        if info.holders.contains(&txn_id) {
            // An exclusive holder already covers any request.
            if info.mode == LockMode::Exclusive || info.mode == mode {
                return LockResult::AlreadyHeld;
            }
            // Held shared, exclusive requested.
            if info.holders.len() == 1 {
                info.mode = LockMode::Exclusive;
                self.stats.record_upgrade();
                return LockResult::Upgraded;
            }
            self.stats.record_conflict();
            return LockResult::Conflict;
        }

        if info.holders.is_empty() || mode.is_compatible_with(info.mode) {
            if info.holders.is_empty() {
                info.mode = mode;
            }
            info.holders.insert(txn_id);
            self.txn_locks
                .write()
                .entry(txn_id)
                .or_default()
                .insert(resource);
            self.stats.record_acquisition();
            return LockResult::Granted;
        }

        self.stats.record_conflict();
        LockResult::Conflict
    }

    /// Releases one lock.
    pub fn unlock(&self, txn_id: TxnId, resource: &ResourceId) -> bool {
        let mut locks = self.locks.write();
        let Some(info) = locks.get_mut(resource) else {
            return false;
        };
        if !info.release(txn_id) {
            return false;
        }
        if info.is_free() {
            locks.remove(resource);
        }
        if let Some(held) = self.txn_locks.write().get_mut(&txn_id) {
            held.remove(resource);
        }
        self.stats.record_release();
        true
    }

    /// Releases every lock held by a transaction. Returns the count.
    pub fn release_all(&self, txn_id: TxnId) -> usize {
        let resources: Vec<ResourceId> = self
            .txn_locks
            .read()
            .get(&txn_id)
            .map(|held| held.iter().cloned().collect())
            .unwrap_or_default();

        let count = resources.len();
        for resource in &resources {
            self.unlock(txn_id, resource);
        }
        self.txn_locks.write().remove(&txn_id);
        count
    }

    /// Returns the transactions currently holding a resource's lock.
    #[must_use]
    pub fn holders_of(&self, resource: &ResourceId) -> Vec<TxnId> {
        self.locks
            .read()
            .get(resource)
            .map(|info| info.holders.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns the resources locked by a transaction.
    #[must_use]
    pub fn locks_of(&self, txn_id: TxnId) -> Vec<ResourceId> {
        self.txn_locks
            .read()
            .get(&txn_id)
            .map(|held| held.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of locked resources.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.locks.read().len()
    }

    /// Returns the number of transactions holding locks.
    #[must_use]
    pub fn txn_count(&self) -> usize {
        self.txn_locks.read().len()
    }

    /// Returns statistics about the lock manager.
    #[must_use]
    pub const fn stats(&self) -> &LockStats {
        &self.stats
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("lock_count", &self.lock_count())
            .field("txn_count", &self.txn_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(table: u64, key: &str) -> ResourceId {
        ResourceId::row(TableId::new(table), Key::from_str(key))
    }

    fn table(table: u64) -> ResourceId {
        ResourceId::table(TableId::new(table))
    }

    #[test]
    fn test_lock_mode_compatibility() {
        use LockMode::{Exclusive, Shared};

        assert!(Shared.is_compatible_with(Shared));
        assert!(!Shared.is_compatible_with(Exclusive));
        assert!(!Exclusive.is_compatible_with(Shared));
        assert!(!Exclusive.is_compatible_with(Exclusive));
    }

    #[test]
    fn test_resource_id() {
        assert_eq!(table(42).table_id(), TableId::new(42));
        assert_eq!(row(42, "k").table_id(), TableId::new(42));
        assert_ne!(table(42), row(42, "k"));
    }

    #[test]
    fn test_grant_and_already_held() {
        let lm = LockManager::new();
        let txn = TxnId::new(1);
        let r = row(1, "k");

        assert_eq!(lm.try_lock(txn, r.clone(), LockMode::Shared), LockResult::Granted);
        assert_eq!(
            lm.try_lock(txn, r.clone(), LockMode::Shared),
            LockResult::AlreadyHeld
        );
        assert!(lm.unlock(txn, &r));
        assert_eq!(lm.lock_count(), 0);
    }

    #[test]
    fn test_shared_locks_coexist() {
        let lm = LockManager::new();
        let r = table(1);

        assert_eq!(
            lm.try_lock(TxnId::new(1), r.clone(), LockMode::Shared),
            LockResult::Granted
        );
        assert_eq!(
            lm.try_lock(TxnId::new(2), r.clone(), LockMode::Shared),
            LockResult::Granted
        );
        assert_eq!(lm.holders_of(&r).len(), 2);
    }

    #[test]
    fn test_exclusive_conflicts() {
        let lm = LockManager::new();
        let r = table(1);

        assert_eq!(
            lm.try_lock(TxnId::new(1), r.clone(), LockMode::Exclusive),
            LockResult::Granted
        );

        // No waiting: both directions fail immediately.
        assert_eq!(
            lm.try_lock(TxnId::new(2), r.clone(), LockMode::Shared),
            LockResult::Conflict
        );
        assert_eq!(
            lm.try_lock(TxnId::new(2), r, LockMode::Exclusive),
            LockResult::Conflict
        );
        assert_eq!(lm.stats().conflicts.load(AtomicOrdering::Relaxed), 2);
    }

    #[test]
    fn test_row_locks_are_per_key() {
        let lm = LockManager::new();

        assert_eq!(
            lm.try_lock(TxnId::new(1), row(1, "a"), LockMode::Exclusive),
            LockResult::Granted
        );
        // A different row of the same table does not conflict.
        assert_eq!(
            lm.try_lock(TxnId::new(2), row(1, "b"), LockMode::Exclusive),
            LockResult::Granted
        );
        // The same row does.
        assert_eq!(
            lm.try_lock(TxnId::new(2), row(1, "a"), LockMode::Exclusive),
            LockResult::Conflict
        );
    }

    #[test]
    fn test_upgrade_sole_holder() {
        let lm = LockManager::new();
        let txn = TxnId::new(1);
        let r = row(1, "k");

        assert_eq!(lm.try_lock(txn, r.clone(), LockMode::Shared), LockResult::Granted);
        assert_eq!(
            lm.try_lock(txn, r.clone(), LockMode::Exclusive),
            LockResult::Upgraded
        );

        // Exclusive now covers a shared re-request.
        assert_eq!(lm.try_lock(txn, r, LockMode::Shared), LockResult::AlreadyHeld);
    }

    #[test]
    fn test_upgrade_blocked_by_co_holder() {
        let lm = LockManager::new();
        let r = row(1, "k");

        lm.try_lock(TxnId::new(1), r.clone(), LockMode::Shared);
        lm.try_lock(TxnId::new(2), r.clone(), LockMode::Shared);

        assert_eq!(
            lm.try_lock(TxnId::new(1), r, LockMode::Exclusive),
            LockResult::Conflict
        );
    }

    #[test]
    fn test_release_frees_resource() {
        let lm = LockManager::new();
        let r = table(1);

        lm.try_lock(TxnId::new(1), r.clone(), LockMode::Exclusive);
        lm.unlock(TxnId::new(1), &r);

        assert_eq!(
            lm.try_lock(TxnId::new(2), r, LockMode::Exclusive),
            LockResult::Granted
        );
    }

    #[test]
    fn test_release_all() {
        let lm = LockManager::new();
        let txn = TxnId::new(1);

        lm.try_lock(txn, table(1), LockMode::Exclusive);
        lm.try_lock(txn, row(2, "a"), LockMode::Shared);
        lm.try_lock(txn, row(2, "b"), LockMode::Exclusive);
        assert_eq!(lm.locks_of(txn).len(), 3);

        assert_eq!(lm.release_all(txn), 3);
        assert_eq!(lm.locks_of(txn).len(), 0);
        assert_eq!(lm.lock_count(), 0);
        assert_eq!(lm.txn_count(), 0);
    }

    #[test]
    fn test_lock_mode_display() {
        assert_eq!(format!("{}", LockMode::Shared), "S");
        assert_eq!(format!("{}", LockMode::Exclusive), "X");
        assert_eq!(format!("{}", table(3)), "Table(3)");
    }
}
