//! Transaction lifecycle: begin, prepare, commit, abort.
//!
//! Every transaction moves through three states:
//!
//! ```text
//!              prepare / commit / abort
//!   ┌──────┐            ┌───────────┐            ┌─────────┐
//!   │ Live │ ─────────► │ Preparing │ ─────────► │ Retired │
//!   └──────┘            └───────────┘            └─────────┘
//!    accepts writes      pins drain,              outcome
//!    and adoptions       adoptions only           recorded
//! ```
//!
//! Commit assigns the transaction a commit sequence number and flips
//! its provisional versions to committed, in the order the writes
//! were recorded. Abort discards them in reverse. Both happen under
//! the manager's internal lock, so commits are totally ordered and a
//! version chain's committed prefix is always sequence-ordered.
//!
//! Completed or unknown transaction ids read as `Retired`.
//!
//! # Capture and pinning
//!
//! A build loop that replays provisional writes needs the owning
//! transactions to hold still while it copies their state. It takes
//! a [`StateFreeze`] (the manager's internal lock), rereads the row,
//! and converts the freeze into a [`PinSet`] on the owners it saw.
//! Pinned owners keep working and may begin committing, but their
//! version flips wait until every pin is dropped. The replayer
//! adopts the versions it writes into the owners via
//! [`TransactionManager::adopt_write`], so a commit that was waiting
//! picks them up.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use kiln_common::error::{KilnError, KilnResult};
use kiln_common::types::{CommitSeq, Key, TxnId, VersionId};
use kiln_store::directory::TableDirectory;
use kiln_store::table::TableStore;

use crate::lock::LockManager;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Accepting writes.
    Live,
    /// Commit or abort has begun; accepts adoptions only.
    Preparing,
    /// Committed or aborted.
    Retired,
}

impl TxnState {
    /// Returns true if the transaction accepts writes.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, TxnState::Live)
    }

    /// Returns true if the transaction is preparing to retire.
    #[must_use]
    pub const fn is_preparing(self) -> bool {
        matches!(self, TxnState::Preparing)
    }

    /// Returns true if the transaction has finished.
    #[must_use]
    pub const fn is_retired(self) -> bool {
        matches!(self, TxnState::Retired)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnState::Live => write!(f, "Live"),
            TxnState::Preparing => write!(f, "Preparing"),
            TxnState::Retired => write!(f, "Retired"),
        }
    }
}

/// How a retired transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    /// Committed at this sequence number.
    Committed(CommitSeq),
    /// Aborted; its writes were discarded.
    Aborted,
}

impl TxnOutcome {
    /// Returns true if the transaction committed.
    #[must_use]
    pub const fn is_committed(self) -> bool {
        matches!(self, TxnOutcome::Committed(_))
    }

    /// Returns the commit sequence, if committed.
    #[must_use]
    pub const fn commit_seq(self) -> Option<CommitSeq> {
        match self {
            TxnOutcome::Committed(seq) => Some(seq),
            TxnOutcome::Aborted => None,
        }
    }
}

impl fmt::Display for TxnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnOutcome::Committed(seq) => write!(f, "Committed({seq})"),
            TxnOutcome::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// The sequence number assigned to the commit.
    pub seq: CommitSeq,
    /// Provisional versions flipped to committed.
    pub versions_flipped: usize,
    /// Run files made obsolete by finalized redirects.
    pub obsolete_files: Vec<PathBuf>,
}

/// Result of a successful abort.
#[derive(Debug, Clone)]
pub struct AbortOutcome {
    /// Provisional versions removed.
    pub versions_removed: usize,
    /// Run files made obsolete by rolled-back redirects.
    pub obsolete_files: Vec<PathBuf>,
}

/// One recorded write: which version to flip on commit or remove on
/// abort, and where it lives.
struct WriteRecord {
    store: Arc<TableStore>,
    key: Key,
    version_id: VersionId,
}

/// Per-transaction bookkeeping.
struct TxnRecord {
    state: TxnState,
    outcome: Option<TxnOutcome>,
    /// Write set, in the order writes were recorded.
    writes: Vec<WriteRecord>,
    /// Outstanding pins. Version flips wait for zero.
    pins: u32,
    /// Set by the thread that wins the race to commit or abort.
    resolving: bool,
}

impl TxnRecord {
    fn new() -> Self {
        Self {
            state: TxnState::Live,
            outcome: None,
            writes: Vec::new(),
            pins: 0,
            resolving: false,
        }
    }
}

/// State behind the manager's internal lock.
struct ManagerInner {
    txns: HashMap<TxnId, TxnRecord>,
    /// Next commit sequence number to assign.
    next_seq: u64,
}

/// Statistics about the transaction manager.
#[derive(Debug, Default)]
pub struct TxnStats {
    /// Transactions begun.
    pub begun: AtomicU64,
    /// Transactions committed.
    pub committed: AtomicU64,
    /// Transactions aborted.
    pub aborted: AtomicU64,
    /// Transactions currently live or preparing.
    pub active: AtomicU64,
    /// Pins currently outstanding across all transactions.
    pub pinned: AtomicU64,
    /// Writes recorded by owning transactions.
    pub writes_recorded: AtomicU64,
    /// Writes adopted into transactions by replayers.
    pub writes_adopted: AtomicU64,
    /// Times a commit or abort waited for pins to drain.
    pub pin_waits: AtomicU64,
}

impl TxnStats {
    /// Creates new stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Manages transaction lifecycles and the global commit order.
pub struct TransactionManager {
    /// Table directory; redirects are finalized or rolled back here.
    directory: Arc<TableDirectory>,
    /// Lock manager; all of a transaction's locks release at retire.
    lock_manager: Arc<LockManager>,
    /// Internal lock over transaction records and the sequence counter.
    inner: Mutex<ManagerInner>,
    /// Signalled when pins drop.
    retire_cv: Condvar,
    /// Next transaction id to hand out.
    next_txn_id: AtomicU64,
    /// Statistics.
    stats: TxnStats,
}

impl TransactionManager {
    /// Creates a manager over a table directory.
    #[must_use]
    pub fn new(directory: Arc<TableDirectory>) -> Self {
        Self {
            directory,
            lock_manager: Arc::new(LockManager::new()),
            inner: Mutex::new(ManagerInner {
                txns: HashMap::new(),
                next_seq: CommitSeq::FIRST.as_u64(),
            }),
            retire_cv: Condvar::new(),
            next_txn_id: AtomicU64::new(TxnId::MIN.as_u64()),
            stats: TxnStats::new(),
        }
    }

    /// Begins a new transaction.
    pub fn begin(&self) -> TxnId {
        let txn_id = TxnId::new(self.next_txn_id.fetch_add(1, AtomicOrdering::SeqCst));
        self.inner.lock().txns.insert(txn_id, TxnRecord::new());
        self.stats.begun.fetch_add(1, AtomicOrdering::Relaxed);
        self.stats.active.fetch_add(1, AtomicOrdering::Relaxed);
        txn_id
    }

    /// Returns the state of a transaction.
    ///
    /// Completed or unknown ids read as [`TxnState::Retired`].
    #[must_use]
    pub fn state_of(&self, txn_id: TxnId) -> TxnState {
        self.inner
            .lock()
            .txns
            .get(&txn_id)
            .map_or(TxnState::Retired, |r| r.state)
    }

    /// Returns how a transaction ended, if it retired and its record
    /// has not been pruned.
    #[must_use]
    pub fn outcome_of(&self, txn_id: TxnId) -> Option<TxnOutcome> {
        self.inner.lock().txns.get(&txn_id).and_then(|r| r.outcome)
    }

    /// Moves a live transaction to `Preparing`. Idempotent.
    pub fn prepare(&self, txn_id: TxnId) -> KilnResult<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .txns
            .get_mut(&txn_id)
            .ok_or(KilnError::TxnNotFound { txn_id })?;
        match record.state {
            TxnState::Live => {
                record.state = TxnState::Preparing;
                Ok(())
            }
            TxnState::Preparing => Ok(()),
            TxnState::Retired => Err(KilnError::TxnRetired { txn_id }),
        }
    }

    /// Records a provisional write into a live transaction's write set.
    pub fn record_write(
        &self,
        txn_id: TxnId,
        store: &Arc<TableStore>,
        key: Key,
        version_id: VersionId,
    ) -> KilnResult<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .txns
            .get_mut(&txn_id)
            .ok_or(KilnError::TxnNotFound { txn_id })?;
        if !record.state.is_live() {
            return Err(KilnError::TxnRetired { txn_id });
        }
        record.writes.push(WriteRecord {
            store: Arc::clone(store),
            key,
            version_id,
        });
        self.stats
            .writes_recorded
            .fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Adopts a replayed write into a live or preparing transaction.
    ///
    /// Replayers call this while holding a pin on the owner, which is
    /// what keeps a preparing owner from flipping versions under them.
    pub fn adopt_write(
        &self,
        txn_id: TxnId,
        store: &Arc<TableStore>,
        key: Key,
        version_id: VersionId,
    ) -> KilnResult<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .txns
            .get_mut(&txn_id)
            .ok_or(KilnError::TxnNotFound { txn_id })?;
        if record.state.is_retired() {
            return Err(KilnError::TxnRetired { txn_id });
        }
        record.writes.push(WriteRecord {
            store: Arc::clone(store),
            key,
            version_id,
        });
        self.stats
            .writes_adopted
            .fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Commits a transaction.
    ///
    /// Waits for pins to drain, then assigns the next commit sequence
    /// and flips the write set to committed in recorded order, all
    /// under the internal lock. Redirects finalize and locks release
    /// after the flip.
    pub fn commit(&self, txn_id: TxnId) -> KilnResult<CommitOutcome> {
        let mut inner = self.claim_resolution(txn_id)?;
        self.wait_for_pins(txn_id, &mut inner);

        let seq = CommitSeq::new(inner.next_seq);
        inner.next_seq += 1;

        let writes = match inner.txns.get_mut(&txn_id) {
            Some(record) => mem::take(&mut record.writes),
            None => Vec::new(),
        };
        let mut versions_flipped = 0;
        for write in &writes {
            versions_flipped += write.store.commit_provisional(&write.key, txn_id, seq);
        }

        if let Some(record) = inner.txns.get_mut(&txn_id) {
            record.state = TxnState::Retired;
            record.outcome = Some(TxnOutcome::Committed(seq));
        }
        drop(inner);

        self.stats.committed.fetch_add(1, AtomicOrdering::Relaxed);
        self.stats.active.fetch_sub(1, AtomicOrdering::Relaxed);

        let obsolete_files = self.directory.finalize(txn_id);
        self.lock_manager.release_all(txn_id);

        Ok(CommitOutcome {
            seq,
            versions_flipped,
            obsolete_files,
        })
    }

    /// Aborts a transaction.
    ///
    /// Waits for pins to drain, then discards the write set in reverse
    /// order. Redirects roll back before locks release, so no reader
    /// can observe a binding the abort is about to undo.
    pub fn abort(&self, txn_id: TxnId) -> KilnResult<AbortOutcome> {
        let mut inner = self.claim_resolution(txn_id)?;
        self.wait_for_pins(txn_id, &mut inner);

        let writes = match inner.txns.get_mut(&txn_id) {
            Some(record) => mem::take(&mut record.writes),
            None => Vec::new(),
        };
        let mut versions_removed = 0;
        for write in writes.iter().rev() {
            versions_removed += write.store.abort_provisional(&write.key, txn_id);
        }

        if let Some(record) = inner.txns.get_mut(&txn_id) {
            record.state = TxnState::Retired;
            record.outcome = Some(TxnOutcome::Aborted);
        }
        drop(inner);

        self.stats.aborted.fetch_add(1, AtomicOrdering::Relaxed);
        self.stats.active.fetch_sub(1, AtomicOrdering::Relaxed);

        let obsolete_files = self.directory.rollback(txn_id);
        self.lock_manager.release_all(txn_id);

        Ok(AbortOutcome {
            versions_removed,
            obsolete_files,
        })
    }

    /// Moves the transaction to `Preparing` and claims the right to
    /// resolve it, failing if another thread already has.
    fn claim_resolution(&self, txn_id: TxnId) -> KilnResult<MutexGuard<'_, ManagerInner>> {
        let mut inner = self.inner.lock();
        let record = inner
            .txns
            .get_mut(&txn_id)
            .ok_or(KilnError::TxnNotFound { txn_id })?;
        match record.state {
            TxnState::Live | TxnState::Preparing if !record.resolving => {
                record.state = TxnState::Preparing;
                record.resolving = true;
                Ok(inner)
            }
            _ => Err(KilnError::TxnRetired { txn_id }),
        }
    }

    /// Blocks until the transaction's pins drain. The internal lock is
    /// released while waiting, so replayers can adopt writes into the
    /// preparing transaction.
    fn wait_for_pins(&self, txn_id: TxnId, inner: &mut MutexGuard<'_, ManagerInner>) {
        while inner.txns.get(&txn_id).map_or(0, |r| r.pins) > 0 {
            self.stats.pin_waits.fetch_add(1, AtomicOrdering::Relaxed);
            self.retire_cv.wait(inner);
        }
    }

    /// Takes the manager's internal lock for a consistent read of
    /// transaction states, convertible into pins.
    #[must_use]
    pub fn freeze(&self) -> StateFreeze<'_> {
        StateFreeze {
            mgr: self,
            guard: self.inner.lock(),
        }
    }

    /// Returns the outstanding pins on a transaction.
    #[must_use]
    pub fn pin_count(&self, txn_id: TxnId) -> u32 {
        self.inner.lock().txns.get(&txn_id).map_or(0, |r| r.pins)
    }

    /// Returns the size of a transaction's write set.
    #[must_use]
    pub fn write_count(&self, txn_id: TxnId) -> usize {
        self.inner
            .lock()
            .txns
            .get(&txn_id)
            .map_or(0, |r| r.writes.len())
    }

    /// Returns the ids of all live and preparing transactions, sorted.
    #[must_use]
    pub fn live_txns(&self) -> Vec<TxnId> {
        let inner = self.inner.lock();
        let mut ids: Vec<TxnId> = inner
            .txns
            .iter()
            .filter(|(_, r)| !r.state.is_retired())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Drops the records of retired transactions. Returns the count.
    pub fn prune_retired(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.txns.len();
        inner.txns.retain(|_, r| !r.state.is_retired());
        before - inner.txns.len()
    }

    /// Returns the most recently assigned commit sequence, or
    /// [`CommitSeq::INVALID`] if nothing has committed.
    #[must_use]
    pub fn last_committed_seq(&self) -> CommitSeq {
        CommitSeq::new(self.inner.lock().next_seq.saturating_sub(1))
    }

    /// Returns the number of live and preparing transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .txns
            .values()
            .filter(|r| !r.state.is_retired())
            .count()
    }

    /// Returns the lock manager.
    #[must_use]
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Returns the table directory.
    #[must_use]
    pub fn directory(&self) -> &Arc<TableDirectory> {
        &self.directory
    }

    /// Returns statistics about the manager.
    #[must_use]
    pub const fn stats(&self) -> &TxnStats {
        &self.stats
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active", &self.active_count())
            .field("last_committed_seq", &self.last_committed_seq())
            .finish()
    }
}

/// A hold on the manager's internal lock.
///
/// While a freeze exists, no transaction can change state, commit, or
/// abort, so the states it reports stay true. Convert it into a
/// [`PinSet`] with [`StateFreeze::pin_owners`] before releasing it;
/// the pins keep the observed provisional versions from flipping or
/// vanishing after the freeze is gone.
pub struct StateFreeze<'a> {
    mgr: &'a TransactionManager,
    guard: MutexGuard<'a, ManagerInner>,
}

impl<'a> StateFreeze<'a> {
    /// Returns the state of a transaction under the freeze.
    ///
    /// Completed or unknown ids read as [`TxnState::Retired`].
    #[must_use]
    pub fn state_of(&self, txn_id: TxnId) -> TxnState {
        self.guard
            .txns
            .get(&txn_id)
            .map_or(TxnState::Retired, |r| r.state)
    }

    /// Pins the given owners and releases the freeze.
    ///
    /// Fails with `TxnRetired` if any owner has already retired; the
    /// caller should reread and try again.
    pub fn pin_owners(mut self, owners: &[TxnId]) -> KilnResult<PinSet<'a>> {
        for &owner in owners {
            match self.guard.txns.get(&owner) {
                Some(record) if !record.state.is_retired() => {}
                _ => return Err(KilnError::TxnRetired { txn_id: owner }),
            }
        }
        for &owner in owners {
            if let Some(record) = self.guard.txns.get_mut(&owner) {
                record.pins += 1;
            }
        }
        self.mgr
            .stats
            .pinned
            .fetch_add(owners.len() as u64, AtomicOrdering::Relaxed);
        Ok(PinSet {
            mgr: self.mgr,
            owners: owners.to_vec(),
        })
    }
}

impl fmt::Debug for StateFreeze<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateFreeze")
            .field("txns", &self.guard.txns.len())
            .finish()
    }
}

/// Pins on a set of transactions.
///
/// Pinned transactions keep accepting writes and may enter
/// `Preparing`, but their version flips wait until the pins drop.
/// Dropping the set releases the pins and wakes waiting committers.
pub struct PinSet<'a> {
    mgr: &'a TransactionManager,
    owners: Vec<TxnId>,
}

impl PinSet<'_> {
    /// Returns the pinned transaction ids.
    #[must_use]
    pub fn owners(&self) -> &[TxnId] {
        &self.owners
    }

    /// Returns the number of pinned transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Returns true if no transactions are pinned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

impl Drop for PinSet<'_> {
    fn drop(&mut self) {
        let mut inner = self.mgr.inner.lock();
        for owner in &self.owners {
            if let Some(record) = inner.txns.get_mut(owner) {
                record.pins = record.pins.saturating_sub(1);
            }
        }
        self.mgr
            .stats
            .pinned
            .fetch_sub(self.owners.len() as u64, AtomicOrdering::Relaxed);
        self.mgr.retire_cv.notify_all();
    }
}

impl fmt::Debug for PinSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinSet").field("owners", &self.owners).finish()
    }
}
