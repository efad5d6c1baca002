//! The engine facade.
//!
//! An [`Engine`] owns every shared service the build paths need: the
//! table directory, the transaction manager, the recovery log, the
//! checkpoint manager, the file namer, and the registry of builds in
//! progress. Bulk loaders and hot index builders borrow the engine and
//! reach these services through it.
//!
//! Raw writes and build scan iterations hold the coordination lock in
//! read mode; a checkpoint holds it in write mode, so the flush sees
//! no multi-table operation straddling the checkpoint line.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{MutexGuard, RwLock};

use kiln_common::config::EngineConfig;
use kiln_common::error::{KilnError, KilnResult};
use kiln_common::types::{Key, TableId, TxnId, Value};
use kiln_store::directory::{TableBinding, TableDirectory};
use kiln_store::namer::FileNamer;
use kiln_store::runfile::{self, RunWriter};
use kiln_store::table::TableStore;
use kiln_store::version::VersionOp;
use kiln_txn::lock::{LockManager, LockMode, ResourceId};
use kiln_txn::manager::{AbortOutcome, CommitOutcome, TransactionManager};
use kiln_wal::checkpoint::{CheckpointInfo, CheckpointManager};
use kiln_wal::config::{SyncPolicy, WalConfig};
use kiln_wal::error::WalError;
use kiln_wal::log::RecoveryLog;

use crate::generator::{IdentityGenerator, RowGenerator};
use crate::indexer::{IndexerShared, ScanState};
use crate::metrics::BuildMetrics;

/// The KilnDB storage engine.
///
/// Thread safe; all methods take `&self`.
pub struct Engine {
    /// Engine configuration, fixed at open.
    config: EngineConfig,
    /// Maps tables to their backing run files and in-memory stores.
    directory: Arc<TableDirectory>,
    /// Transaction lifecycle, write sets, and pins.
    txn_manager: Arc<TransactionManager>,
    /// Recovery log for commit, abort, build, and checkpoint records.
    log: RecoveryLog,
    /// Checkpoint state machine.
    checkpointer: CheckpointManager,
    /// Raw writes and build iterations hold this shared; a checkpoint
    /// holds it exclusively.
    coordination: RwLock<()>,
    /// Hot index builds in progress, keyed by destination table.
    indexers: DashMap<TableId, Arc<IndexerShared>>,
    /// Allocates file IDs and names run files.
    namer: FileNamer,
    /// Derives destination rows from source rows.
    generator: Box<dyn RowGenerator>,
    /// Build counters and gauges.
    metrics: BuildMetrics,
    /// Next table ID to hand out.
    next_table_id: AtomicU64,
    /// Table names, for create-time duplicate checks and lookup.
    table_names: RwLock<HashMap<String, TableId>>,
}

impl Engine {
    /// Opens an engine with the identity row generator.
    pub fn open(config: EngineConfig) -> KilnResult<Self> {
        Self::open_with_generator(config, Box::new(IdentityGenerator))
    }

    /// Opens an engine with a caller-supplied row generator.
    ///
    /// Validates the configuration, creates the data directory, sweeps
    /// temp files left by interrupted builds, and opens the recovery
    /// log. Hot index builds that never logged an end record are
    /// reported; their destinations must be rebuilt.
    pub fn open_with_generator(
        config: EngineConfig,
        generator: Box<dyn RowGenerator>,
    ) -> KilnResult<Self> {
        config.validate().map_err(KilnError::invalid_argument)?;
        fs::create_dir_all(&config.data_dir)?;

        let orphans = runfile::sweep_orphans(&config.data_dir)?;
        if !orphans.is_empty() {
            tracing::info!(
                "Swept {} orphaned temp files from {}",
                orphans.len(),
                config.data_dir.display()
            );
        }

        let sync_policy = if config.sync_writes {
            SyncPolicy::EveryWrite
        } else {
            SyncPolicy::OnClose
        };
        let log = RecoveryLog::open(WalConfig::new(&config.data_dir).with_sync_policy(sync_policy))?;
        for (txn, file_ids) in log.open_hot_indexes() {
            tracing::warn!(
                "Hot index build by txn {} over {} files never finished; its destinations must be rebuilt",
                txn,
                file_ids.len()
            );
        }

        let directory = Arc::new(TableDirectory::new());
        let txn_manager = Arc::new(TransactionManager::new(Arc::clone(&directory)));

        tracing::info!("Engine opened at {}", config.data_dir.display());
        Ok(Self {
            config,
            directory,
            txn_manager,
            log,
            checkpointer: CheckpointManager::new(),
            coordination: RwLock::new(()),
            indexers: DashMap::new(),
            namer: FileNamer::new(),
            generator,
            metrics: BuildMetrics::new(),
            next_table_id: AtomicU64::new(TableId::FIRST.as_u64()),
            table_names: RwLock::new(HashMap::new()),
        })
    }

    // ------------------------------------------------------------------
    // Tables
    // ------------------------------------------------------------------

    /// Creates an empty table and returns its ID.
    ///
    /// Writes an empty run file and binds the table to it, so the
    /// table is durable before this returns.
    pub fn create_table(&self, name: &str) -> KilnResult<TableId> {
        if name.is_empty() {
            return Err(KilnError::invalid_argument("table name must not be empty"));
        }
        let mut names = self.table_names.write();
        if names.contains_key(name) {
            return Err(KilnError::invalid_argument(format!(
                "table {name:?} already exists"
            )));
        }

        let table_id = TableId::new(self.next_table_id.fetch_add(1, Ordering::SeqCst));
        let file_id = self.namer.next_file_id();
        let path = self
            .config
            .data_dir
            .join(self.namer.table_file_name(table_id, file_id));
        runfile::write_empty_run(&path, table_id, self.config.sync_writes)?;

        self.directory.register_file(file_id, path);
        self.directory.bind(
            table_id,
            TableBinding {
                file_id,
                store: Arc::new(TableStore::new(table_id)),
            },
        );
        names.insert(name.to_string(), table_id);

        tracing::info!("Created table {} ({})", name, table_id);
        Ok(table_id)
    }

    /// Looks up a table by name.
    #[must_use]
    pub fn table_id_of(&self, name: &str) -> Option<TableId> {
        self.table_names.read().get(name).copied()
    }

    /// Returns true if the table has no row chains at all.
    pub fn table_is_empty(&self, table_id: TableId) -> KilnResult<bool> {
        Ok(self.store_of(table_id)?.is_empty())
    }

    /// Reads the committed value of a key.
    pub fn get(&self, table_id: TableId, key: &Key) -> KilnResult<Option<Value>> {
        Ok(self.store_of(table_id)?.resolved(key))
    }

    /// Returns every committed row of a table in key order.
    pub fn scan_committed(&self, table_id: TableId) -> KilnResult<Vec<(Key, Value)>> {
        Ok(self.store_of(table_id)?.scan_resolved())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Begins a transaction.
    pub fn begin(&self) -> TxnId {
        let txn = self.txn_manager.begin();
        tracing::debug!("Began txn {}", txn);
        txn
    }

    /// Moves a transaction to the preparing state.
    ///
    /// A preparing transaction accepts no new client writes but still
    /// accepts adoptions from build replays.
    pub fn prepare(&self, txn: TxnId) -> KilnResult<()> {
        self.txn_manager.prepare(txn)
    }

    /// Commits a transaction.
    ///
    /// The commit record reaches the recovery log before any version
    /// flips. Run files replaced by the transaction's redirects are
    /// unlinked after the commit resolves.
    pub fn commit(&self, txn: TxnId) -> KilnResult<CommitOutcome> {
        if self.txn_manager.state_of(txn).is_retired() {
            return Err(KilnError::TxnRetired { txn_id: txn });
        }
        self.log.append_commit(txn)?;
        let outcome = self.txn_manager.commit(txn)?;
        self.remove_obsolete(&outcome.obsolete_files);
        tracing::info!(
            "Committed txn {} at seq {} ({} versions)",
            txn,
            outcome.seq,
            outcome.versions_flipped
        );
        Ok(outcome)
    }

    /// Aborts a transaction, discarding its writes and rolling back
    /// its redirects.
    pub fn abort(&self, txn: TxnId) -> KilnResult<AbortOutcome> {
        if self.txn_manager.state_of(txn).is_retired() {
            return Err(KilnError::TxnRetired { txn_id: txn });
        }
        self.log.append_abort(txn)?;
        let outcome = self.txn_manager.abort(txn)?;
        self.remove_obsolete(&outcome.obsolete_files);
        tracing::info!(
            "Aborted txn {} ({} versions discarded)",
            txn,
            outcome.versions_removed
        );
        Ok(outcome)
    }

    fn remove_obsolete(&self, paths: &[PathBuf]) {
        for path in paths {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("Could not remove obsolete file {}: {}", path.display(), e);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Writes a provisional insert into one table.
    pub fn put(&self, txn: TxnId, table_id: TableId, key: Key, value: Value) -> KilnResult<()> {
        self.check_key(&key)?;
        self.check_value(&value)?;
        let store = self.store_of(table_id)?;
        let _quiesce = self.coordination.read();
        self.write_row(txn, table_id, &store, key, VersionOp::Insert(value))
    }

    /// Writes a provisional delete into one table.
    pub fn delete(&self, txn: TxnId, table_id: TableId, key: Key) -> KilnResult<()> {
        self.check_key(&key)?;
        let store = self.store_of(table_id)?;
        let _quiesce = self.coordination.read();
        self.write_row(txn, table_id, &store, key, VersionOp::Delete)
    }

    /// Writes a source row and fans generated rows out to the
    /// destination tables.
    ///
    /// Destinations with a hot index build in progress receive the
    /// generated row only if the build's scan has already passed the
    /// source key; otherwise the build replays it later.
    pub fn put_multiple(
        &self,
        txn: TxnId,
        src: TableId,
        key: Key,
        value: Value,
        dests: &[TableId],
    ) -> KilnResult<()> {
        self.check_key(&key)?;
        self.check_value(&value)?;
        let _quiesce = self.coordination.read();
        self.fan_out(txn, src, key, value, false, dests)
    }

    /// Deletes a source row and fans generated deletes out to the
    /// destination tables.
    ///
    /// `old_value` is the value being removed; generators that derive
    /// destination keys from values need it to address the right rows.
    pub fn del_multiple(
        &self,
        txn: TxnId,
        src: TableId,
        key: Key,
        old_value: Value,
        dests: &[TableId],
    ) -> KilnResult<()> {
        self.check_key(&key)?;
        let _quiesce = self.coordination.read();
        self.fan_out(txn, src, key, old_value, true, dests)
    }

    fn fan_out(
        &self,
        txn: TxnId,
        src: TableId,
        key: Key,
        value: Value,
        delete: bool,
        dests: &[TableId],
    ) -> KilnResult<()> {
        let src_store = self.store_of(src)?;

        // Plan every destination delivery up front so the scan locks
        // can be taken before the source write.
        let mut plans = Vec::with_capacity(dests.len());
        let mut scan_locks: Vec<Arc<IndexerShared>> = Vec::new();
        for (index, &dest) in dests.iter().enumerate() {
            let store = self.store_of(dest)?;
            let (gen_key, gen_value) = self.generator.generate(dest, index, &key, &value);
            self.check_key(&gen_key)?;
            if !delete {
                self.check_value(&gen_value)?;
            }
            let delivery = match self.indexer_for(dest) {
                None => Delivery::Plain,
                Some(shared) if shared.estimate.definitely_passed(&key) => Delivery::Passed,
                Some(shared) => {
                    let slot = scan_locks.iter().position(|other| Arc::ptr_eq(other, &shared));
                    let slot = match slot {
                        Some(slot) => slot,
                        None => {
                            scan_locks.push(shared);
                            scan_locks.len() - 1
                        }
                    };
                    Delivery::Guarded(slot)
                }
            };
            let op = if delete {
                VersionOp::Delete
            } else {
                VersionOp::Insert(gen_value)
            };
            plans.push(DestWrite {
                table_id: dest,
                store,
                key: gen_key,
                op,
                delivery,
            });
        }

        // Take the scan locks in pointer order so concurrent writers
        // cannot deadlock against each other. Holding them across the
        // source write and the deliveries makes each apply-or-skip
        // decision atomic with the build's scan position.
        let mut order: Vec<usize> = (0..scan_locks.len()).collect();
        order.sort_by_key(|&slot| Arc::as_ptr(&scan_locks[slot]) as usize);
        let mut guards: Vec<(usize, MutexGuard<'_, ScanState>)> = order
            .into_iter()
            .map(|slot| (slot, scan_locks[slot].scan.lock()))
            .collect();
        guards.sort_by_key(|entry| entry.0);

        let src_op = if delete {
            VersionOp::Delete
        } else {
            VersionOp::Insert(value)
        };
        self.write_row(txn, src, &src_store, key.clone(), src_op)?;

        for plan in plans {
            match plan.delivery {
                Delivery::Plain | Delivery::Passed => {
                    self.write_row(txn, plan.table_id, &plan.store, plan.key, plan.op)?;
                }
                Delivery::Guarded(slot) => {
                    if guards[slot].1.should_apply(&key) {
                        self.write_row(txn, plan.table_id, &plan.store, plan.key, plan.op)?;
                    } else {
                        tracing::trace!(
                            "Left delivery of {:?} to table {} for the build to replay",
                            key,
                            plan.table_id
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Locks the row, appends the provisional version, and records it
    /// in the transaction's write set.
    fn write_row(
        &self,
        txn: TxnId,
        table_id: TableId,
        store: &Arc<TableStore>,
        key: Key,
        op: VersionOp,
    ) -> KilnResult<()> {
        let result = self.lock_manager().try_lock(
            txn,
            ResourceId::row(table_id, key.clone()),
            LockMode::Exclusive,
        );
        if !result.is_success() {
            return Err(KilnError::LockUnavailable {
                txn_id: txn,
                reason: format!("row in table {table_id} is held by another transaction"),
            });
        }
        let version_id = store.append_provisional(key.clone(), txn, op);
        if let Err(error) = self.txn_manager.record_write(txn, store, key.clone(), version_id) {
            // The write set never saw the version, so unwind it here.
            store.abort_provisional(&key, txn);
            return Err(error);
        }
        Ok(())
    }

    fn check_key(&self, key: &Key) -> KilnResult<()> {
        if key.len() > self.config.max_key_size {
            return Err(KilnError::KeyTooLarge {
                size: key.len(),
                max_size: self.config.max_key_size,
            });
        }
        Ok(())
    }

    fn check_value(&self, value: &Value) -> KilnResult<()> {
        if value.len() > self.config.max_value_size {
            return Err(KilnError::ValueTooLarge {
                size: value.len(),
                max_size: self.config.max_value_size,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Checkpoint
    // ------------------------------------------------------------------

    /// Runs a checkpoint.
    ///
    /// Takes the coordination lock exclusively, brackets a flush of
    /// every table's committed rows with begin and end records, and
    /// returns what the checkpoint covered.
    pub fn checkpoint(&self) -> KilnResult<CheckpointInfo> {
        let _exclusive = self.coordination.write();
        let info = self.checkpointer.run(
            &self.log,
            || self.txn_manager.live_txns(),
            || {
                self.flush_tables().map_err(|error| {
                    WalError::from(std::io::Error::other(error.to_string()))
                })
            },
        )?;
        tracing::info!(
            "Checkpoint complete: {} tables flushed, {} live txns noted",
            info.tables_flushed,
            info.live_txns
        );
        Ok(info)
    }

    /// Rewrites every table's bound run file from its committed rows.
    fn flush_tables(&self) -> KilnResult<u64> {
        let mut flushed = 0;
        for table_id in self.directory.table_ids() {
            let Some(binding) = self.directory.binding_of(table_id) else {
                continue;
            };
            let Some(path) = self.directory.path_of(binding.file_id) else {
                continue;
            };
            let mut writer = RunWriter::new(table_id, false);
            for (key, value) in binding.store.scan_resolved() {
                writer.push(key, value)?;
            }
            writer.finish(&path, self.config.sync_writes)?;
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Returns the last completed checkpoint, if any.
    #[must_use]
    pub fn last_checkpoint(&self) -> Option<CheckpointInfo> {
        self.checkpointer.last_checkpoint()
    }

    // ------------------------------------------------------------------
    // Shared services
    // ------------------------------------------------------------------

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the build counters.
    #[must_use]
    pub fn metrics(&self) -> &BuildMetrics {
        &self.metrics
    }

    pub(crate) fn directory(&self) -> &Arc<TableDirectory> {
        &self.directory
    }

    pub(crate) fn txn_manager(&self) -> &Arc<TransactionManager> {
        &self.txn_manager
    }

    pub(crate) fn lock_manager(&self) -> &Arc<LockManager> {
        self.txn_manager.lock_manager()
    }

    pub(crate) fn namer(&self) -> &FileNamer {
        &self.namer
    }

    pub(crate) fn generator(&self) -> &dyn RowGenerator {
        self.generator.as_ref()
    }

    pub(crate) fn coordination(&self) -> &RwLock<()> {
        &self.coordination
    }

    pub(crate) fn recovery_log(&self) -> &RecoveryLog {
        &self.log
    }

    pub(crate) fn store_of(&self, table_id: TableId) -> KilnResult<Arc<TableStore>> {
        self.directory
            .store_of(table_id)
            .ok_or(KilnError::TableNotFound { table_id })
    }

    /// Rebinds a destination to a freshly written empty run file.
    ///
    /// This is the error-path redirect: whatever the destination held
    /// before, afterwards it is bound to a valid empty file, undoable
    /// through the transaction like any other redirect.
    pub(crate) fn empty_redirect(
        &self,
        txn: TxnId,
        table_id: TableId,
        dest_index: usize,
    ) -> KilnResult<()> {
        let file_id = self.namer.next_file_id();
        let path = self
            .config
            .data_dir
            .join(self.namer.empty_file_name(txn, dest_index, file_id));
        runfile::write_empty_run(&path, table_id, self.config.sync_writes)?;
        self.directory.register_file(file_id, path);
        self.directory
            .redirect(table_id, txn, file_id, Arc::new(TableStore::new(table_id)))
    }

    /// Registers a hot index build on a destination. Returns false if
    /// the destination already has one.
    pub(crate) fn register_indexer(&self, dest: TableId, shared: Arc<IndexerShared>) -> bool {
        match self.indexers.entry(dest) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(shared);
                true
            }
        }
    }

    pub(crate) fn deregister_indexer(&self, dest: TableId) {
        self.indexers.remove(&dest);
    }

    pub(crate) fn indexer_for(&self, dest: TableId) -> Option<Arc<IndexerShared>> {
        self.indexers.get(&dest).map(|entry| Arc::clone(entry.value()))
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.config.data_dir)
            .field("tables", &self.directory.table_ids().len())
            .field("active_txns", &self.txn_manager.active_count())
            .finish_non_exhaustive()
    }
}

/// One planned destination write of a fanned-out operation.
struct DestWrite {
    table_id: TableId,
    store: Arc<TableStore>,
    key: Key,
    op: VersionOp,
    delivery: Delivery,
}

/// How a fanned-out write reaches its destination.
enum Delivery {
    /// No build in progress; write normally.
    Plain,
    /// The build has provably passed the source key; write without
    /// touching its scan lock.
    Passed,
    /// Decide under the build's scan lock, held at this slot.
    Guarded(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_wal::record::RecordType;
    use tempfile::TempDir;

    fn open_engine(tmp: &TempDir) -> Engine {
        Engine::open(EngineConfig::for_testing(tmp.path())).unwrap()
    }

    fn key(s: &str) -> Key {
        Key::from_vec(s.as_bytes().to_vec())
    }

    fn val(s: &str) -> Value {
        Value::from_vec(s.as_bytes().to_vec())
    }

    #[test]
    fn test_open_sweeps_orphaned_temp_files() {
        let tmp = TempDir::new().unwrap();
        let orphan = tmp.path().join("t3-d0-build-00000001.tmp");
        fs::write(&orphan, b"half written").unwrap();

        let _engine = open_engine(&tmp);
        assert!(!orphan.exists());
    }

    #[test]
    fn test_create_table_rejects_duplicate_name() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);

        let users = engine.create_table("users").unwrap();
        assert_eq!(engine.table_id_of("users"), Some(users));
        let err = engine.create_table("users").unwrap_err();
        assert!(matches!(err, KilnError::InvalidArgument { .. }));
    }

    #[test]
    fn test_create_table_writes_backing_file() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);

        let table = engine.create_table("users").unwrap();
        let binding = engine.directory.binding_of(table).unwrap();
        let path = engine.directory.path_of(binding.file_id).unwrap();
        let contents = runfile::read_run(&path).unwrap();
        assert_eq!(contents.table_id, table);
        assert!(contents.rows.is_empty());
    }

    #[test]
    fn test_put_is_invisible_until_commit() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let table = engine.create_table("t").unwrap();

        let txn = engine.begin();
        engine.put(txn, table, key("a"), val("1")).unwrap();
        assert_eq!(engine.get(table, &key("a")).unwrap(), None);

        engine.commit(txn).unwrap();
        assert_eq!(engine.get(table, &key("a")).unwrap(), Some(val("1")));
    }

    #[test]
    fn test_abort_discards_writes() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let table = engine.create_table("t").unwrap();

        let txn = engine.begin();
        engine.put(txn, table, key("a"), val("1")).unwrap();
        engine.abort(txn).unwrap();
        assert_eq!(engine.get(table, &key("a")).unwrap(), None);

        let err = engine.commit(txn).unwrap_err();
        assert!(matches!(err, KilnError::TxnRetired { .. }));
    }

    #[test]
    fn test_delete_removes_committed_row() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let table = engine.create_table("t").unwrap();

        let t1 = engine.begin();
        engine.put(t1, table, key("a"), val("1")).unwrap();
        engine.commit(t1).unwrap();

        let t2 = engine.begin();
        engine.delete(t2, table, key("a")).unwrap();
        engine.commit(t2).unwrap();
        assert_eq!(engine.get(table, &key("a")).unwrap(), None);
    }

    #[test]
    fn test_row_conflict_between_transactions() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let table = engine.create_table("t").unwrap();

        let t1 = engine.begin();
        engine.put(t1, table, key("a"), val("1")).unwrap();

        let t2 = engine.begin();
        let err = engine.put(t2, table, key("a"), val("2")).unwrap_err();
        assert!(err.is_retryable());

        // The lock drains with the commit.
        engine.commit(t1).unwrap();
        engine.put(t2, table, key("a"), val("2")).unwrap();
        engine.commit(t2).unwrap();
        assert_eq!(engine.get(table, &key("a")).unwrap(), Some(val("2")));
    }

    #[test]
    fn test_put_multiple_reaches_source_and_destinations() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let src = engine.create_table("src").unwrap();
        let d1 = engine.create_table("d1").unwrap();
        let d2 = engine.create_table("d2").unwrap();

        let txn = engine.begin();
        engine
            .put_multiple(txn, src, key("a"), val("1"), &[d1, d2])
            .unwrap();
        engine.commit(txn).unwrap();

        for table in [src, d1, d2] {
            assert_eq!(engine.get(table, &key("a")).unwrap(), Some(val("1")));
        }
    }

    #[test]
    fn test_del_multiple_removes_generated_rows() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let src = engine.create_table("src").unwrap();
        let dest = engine.create_table("dest").unwrap();

        let t1 = engine.begin();
        engine
            .put_multiple(t1, src, key("a"), val("1"), &[dest])
            .unwrap();
        engine.commit(t1).unwrap();

        let t2 = engine.begin();
        engine
            .del_multiple(t2, src, key("a"), val("1"), &[dest])
            .unwrap();
        engine.commit(t2).unwrap();

        assert_eq!(engine.get(src, &key("a")).unwrap(), None);
        assert_eq!(engine.get(dest, &key("a")).unwrap(), None);
    }

    #[test]
    fn test_oversized_key_rejected() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let table = engine.create_table("t").unwrap();

        let txn = engine.begin();
        let big = Key::from_vec(vec![b'x'; engine.config().max_key_size + 1]);
        let err = engine.put(txn, table, big, val("v")).unwrap_err();
        assert!(matches!(err, KilnError::KeyTooLarge { .. }));
        engine.abort(txn).unwrap();
    }

    #[test]
    fn test_commit_reaches_the_log_before_resolving() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let table = engine.create_table("t").unwrap();

        let txn = engine.begin();
        engine.put(txn, table, key("a"), val("1")).unwrap();
        engine.commit(txn).unwrap();

        let records = engine.recovery_log().records().unwrap();
        assert!(records
            .iter()
            .any(|r| r.record_type() == RecordType::TxnCommit));
    }

    #[test]
    fn test_checkpoint_flushes_committed_rows() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let table = engine.create_table("t").unwrap();

        let txn = engine.begin();
        engine.put(txn, table, key("a"), val("1")).unwrap();
        engine.put(txn, table, key("b"), val("2")).unwrap();
        engine.commit(txn).unwrap();

        let info = engine.checkpoint().unwrap();
        assert_eq!(info.tables_flushed, 1);
        assert!(engine.last_checkpoint().is_some());

        let binding = engine.directory.binding_of(table).unwrap();
        let path = engine.directory.path_of(binding.file_id).unwrap();
        let contents = runfile::read_run(&path).unwrap();
        assert_eq!(contents.rows, vec![(key("a"), val("1")), (key("b"), val("2"))]);
    }

    #[test]
    fn test_checkpoint_notes_live_transactions() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let table = engine.create_table("t").unwrap();

        let txn = engine.begin();
        engine.put(txn, table, key("a"), val("1")).unwrap();

        let info = engine.checkpoint().unwrap();
        assert_eq!(info.live_txns, 1);
        engine.abort(txn).unwrap();
    }

    #[test]
    fn test_indexer_registry_is_exclusive_per_destination() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let dest = engine.create_table("dest").unwrap();

        let shared = Arc::new(IndexerShared::new());
        assert!(engine.register_indexer(dest, Arc::clone(&shared)));
        assert!(!engine.register_indexer(dest, Arc::clone(&shared)));

        engine.deregister_indexer(dest);
        assert!(engine.register_indexer(dest, shared));
    }
}
