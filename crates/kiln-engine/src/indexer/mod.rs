//! Hot index builds.
//!
//! An [`Indexer`] populates destination tables from a source table
//! while the source stays open for writes. Creation claims the
//! destinations in the engine's build registry, pre-empties them
//! through a no-puts load, and notes the build in the recovery log.
//! The build then walks the source one row at a time, copying each
//! row's version chain out under the scan lock and replaying it into
//! every destination.
//!
//! Writers fanning rows out through the engine consult the scan
//! position: keys the scan has already passed are theirs to deliver,
//! keys ahead of it will be picked up when the scan arrives. Holding
//! the scan lock across the copy and the replay is what keeps the two
//! sides from ever delivering the same version twice.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use kiln_common::error::{KilnError, KilnResult};
use kiln_common::types::{Key, TableId, TxnId, Value};
use kiln_store::cursor::MultiVersionCursor;
use kiln_store::table::TableStore;
use kiln_store::version::{RowSnapshot, VersionOp};
use kiln_txn::manager::TxnState;

use crate::engine::Engine;
use crate::estimate::PositionEstimate;
use crate::loader::{ErrorCallback, Loader, LoaderOptions, PollCallback};
use crate::replay::{replay_row, ReplayStep};

/// Options for a hot index build.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexerOptions {
    /// Rows between poll callback invocations. 0 inherits the
    /// engine's `poll_period_rows`.
    pub poll_interval_rows: u64,
}

/// Scan position of a build, readable by writers under the lock.
#[derive(Debug, Default)]
pub(crate) struct ScanState {
    /// Last source key the scan copied out.
    pub(crate) last_returned: Option<Key>,
    /// True once the scan has run off the end of the source.
    pub(crate) exhausted: bool,
}

impl ScanState {
    /// Decides whether a concurrent writer delivers a row for this
    /// source key itself. Keys at or behind the scan are the writer's
    /// job; keys ahead of it reach the destinations through replay.
    pub(crate) fn should_apply(&self, key: &Key) -> bool {
        self.exhausted || self.last_returned.as_ref().is_some_and(|last| key <= last)
    }
}

/// State shared between one build and the writers racing it.
#[derive(Debug)]
pub(crate) struct IndexerShared {
    /// Precise position, consulted under the lock.
    pub(crate) scan: Mutex<ScanState>,
    /// Lagging copy of the position, readable without the lock.
    pub(crate) estimate: PositionEstimate,
}

impl IndexerShared {
    pub(crate) fn new() -> Self {
        Self {
            scan: Mutex::new(ScanState::default()),
            estimate: PositionEstimate::new(),
        }
    }
}

/// A failure remembered until close or abort reports it.
struct BuildFailure {
    dest_index: usize,
    error: KilnError,
    key: Key,
}

impl BuildFailure {
    fn cancelled() -> Self {
        Self {
            dest_index: 0,
            error: KilnError::Cancelled,
            key: Key::empty(),
        }
    }
}

/// An online index build over an open source table.
pub struct Indexer<'e> {
    engine: &'e Engine,
    txn: TxnId,
    src: TableId,
    src_store: Arc<TableStore>,
    /// Destinations with the stores captured after pre-emptying.
    dests: Vec<(TableId, Arc<TableStore>)>,
    shared: Arc<IndexerShared>,
    cursor: MultiVersionCursor,
    rows_done: u64,
    failure: Option<BuildFailure>,
    error_reported: bool,
    error_cb: Option<ErrorCallback<'e>>,
    poll_fn: Option<PollCallback<'e>>,
    options: IndexerOptions,
    terminated: bool,
}

impl<'e> Indexer<'e> {
    /// Creates a hot index build from `src` into `dests` under `txn`.
    ///
    /// Claims every destination in the build registry, pre-empties
    /// them through a no-puts load (which locks them and redirects
    /// each to a fresh empty file), and records the build in the
    /// recovery log. Fails synchronously with the registry claims
    /// released.
    pub fn create(
        engine: &'e Engine,
        txn: TxnId,
        src: TableId,
        dests: &[TableId],
        options: IndexerOptions,
    ) -> KilnResult<Self> {
        match Self::try_create(engine, txn, src, dests, options) {
            Ok(indexer) => {
                engine.metrics().indexer_opened();
                tracing::info!(
                    "Opened hot index build of {} destinations from table {} in txn {}",
                    dests.len(),
                    src,
                    txn
                );
                Ok(indexer)
            }
            Err(error) => {
                engine.metrics().indexer_open_failed();
                tracing::warn!("Hot index build creation for txn {} failed: {}", txn, error);
                Err(error)
            }
        }
    }

    fn try_create(
        engine: &'e Engine,
        txn: TxnId,
        src: TableId,
        dests: &[TableId],
        options: IndexerOptions,
    ) -> KilnResult<Self> {
        if dests.is_empty() {
            return Err(KilnError::invalid_argument(
                "hot index build needs at least one destination",
            ));
        }
        if dests.contains(&src) {
            return Err(KilnError::invalid_argument(
                "hot index build cannot target its own source",
            ));
        }
        for (index, dest) in dests.iter().enumerate() {
            if dests[..index].contains(dest) {
                return Err(KilnError::invalid_argument(format!(
                    "table {dest} appears twice in the destination list"
                )));
            }
        }
        if !engine.directory().table_exists(src) {
            return Err(KilnError::TableNotFound { table_id: src });
        }
        for &dest in dests {
            if !engine.directory().table_exists(dest) {
                return Err(KilnError::TableNotFound { table_id: dest });
            }
        }

        // Claim the destinations first; one build per destination.
        let shared = Arc::new(IndexerShared::new());
        let mut claimed = Vec::with_capacity(dests.len());
        for &dest in dests {
            if engine.register_indexer(dest, Arc::clone(&shared)) {
                claimed.push(dest);
            } else {
                Self::release_claims(engine, &claimed);
                return Err(KilnError::DestinationBusy { table_id: dest });
            }
        }

        let prepared = Self::preempty_and_capture(engine, txn, src, dests);
        match prepared {
            Ok((src_store, dest_stores)) => Ok(Self {
                engine,
                txn,
                src,
                cursor: MultiVersionCursor::new(Arc::clone(&src_store)),
                src_store,
                dests: dest_stores,
                shared,
                rows_done: 0,
                failure: None,
                error_reported: false,
                error_cb: None,
                poll_fn: None,
                options,
                terminated: false,
            }),
            Err(error) => {
                Self::release_claims(engine, dests);
                Err(error)
            }
        }
    }

    /// Pre-empties the destinations and captures the stores they were
    /// left bound to, then logs the build over those files.
    fn preempty_and_capture(
        engine: &Engine,
        txn: TxnId,
        src: TableId,
        dests: &[TableId],
    ) -> KilnResult<(Arc<TableStore>, Vec<(TableId, Arc<TableStore>)>)> {
        let loader = Loader::create(engine, txn, Some(src), dests, LoaderOptions::no_puts())?;
        loader.close()?;

        let mut dest_stores = Vec::with_capacity(dests.len());
        let mut file_ids = Vec::with_capacity(dests.len());
        for &dest in dests {
            let Some(binding) = engine.directory().binding_of(dest) else {
                return Err(KilnError::TableNotFound { table_id: dest });
            };
            file_ids.push(binding.file_id);
            dest_stores.push((dest, binding.store));
        }
        let src_store = engine.store_of(src)?;

        engine.recovery_log().register_hot_index(txn, file_ids)?;
        Ok((src_store, dest_stores))
    }

    fn release_claims(engine: &Engine, dests: &[TableId]) {
        for &dest in dests {
            engine.deregister_indexer(dest);
        }
    }

    /// Runs the build to the end of the source.
    ///
    /// Each iteration copies one row's version chain out and replays
    /// it into every destination while the scan lock is held, then
    /// publishes the position and polls for cancellation at the
    /// configured interval. When the scan runs off the end, a
    /// checkpoint settles the destinations on disk.
    pub fn build(&mut self) -> KilnResult<()> {
        if let Some(failure) = &self.failure {
            return Err(failure.error.clone());
        }
        match self.try_build() {
            Ok(()) => {
                self.engine.metrics().indexer_built();
                tracing::info!(
                    "Hot index build by txn {} replayed {} rows from table {}",
                    self.txn,
                    self.rows_done,
                    self.src
                );
                Ok(())
            }
            Err(failure) => {
                let error = failure.error.clone();
                self.failure = Some(failure);
                self.engine.metrics().indexer_build_failed();
                tracing::warn!("Hot index build by txn {} failed: {}", self.txn, error);
                Err(error)
            }
        }
    }

    fn try_build(&mut self) -> Result<(), BuildFailure> {
        let interval = if self.options.poll_interval_rows > 0 {
            self.options.poll_interval_rows
        } else {
            self.engine.config().poll_period_rows
        };

        loop {
            let _quiesce = self.engine.coordination().read();
            let mut scan = self.shared.scan.lock();
            let Some(row) = self.cursor.advance() else {
                // Writers apply everything once the scan is done.
                scan.exhausted = true;
                break;
            };
            let source_key = row.key.clone();

            let outcome = if row.has_provisional() {
                Self::replay_with_owners(self.engine, &self.dests, &mut self.cursor)
            } else {
                Self::apply_row(self.engine, &self.dests, &row, &HashMap::new())
            };
            outcome?;

            scan.last_returned = Some(source_key.clone());
            drop(scan);
            drop(_quiesce);

            self.shared.estimate.publish(source_key);
            self.rows_done += 1;

            if self.rows_done % interval == 0 {
                let total = self.src_store.row_count() as f32;
                let fraction = if total > 0.0 {
                    (self.rows_done as f32 / total).min(1.0)
                } else {
                    1.0
                };
                tracing::debug!(
                    "Hot index build by txn {}: {} rows replayed ({:.0}% of source)",
                    self.txn,
                    self.rows_done,
                    fraction * 100.0
                );
                if self.poll(fraction) {
                    return Err(BuildFailure::cancelled());
                }
            }
        }

        self.engine.checkpoint().map_err(|error| BuildFailure {
            dest_index: 0,
            error,
            key: Key::empty(),
        })?;
        Ok(())
    }

    /// Replays a row that carries provisional versions.
    ///
    /// Freezes transaction states, rereads the row under the freeze so
    /// the copy and the states agree, and pins the owners that could
    /// still retire before applying.
    fn replay_with_owners(
        engine: &Engine,
        dests: &[(TableId, Arc<TableStore>)],
        cursor: &mut MultiVersionCursor,
    ) -> Result<(), BuildFailure> {
        let freeze = engine.txn_manager().freeze();
        let Some(row) = cursor.reread_current() else {
            // The row vanished since the first copy; the position
            // still advances past it.
            return Ok(());
        };

        let mut states = HashMap::new();
        let mut pinnable = Vec::new();
        for version in &row.provisional {
            let state = freeze.state_of(version.owner);
            states.insert(version.owner, state);
            if !state.is_retired() && !pinnable.contains(&version.owner) {
                pinnable.push(version.owner);
            }
        }

        let pins = freeze.pin_owners(&pinnable).map_err(|error| BuildFailure {
            dest_index: 0,
            error,
            key: row.key.clone(),
        })?;
        let applied = Self::apply_row(engine, dests, &row, &states);
        drop(pins);
        applied
    }

    /// Replays one row snapshot into every destination.
    fn apply_row(
        engine: &Engine,
        dests: &[(TableId, Arc<TableStore>)],
        row: &RowSnapshot,
        states: &HashMap<TxnId, TxnState>,
    ) -> Result<(), BuildFailure> {
        for (index, (dest, store)) in dests.iter().enumerate() {
            let steps = replay_row(row, states, |key, value| {
                engine.generator().generate(*dest, index, key, value)
            });
            for step in steps {
                match step {
                    ReplayStep::Committed { key, value, seq } => {
                        store.insert_baseline(key, seq, VersionOp::Insert(value));
                    }
                    ReplayStep::Provisional { key, op, owner } => {
                        let version_id = store.append_provisional(key.clone(), owner, op);
                        if let Err(error) =
                            engine.txn_manager().adopt_write(owner, store, key, version_id)
                        {
                            return Err(BuildFailure {
                                dest_index: index,
                                error,
                                key: row.key.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Finishes the build.
    ///
    /// Releases the registry claims, logs the end of the build, and
    /// reports a remembered failure through the error callback at most
    /// once. Returns the remembered failure if the build never
    /// completed.
    pub fn close(mut self) -> KilnResult<()> {
        self.terminated = true;
        self.release_registry();
        self.log_build_end();
        self.report_failure_once();
        match self.failure.take() {
            None => {
                self.engine.metrics().indexer_closed();
                tracing::info!(
                    "Closed hot index build by txn {} after {} rows",
                    self.txn,
                    self.rows_done
                );
                Ok(())
            }
            Some(failure) => {
                self.engine.metrics().indexer_closed();
                Err(failure.error)
            }
        }
    }

    /// Abandons the build.
    ///
    /// Releases the registry claims and logs the end of the build.
    /// The destinations keep whatever was replayed; aborting the
    /// owning transaction is what reverts them.
    pub fn abort(mut self) -> KilnResult<()> {
        self.terminated = true;
        self.release_registry();
        self.log_build_end();
        self.report_failure_once();
        self.engine.metrics().indexer_aborted();
        tracing::info!("Aborted hot index build by txn {}", self.txn);
        Ok(())
    }

    /// Stores the callback invoked with the failure that stops a build.
    pub fn set_error_callback(&mut self, callback: ErrorCallback<'e>) {
        self.error_cb = Some(callback);
    }

    /// Stores the progress callback polled during the build.
    pub fn set_poll_function(&mut self, callback: PollCallback<'e>) {
        self.poll_fn = Some(callback);
    }

    /// Returns the transaction the build runs under.
    #[must_use]
    pub fn txn(&self) -> TxnId {
        self.txn
    }

    /// Returns the source table.
    #[must_use]
    pub fn source(&self) -> TableId {
        self.src
    }

    /// Returns the number of source rows replayed so far.
    #[must_use]
    pub fn rows_done(&self) -> u64 {
        self.rows_done
    }

    /// Returns the published scan position, if the scan has started.
    #[must_use]
    pub fn position(&self) -> Option<Key> {
        self.shared.estimate.boundary()
    }

    fn release_registry(&self) {
        for (dest, _) in &self.dests {
            self.engine.deregister_indexer(*dest);
        }
    }

    fn log_build_end(&self) {
        if let Err(error) = self.engine.recovery_log().hot_index_end(self.txn) {
            tracing::warn!(
                "Could not log the end of the hot index build by txn {}: {}",
                self.txn,
                error
            );
        }
    }

    fn report_failure_once(&mut self) {
        if self.error_reported {
            return;
        }
        if let Some(failure) = &self.failure {
            if let Some(callback) = &mut self.error_cb {
                callback(failure.dest_index, &failure.error, &failure.key, &Value::empty());
            }
            self.error_reported = true;
        }
    }

    fn poll(&mut self, progress: f32) -> bool {
        match &mut self.poll_fn {
            Some(callback) => callback(progress),
            None => false,
        }
    }
}

impl Drop for Indexer<'_> {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        // Quiet cleanup; no callback fires on an abandoned handle.
        self.release_registry();
        self.log_build_end();
        self.engine.metrics().indexer_aborted();
        tracing::warn!(
            "Hot index build by txn {} dropped without close or abort",
            self.txn
        );
    }
}

impl fmt::Debug for Indexer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Indexer")
            .field("txn", &self.txn)
            .field("source", &self.src)
            .field("destinations", &self.dests.len())
            .field("rows_done", &self.rows_done)
            .field("failed", &self.failure.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;
    use std::rc::Rc;

    use kiln_common::config::EngineConfig;
    use tempfile::TempDir;

    fn open_engine(tmp: &TempDir) -> Engine {
        Engine::open(EngineConfig::for_testing(tmp.path())).unwrap()
    }

    fn key(s: &str) -> Key {
        Key::from_str(s)
    }

    fn val(s: &str) -> Value {
        Value::from_str(s)
    }

    fn fill(engine: &Engine, table: TableId, rows: &[(&str, &str)]) {
        let txn = engine.begin();
        for (k, v) in rows {
            engine.put(txn, table, key(k), val(v)).unwrap();
        }
        engine.commit(txn).unwrap();
    }

    #[test]
    fn test_should_apply_follows_the_scan() {
        let mut scan = ScanState::default();
        assert!(!scan.should_apply(&key("a")));

        scan.last_returned = Some(key("m"));
        assert!(scan.should_apply(&key("a")));
        assert!(scan.should_apply(&key("m")));
        assert!(!scan.should_apply(&key("n")));

        scan.exhausted = true;
        assert!(scan.should_apply(&key("z")));
    }

    #[test]
    fn test_create_rejects_source_in_destinations() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let src = engine.create_table("src").unwrap();
        let dest = engine.create_table("dest").unwrap();

        let txn = engine.begin();
        let err = Indexer::create(&engine, txn, src, &[dest, src], IndexerOptions::default())
            .unwrap_err();
        assert!(matches!(err, KilnError::InvalidArgument { .. }));
        assert!(engine.indexer_for(dest).is_none());
        engine.abort(txn).unwrap();
    }

    #[test]
    fn test_create_rejects_busy_destination() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let src = engine.create_table("src").unwrap();
        let other = engine.create_table("other").unwrap();
        let dest = engine.create_table("dest").unwrap();

        let t1 = engine.begin();
        let first = Indexer::create(&engine, t1, src, &[dest], IndexerOptions::default()).unwrap();

        let t2 = engine.begin();
        let err =
            Indexer::create(&engine, t2, other, &[dest], IndexerOptions::default()).unwrap_err();
        assert!(matches!(err, KilnError::DestinationBusy { .. }));
        assert!(err.is_retryable());

        first.close().unwrap();
        engine.commit(t1).unwrap();
        engine.abort(t2).unwrap();
        assert!(engine.indexer_for(dest).is_none());
    }

    #[test]
    fn test_create_preempties_destinations() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let src = engine.create_table("src").unwrap();
        let dest = engine.create_table("dest").unwrap();
        fill(&engine, dest, &[("stale", "row")]);

        let txn = engine.begin();
        let indexer = Indexer::create(&engine, txn, src, &[dest], IndexerOptions::default())
            .unwrap();
        assert!(engine.table_is_empty(dest).unwrap());

        // Aborting the transaction rolls the pre-empty redirect back.
        indexer.abort().unwrap();
        engine.abort(txn).unwrap();
        assert_eq!(engine.get(dest, &key("stale")).unwrap(), Some(val("row")));
    }

    #[test]
    fn test_build_copies_committed_source() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let src = engine.create_table("src").unwrap();
        let dest = engine.create_table("dest").unwrap();
        fill(&engine, src, &[("a", "1"), ("b", "2"), ("c", "3")]);

        let txn = engine.begin();
        let mut indexer =
            Indexer::create(&engine, txn, src, &[dest], IndexerOptions::default()).unwrap();
        indexer.build().unwrap();
        assert_eq!(indexer.rows_done(), 3);
        assert_eq!(indexer.position(), Some(key("c")));
        indexer.close().unwrap();
        engine.commit(txn).unwrap();

        assert_eq!(
            engine.scan_committed(dest).unwrap(),
            engine.scan_committed(src).unwrap()
        );
    }

    #[test]
    fn test_build_skips_committed_deletes() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let src = engine.create_table("src").unwrap();
        let dest = engine.create_table("dest").unwrap();
        fill(&engine, src, &[("a", "1"), ("b", "2")]);

        let gone = engine.begin();
        engine.delete(gone, src, key("a")).unwrap();
        engine.commit(gone).unwrap();

        let txn = engine.begin();
        let mut indexer =
            Indexer::create(&engine, txn, src, &[dest], IndexerOptions::default()).unwrap();
        indexer.build().unwrap();
        indexer.close().unwrap();
        engine.commit(txn).unwrap();

        assert_eq!(engine.get(dest, &key("a")).unwrap(), None);
        assert_eq!(engine.get(dest, &key("b")).unwrap(), Some(val("2")));
    }

    #[test]
    fn test_build_adopts_provisional_versions() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let src = engine.create_table("src").unwrap();
        let dest = engine.create_table("dest").unwrap();
        fill(&engine, src, &[("a", "old")]);

        // A live writer holds a provisional update on the row.
        let writer = engine.begin();
        engine.put(writer, src, key("a"), val("new")).unwrap();

        let txn = engine.begin();
        let mut indexer =
            Indexer::create(&engine, txn, src, &[dest], IndexerOptions::default()).unwrap();
        indexer.build().unwrap();
        indexer.close().unwrap();
        engine.commit(txn).unwrap();

        // Only the committed baseline resolves until the writer does.
        assert_eq!(engine.get(dest, &key("a")).unwrap(), Some(val("old")));
        engine.commit(writer).unwrap();
        assert_eq!(engine.get(dest, &key("a")).unwrap(), Some(val("new")));
    }

    #[test]
    fn test_cancelled_build_reports_once() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let src = engine.create_table("src").unwrap();
        let dest = engine.create_table("dest").unwrap();
        fill(&engine, src, &[("a", "1"), ("b", "2"), ("c", "3")]);

        let txn = engine.begin();
        let mut indexer = Indexer::create(
            &engine,
            txn,
            src,
            &[dest],
            IndexerOptions {
                poll_interval_rows: 1,
            },
        )
        .unwrap();
        indexer.set_poll_function(Box::new(|_| true));

        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        indexer.set_error_callback(Box::new(move |_, error, _, _| {
            assert!(matches!(error, KilnError::Cancelled));
            seen.set(seen.get() + 1);
        }));

        let err = indexer.build().unwrap_err();
        assert!(matches!(err, KilnError::Cancelled));

        let err = indexer.close().unwrap_err();
        assert!(matches!(err, KilnError::Cancelled));
        assert_eq!(calls.get(), 1);
        engine.abort(txn).unwrap();
    }
}
