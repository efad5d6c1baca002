//! Bulk loading of destination tables.
//!
//! A [`Loader`] rebuilds a set of destination tables from scratch
//! inside a transaction. Creation locks the destinations, redirects
//! each one's binding to a fresh (still unwritten) file, and opens one
//! sort pipeline per destination. `put` fans each source row out
//! through the engine's row generator; `close` writes every pipeline
//! to an immutable run file and installs the rows as the committed
//! image of the new binding. The redirects stay undoable until the
//! enclosing transaction resolves, so aborting the transaction restores
//! the destinations exactly as they were.
//!
//! Failure converges on empty destinations: the first `put` error is
//! remembered and returned from every later call, and `close` then
//! reports it through the error callback once and redirects every
//! destination to a fresh empty file instead. A loader created in
//! no-puts mode skips straight to that empty result on close, which is
//! how destinations are pre-emptied for an index build.

use std::mem;
use std::sync::Arc;

use kiln_common::config::EngineConfig;
use kiln_common::error::{KilnError, KilnResult};
use kiln_common::types::{CommitSeq, FileId, Key, TableId, TxnId, Value};
use kiln_store::runfile::RunWriter;
use kiln_store::table::TableStore;
use kiln_store::version::VersionOp;
use kiln_txn::lock::{LockMode, LockResult, ResourceId};

use crate::engine::Engine;

/// Callback invoked at most once with the failure that stopped a build.
pub type ErrorCallback<'a> = Box<dyn FnMut(usize, &KilnError, &Key, &Value) + 'a>;

/// Progress callback; returning `true` requests cancellation.
///
/// The callback may call back into the engine, which is how callers
/// mutate tables mid-build.
pub type PollCallback<'a> = Box<dyn FnMut(f32) -> bool + 'a>;

/// Options controlling loader creation.
#[derive(Debug, Clone, Copy)]
pub struct LoaderOptions {
    /// Accept rows through `put`. A no-puts loader produces empty
    /// destinations; see [`LoaderOptions::no_puts`].
    pub puts_allowed: bool,
    /// Fail creation if a destination currently has rows.
    pub check_empty: bool,
    /// Skip destination lock acquisition; the caller already holds
    /// exclusive table locks under the same transaction.
    pub assume_locked: bool,
    /// Fail a `put` whose generated key repeats within a destination.
    pub enforce_unique: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            puts_allowed: true,
            check_empty: false,
            assume_locked: false,
            enforce_unique: false,
        }
    }
}

impl LoaderOptions {
    /// Options for a loader that accepts no rows.
    ///
    /// Closing such a loader redirects every destination to a valid
    /// empty file, which is the pre-emptying step of an index build.
    #[must_use]
    pub fn no_puts() -> Self {
        Self {
            puts_allowed: false,
            ..Self::default()
        }
    }
}

/// The first failure recorded by a loader.
#[derive(Debug, Clone)]
struct LoadFailure {
    dest_index: usize,
    error: KilnError,
    key: Key,
    val: Value,
}

impl LoadFailure {
    fn cancelled(dest_index: usize) -> Self {
        Self {
            dest_index,
            error: KilnError::Cancelled,
            key: Key::empty(),
            val: Value::empty(),
        }
    }
}

/// One destination's build state.
#[derive(Debug)]
struct DestBuild {
    table_id: TableId,
    file_id: FileId,
    path: std::path::PathBuf,
    store: Arc<TableStore>,
    writer: RunWriter,
}

/// A bulk load of one or more destination tables.
///
/// The handle must be consumed by [`close`](Self::close) or
/// [`abort`](Self::abort); dropping it unterminated performs the abort
/// cleanup without invoking any callback.
pub struct Loader<'e> {
    engine: &'e Engine,
    txn: TxnId,
    src: Option<TableId>,
    dests: Vec<DestBuild>,
    puts_allowed: bool,
    failure: Option<LoadFailure>,
    error_reported: bool,
    error_cb: Option<ErrorCallback<'e>>,
    poll_fn: Option<PollCallback<'e>>,
    rows_fed: u64,
    terminated: bool,
}

impl<'e> Loader<'e> {
    /// Creates a loader for `dests` under `txn`.
    ///
    /// Acquires an exclusive table lock on every destination (unless
    /// `assume_locked`) and installs a provisional directory redirect
    /// per destination. Fails synchronously with nothing left behind:
    /// locks this call acquired are released and no redirect survives.
    pub fn create(
        engine: &'e Engine,
        txn: TxnId,
        src: Option<TableId>,
        dests: &[TableId],
        options: LoaderOptions,
    ) -> KilnResult<Self> {
        match Self::try_create(engine, txn, src, dests, options) {
            Ok(loader) => {
                engine.metrics().loader_opened();
                tracing::info!(
                    "Opened loader for txn {} with {} destinations",
                    txn,
                    dests.len()
                );
                Ok(loader)
            }
            Err(error) => {
                engine.metrics().loader_open_failed();
                tracing::warn!("Loader creation for txn {} failed: {}", txn, error);
                Err(error)
            }
        }
    }

    fn try_create(
        engine: &'e Engine,
        txn: TxnId,
        src: Option<TableId>,
        dests: &[TableId],
        options: LoaderOptions,
    ) -> KilnResult<Self> {
        if dests.is_empty() {
            return Err(KilnError::invalid_argument(
                "loader needs at least one destination",
            ));
        }
        for (index, &dest) in dests.iter().enumerate() {
            if dests[..index].contains(&dest) {
                return Err(KilnError::invalid_argument(format!(
                    "destination table {dest} appears twice"
                )));
            }
        }
        if let Some(src) = src {
            if !engine.directory().table_exists(src) {
                return Err(KilnError::TableNotFound { table_id: src });
            }
        }
        for &dest in dests {
            if !engine.directory().table_exists(dest) {
                return Err(KilnError::TableNotFound { table_id: dest });
            }
        }

        let mut acquired = Vec::new();
        if !options.assume_locked {
            for &dest in dests {
                match engine
                    .lock_manager()
                    .try_lock(txn, ResourceId::table(dest), LockMode::Exclusive)
                {
                    LockResult::Conflict => {
                        for resource in &acquired {
                            engine.lock_manager().unlock(txn, resource);
                        }
                        return Err(KilnError::LockUnavailable {
                            txn_id: txn,
                            reason: format!("table {dest} is locked by another transaction"),
                        });
                    }
                    LockResult::Granted | LockResult::Upgraded => {
                        acquired.push(ResourceId::table(dest));
                    }
                    LockResult::AlreadyHeld => {}
                }
            }
        }

        if options.check_empty {
            for &dest in dests {
                let has_rows = engine
                    .directory()
                    .store_of(dest)
                    .is_some_and(|store| !store.is_empty());
                if has_rows {
                    for resource in &acquired {
                        engine.lock_manager().unlock(txn, resource);
                    }
                    return Err(KilnError::DestinationNotEmpty { table_id: dest });
                }
            }
        }

        let mut builds = Vec::with_capacity(dests.len());
        for (index, &dest) in dests.iter().enumerate() {
            let file_id = engine.namer().next_file_id();
            let name = if options.puts_allowed {
                engine.namer().build_file_name(txn, index, file_id)
            } else {
                engine.namer().empty_file_name(txn, index, file_id)
            };
            builds.push(DestBuild {
                table_id: dest,
                file_id,
                path: engine.config().data_dir.join(name),
                store: Arc::new(TableStore::new(dest)),
                writer: RunWriter::new(dest, options.enforce_unique),
            });
        }
        // The redirects cannot fail past the existence checks above;
        // tables are never unbound.
        for build in &builds {
            engine
                .directory()
                .register_file(build.file_id, build.path.clone());
            engine
                .directory()
                .redirect(build.table_id, txn, build.file_id, Arc::clone(&build.store))?;
        }

        Ok(Self {
            engine,
            txn,
            src,
            dests: builds,
            puts_allowed: options.puts_allowed,
            failure: None,
            error_reported: false,
            error_cb: None,
            poll_fn: None,
            rows_fed: 0,
            terminated: false,
        })
    }

    /// Feeds one row into every destination pipeline.
    ///
    /// The first failure is remembered; every later call returns the
    /// same error without touching the pipelines.
    pub fn put(&mut self, key: Key, value: Value) -> KilnResult<()> {
        let engine = self.engine;
        if !self.puts_allowed {
            return Err(KilnError::invalid_argument(
                "loader was created in no-puts mode",
            ));
        }
        if let Some(failure) = &self.failure {
            return Err(failure.error.clone());
        }

        for index in 0..self.dests.len() {
            let dest = self.dests[index].table_id;
            let (gen_key, gen_value) = engine.generator().generate(dest, index, &key, &value);
            if let Err(error) = Self::feed(&mut self.dests[index], engine.config(), gen_key, gen_value) {
                self.failure = Some(LoadFailure {
                    dest_index: index,
                    error: error.clone(),
                    key: key.clone(),
                    val: value.clone(),
                });
                engine.metrics().loader_put_failed();
                tracing::warn!(
                    "Loader put for txn {} failed on destination {}: {}",
                    self.txn,
                    index,
                    error
                );
                return Err(error);
            }
        }
        self.rows_fed += 1;
        engine.metrics().loader_put();
        Ok(())
    }

    fn feed(
        build: &mut DestBuild,
        config: &EngineConfig,
        key: Key,
        value: Value,
    ) -> KilnResult<()> {
        if key.len() > config.max_key_size {
            return Err(KilnError::KeyTooLarge {
                size: key.len(),
                max_size: config.max_key_size,
            });
        }
        if value.len() > config.max_value_size {
            return Err(KilnError::ValueTooLarge {
                size: value.len(),
                max_size: config.max_value_size,
            });
        }
        build.writer.push(key, value)
    }

    /// Finishes the load.
    ///
    /// With no recorded failure, writes every pipeline to its run file
    /// and installs the rows as the committed image of the binding the
    /// destination was redirected to at creation, polling for
    /// cancellation between destinations. With a recorded failure (or a
    /// cancellation request), reports it through the error callback at
    /// most once, redirects every destination to a fresh empty file,
    /// and returns the failure.
    pub fn close(mut self) -> KilnResult<()> {
        self.terminated = true;
        let builds = mem::take(&mut self.dests);
        let dest_ids: Vec<TableId> = builds.iter().map(|b| b.table_id).collect();

        if self.failure.is_some() {
            return Err(self.fail(&dest_ids));
        }

        let total = builds.len();
        for (index, build) in builds.into_iter().enumerate() {
            if index > 0 && self.poll(index as f32 / total as f32) {
                self.failure = Some(LoadFailure::cancelled(index));
                return Err(self.fail(&dest_ids));
            }
            if let Err(error) = self.finalize_destination(index, build) {
                self.failure = Some(LoadFailure {
                    dest_index: index,
                    error,
                    key: Key::empty(),
                    val: Value::empty(),
                });
                return Err(self.fail(&dest_ids));
            }
        }

        self.engine.metrics().loader_closed();
        tracing::info!(
            "Closed loader for txn {}: {} rows into {} destinations",
            self.txn,
            self.rows_fed,
            total
        );
        Ok(())
    }

    /// Abandons the load.
    ///
    /// Reports a recorded failure through the error callback at most
    /// once, discards the pipelines, and redirects every destination to
    /// a fresh empty file.
    pub fn abort(mut self) -> KilnResult<()> {
        self.terminated = true;
        let builds = mem::take(&mut self.dests);
        let dest_ids: Vec<TableId> = builds.iter().map(|b| b.table_id).collect();
        drop(builds);

        self.report_failure_once();
        self.empty_redirect_all(&dest_ids);
        self.engine.metrics().loader_aborted();
        tracing::info!("Aborted loader for txn {}", self.txn);
        Ok(())
    }

    /// Stores the callback invoked with the failure that stops a build.
    pub fn set_error_callback(&mut self, callback: ErrorCallback<'e>) {
        self.error_cb = Some(callback);
    }

    /// Stores the progress callback polled during `close`.
    pub fn set_poll_function(&mut self, callback: PollCallback<'e>) {
        self.poll_fn = Some(callback);
    }

    /// Returns the enclosing transaction.
    #[must_use]
    pub fn txn(&self) -> TxnId {
        self.txn
    }

    /// Returns the source table this load was declared with, if any.
    #[must_use]
    pub fn source(&self) -> Option<TableId> {
        self.src
    }

    /// Returns the number of rows accepted so far.
    #[must_use]
    pub fn rows_fed(&self) -> u64 {
        self.rows_fed
    }

    fn finalize_destination(&self, index: usize, build: DestBuild) -> KilnResult<()> {
        // Keeps a checkpoint from flushing a destination mid-fill.
        let _quiesce = self.engine.coordination().read();

        let rows = build.writer.rows();
        let run = build
            .writer
            .finish(&build.path, self.engine.config().sync_writes)?;

        let seq = self.engine.txn_manager().last_committed_seq();
        let seq = if seq.is_valid() { seq } else { CommitSeq::FIRST };
        for (key, value) in rows {
            build.store.insert_baseline(key, seq, VersionOp::Insert(value));
        }

        tracing::debug!(
            "Finalized destination {} (table {}, file {}) for txn {}: {} rows, {} bytes",
            index,
            build.table_id,
            build.file_id,
            self.txn,
            run.row_count,
            run.bytes_written
        );
        Ok(())
    }

    /// Error path shared by close and cancellation.
    fn fail(&mut self, dest_ids: &[TableId]) -> KilnError {
        self.report_failure_once();
        self.empty_redirect_all(dest_ids);
        self.engine.metrics().loader_close_failed();

        let error = self
            .failure
            .as_ref()
            .map(|f| f.error.clone())
            .unwrap_or_else(|| KilnError::internal("loader error path without a failure"));
        tracing::warn!("Loader for txn {} failed: {}", self.txn, error);
        error
    }

    fn report_failure_once(&mut self) {
        if self.error_reported {
            return;
        }
        if let Some(failure) = &self.failure {
            if let Some(callback) = &mut self.error_cb {
                callback(failure.dest_index, &failure.error, &failure.key, &failure.val);
            }
            self.error_reported = true;
        }
    }

    fn empty_redirect_all(&mut self, dest_ids: &[TableId]) {
        for (index, &dest) in dest_ids.iter().enumerate() {
            if let Err(error) = self.engine.empty_redirect(self.txn, dest, index) {
                tracing::warn!(
                    "Empty redirect of table {} for txn {} failed: {}",
                    dest,
                    self.txn,
                    error
                );
            }
        }
    }

    fn poll(&mut self, progress: f32) -> bool {
        match &mut self.poll_fn {
            Some(callback) => callback(progress),
            None => false,
        }
    }
}

impl Drop for Loader<'_> {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        // Quiet cleanup; no callback fires on an abandoned handle.
        let builds = mem::take(&mut self.dests);
        let dest_ids: Vec<TableId> = builds.iter().map(|b| b.table_id).collect();
        drop(builds);
        self.empty_redirect_all(&dest_ids);
        self.engine.metrics().loader_aborted();
        tracing::warn!("Loader for txn {} dropped without close or abort", self.txn);
    }
}

impl std::fmt::Debug for Loader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("txn", &self.txn)
            .field("destinations", &self.dests.len())
            .field("rows_fed", &self.rows_fed)
            .field("failed", &self.failure.is_some())
            .finish_non_exhaustive()
    }
}
