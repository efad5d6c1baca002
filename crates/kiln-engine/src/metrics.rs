//! Build activity counters.
//!
//! One [`BuildMetrics`] instance is owned by the engine and shared with
//! every loader and indexer handle it creates. All counters are
//! monotonic except the two `*_live` gauges, which track the number of
//! currently open handles.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for loader and indexer activity.
#[derive(Debug, Default)]
pub struct BuildMetrics {
    /// Loaders successfully created.
    pub loader_creations: AtomicU64,
    /// Loader creations that failed a precondition.
    pub loader_creation_failures: AtomicU64,
    /// Rows accepted by `Loader::put`.
    pub loader_puts: AtomicU64,
    /// Rows rejected by `Loader::put`.
    pub loader_put_failures: AtomicU64,
    /// Loaders closed successfully.
    pub loader_closes: AtomicU64,
    /// Loaders whose close returned an error.
    pub loader_close_failures: AtomicU64,
    /// Loaders aborted (explicitly or by drop).
    pub loader_aborts: AtomicU64,
    /// Loaders currently open.
    pub loaders_live: AtomicU64,
    /// High-water mark of concurrently open loaders.
    pub loaders_max_live: AtomicU64,

    /// Indexers successfully created.
    pub indexer_creations: AtomicU64,
    /// Indexer creations that failed a precondition.
    pub indexer_creation_failures: AtomicU64,
    /// Builds that ran to end of cursor.
    pub indexer_builds: AtomicU64,
    /// Builds that stopped with an error or cancellation.
    pub indexer_build_failures: AtomicU64,
    /// Indexers closed successfully.
    pub indexer_closes: AtomicU64,
    /// Indexers aborted (explicitly or by drop).
    pub indexer_aborts: AtomicU64,
    /// Indexers currently open.
    pub indexers_live: AtomicU64,
    /// High-water mark of concurrently open indexers.
    pub indexers_max_live: AtomicU64,
}

impl BuildMetrics {
    /// Creates a zeroed metrics block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn loader_opened(&self) {
        self.loader_creations.fetch_add(1, Ordering::Relaxed);
        let live = self.loaders_live.fetch_add(1, Ordering::Relaxed) + 1;
        self.loaders_max_live.fetch_max(live, Ordering::Relaxed);
    }

    pub(crate) fn loader_open_failed(&self) {
        self.loader_creation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn loader_put(&self) {
        self.loader_puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn loader_put_failed(&self) {
        self.loader_put_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn loader_closed(&self) {
        self.loader_closes.fetch_add(1, Ordering::Relaxed);
        self.loaders_live.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn loader_close_failed(&self) {
        self.loader_close_failures.fetch_add(1, Ordering::Relaxed);
        self.loaders_live.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn loader_aborted(&self) {
        self.loader_aborts.fetch_add(1, Ordering::Relaxed);
        self.loaders_live.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn indexer_opened(&self) {
        self.indexer_creations.fetch_add(1, Ordering::Relaxed);
        let live = self.indexers_live.fetch_add(1, Ordering::Relaxed) + 1;
        self.indexers_max_live.fetch_max(live, Ordering::Relaxed);
    }

    pub(crate) fn indexer_open_failed(&self) {
        self.indexer_creation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn indexer_built(&self) {
        self.indexer_builds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn indexer_build_failed(&self) {
        self.indexer_build_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn indexer_closed(&self) {
        self.indexer_closes.fetch_add(1, Ordering::Relaxed);
        self.indexers_live.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn indexer_aborted(&self) {
        self.indexer_aborts.fetch_add(1, Ordering::Relaxed);
        self.indexers_live.fetch_sub(1, Ordering::Relaxed);
    }
}
