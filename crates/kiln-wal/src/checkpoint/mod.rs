//! Checkpointing over the recovery log.
//!
//! A checkpoint brackets a full flush of committed state with begin
//! and end records. The begin record lists the transactions live at
//! the time; the flush itself is a closure supplied by the caller,
//! which keeps this module free of any table knowledge. Once the end
//! record is durable, recovery can start from the checkpoint instead
//! of the beginning of the log.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use kiln_common::types::{Lsn, TxnId};

use crate::error::{WalError, WalResult};
use crate::log::RecoveryLog;

/// Checkpoint state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    /// No checkpoint in progress.
    Idle,
    /// Checkpoint is starting.
    Starting,
    /// The flush closure is running.
    Flushing,
    /// Checkpoint is completing.
    Completing,
}

/// Information about a completed checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointInfo {
    /// LSN of the checkpoint begin record.
    pub begin_lsn: Lsn,
    /// LSN of the checkpoint end record.
    pub end_lsn: Lsn,
    /// Transactions live when the checkpoint began.
    pub live_txns: usize,
    /// Tables flushed by the flush closure.
    pub tables_flushed: u64,
    /// Time taken to complete the checkpoint.
    pub duration: Duration,
}

/// Statistics about checkpointing.
#[derive(Debug, Default)]
pub struct CheckpointStats {
    /// Checkpoints completed.
    pub completed: AtomicU64,
    /// Checkpoints that failed partway.
    pub failed: AtomicU64,
}

impl CheckpointStats {
    /// Creates new stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Coordinates checkpoint runs against a recovery log.
pub struct CheckpointManager {
    /// Current state.
    state: Mutex<CheckpointState>,
    /// Last completed checkpoint.
    last_checkpoint: Mutex<Option<CheckpointInfo>>,
    /// Statistics.
    stats: CheckpointStats,
}

impl CheckpointManager {
    /// Creates a new checkpoint manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CheckpointState::Idle),
            last_checkpoint: Mutex::new(None),
            stats: CheckpointStats::new(),
        }
    }

    /// Returns the current checkpoint state.
    pub fn state(&self) -> CheckpointState {
        *self.state.lock()
    }

    /// Returns true if a checkpoint is in progress.
    pub fn is_in_progress(&self) -> bool {
        *self.state.lock() != CheckpointState::Idle
    }

    /// Returns the last completed checkpoint info.
    pub fn last_checkpoint(&self) -> Option<CheckpointInfo> {
        self.last_checkpoint.lock().clone()
    }

    /// Returns statistics about checkpointing.
    #[must_use]
    pub const fn stats(&self) -> &CheckpointStats {
        &self.stats
    }

    /// Runs one checkpoint.
    ///
    /// Writes the begin record with the live transactions, invokes
    /// the flush closure (which reports how many tables it flushed),
    /// then writes and syncs the end record. The state returns to
    /// idle whether the run succeeds or fails.
    pub fn run<T, F>(&self, log: &RecoveryLog, live_txns: T, flush: F) -> WalResult<CheckpointInfo>
    where
        T: FnOnce() -> Vec<TxnId>,
        F: FnOnce() -> WalResult<u64>,
    {
        {
            let mut state = self.state.lock();
            if *state != CheckpointState::Idle {
                return Err(WalError::config_error("checkpoint already in progress"));
            }
            *state = CheckpointState::Starting;
        }

        let result = self.run_phases(log, live_txns, flush);
        *self.state.lock() = CheckpointState::Idle;

        match &result {
            Ok(info) => {
                self.stats.completed.fetch_add(1, AtomicOrdering::Relaxed);
                *self.last_checkpoint.lock() = Some(info.clone());
            }
            Err(_) => {
                self.stats.failed.fetch_add(1, AtomicOrdering::Relaxed);
            }
        }
        result
    }

    fn run_phases<T, F>(
        &self,
        log: &RecoveryLog,
        live_txns: T,
        flush: F,
    ) -> WalResult<CheckpointInfo>
    where
        T: FnOnce() -> Vec<TxnId>,
        F: FnOnce() -> WalResult<u64>,
    {
        let start = Instant::now();

        let txns = live_txns();
        let live_count = txns.len();
        let begin_lsn = log.append_checkpoint_begin(txns)?;

        *self.state.lock() = CheckpointState::Flushing;
        let tables_flushed = flush()?;

        *self.state.lock() = CheckpointState::Completing;
        let end_lsn = log.append_checkpoint_end()?;

        Ok(CheckpointInfo {
            begin_lsn,
            end_lsn,
            live_txns: live_count,
            tables_flushed,
            duration: start.elapsed(),
        })
    }
}

impl Default for CheckpointManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("state", &self.state())
            .finish()
    }
}
