//! Undo-do replay of one source row.
//!
//! A destination build cannot simply copy the resolved value of a row:
//! at scan time the row may carry provisional versions from in-flight
//! transactions, and the destination must end up with the same
//! committed-versus-provisional structure so those transactions resolve
//! it the same way they resolve the source. The replayer turns one row
//! snapshot plus the owner states captured with it into the operation
//! sequence that reproduces that structure on an empty destination row.
//!
//! Owner states are the ones captured under the manager freeze, never
//! re-queried: a transaction resolving between two looks would otherwise
//! yield a half-replayed row.

use std::collections::HashMap;

use kiln_common::types::{CommitSeq, Key, TxnId, Value};
use kiln_store::version::{RowSnapshot, VersionOp};
use kiln_txn::manager::TxnState;

/// One operation to apply to a destination store.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ReplayStep {
    /// A committed baseline insert carrying the source's commit sequence.
    Committed {
        /// Generated destination key.
        key: Key,
        /// Generated destination value.
        value: Value,
        /// Commit sequence of the surviving source version.
        seq: CommitSeq,
    },
    /// A provisional operation owned by an in-flight transaction.
    ///
    /// The caller appends it to the destination chain and adopts it into
    /// the owner's write set.
    Provisional {
        /// Generated destination key.
        key: Key,
        /// Insert or delete, with the generated value.
        op: VersionOp,
        /// The owning transaction.
        owner: TxnId,
    },
}

/// Replays one row against one destination.
///
/// `generate` is the row generator pre-bound to the destination; it is
/// called once per emitted operation. A provisional delete addresses
/// the destination row generated from the value it removes; a delete
/// with nothing to remove emits nothing.
pub(crate) fn replay_row(
    row: &RowSnapshot,
    states: &HashMap<TxnId, TxnState>,
    mut generate: impl FnMut(&Key, &Value) -> (Key, Value),
) -> Vec<ReplayStep> {
    let mut steps = Vec::new();

    // Committed baseline: last write wins across the committed prefix,
    // which the snapshot has already resolved.
    let mut current = row.resolved.clone();
    if let (Some(value), Some(seq)) = (&row.resolved, row.last_seq) {
        let (key, value) = generate(&row.key, value);
        steps.push(ReplayStep::Committed { key, value, seq });
    }

    for version in &row.provisional {
        let state = states
            .get(&version.owner)
            .copied()
            .unwrap_or(TxnState::Retired);
        if state.is_retired() {
            continue;
        }
        match &version.op {
            VersionOp::Insert(value) => {
                let (key, generated) = generate(&row.key, value);
                steps.push(ReplayStep::Provisional {
                    key,
                    op: VersionOp::Insert(generated),
                    owner: version.owner,
                });
                current = Some(value.clone());
            }
            VersionOp::Delete => {
                let Some(deleted) = &current else {
                    continue;
                };
                let (key, _) = generate(&row.key, deleted);
                steps.push(ReplayStep::Provisional {
                    key,
                    op: VersionOp::Delete,
                    owner: version.owner,
                });
                current = None;
            }
        }
    }

    steps
}
