//! Version chain storage for multi-version rows.
//!
//! Each row holds a chain of versions split into two regions:
//! - a committed prefix, ordered by commit sequence
//! - a provisional suffix, in the order writes were applied
//!
//! A reader resolves a row by looking at the last committed version only.
//! Provisional versions become committed (or disappear) when their owning
//! transaction commits (or aborts).
//!
//! # Chain Structure
//!
//! ```text
//! Row Key: "user:1"
//! ┌─────────────────────────────────────────────────────┐
//! │ committed prefix (by commit sequence)                │
//! │   insert "Alice"        seq: 10, txn: 1              │
//! │   delete                seq: 15, txn: 3              │
//! │   insert "Alice v2"     seq: 20, txn: 4   <- resolved│
//! ├─────────────────────────────────────────────────────┤
//! │ provisional suffix (append order)                    │
//! │   insert "Alice v3"     owner: txn 7                 │
//! │   delete                owner: txn 9                 │
//! └─────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use kiln_common::types::{CommitSeq, Key, TxnId, Value, VersionId};

/// The operation a version records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionOp {
    /// The row exists with this value.
    Insert(Value),
    /// The row was deleted.
    Delete,
}

impl VersionOp {
    /// Returns true if this operation is a delete.
    #[inline]
    #[must_use]
    pub const fn is_delete(&self) -> bool {
        matches!(self, Self::Delete)
    }

    /// Returns the inserted value, if any.
    #[inline]
    #[must_use]
    pub const fn value(&self) -> Option<&Value> {
        match self {
            Self::Insert(value) => Some(value),
            Self::Delete => None,
        }
    }
}

/// The state of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionState {
    /// Owned by a live or preparing transaction.
    Provisional,
    /// Committed at the given sequence.
    Committed(CommitSeq),
}

/// A single version of a row.
#[derive(Debug, Clone)]
pub struct RowVersion {
    /// Unique identifier for this version.
    pub id: VersionId,
    /// Transaction that created this version.
    ///
    /// `TxnId::INVALID` for baseline versions installed by a replay,
    /// whose original writer is no longer known.
    pub created_by: TxnId,
    /// The recorded operation.
    pub op: VersionOp,
    /// Current state of the version.
    pub state: VersionState,
}

impl RowVersion {
    /// Creates a provisional version owned by `created_by`.
    #[must_use]
    pub const fn provisional(id: VersionId, created_by: TxnId, op: VersionOp) -> Self {
        Self {
            id,
            created_by,
            op,
            state: VersionState::Provisional,
        }
    }

    /// Creates a committed version at the given sequence.
    #[must_use]
    pub const fn committed(id: VersionId, created_by: TxnId, seq: CommitSeq, op: VersionOp) -> Self {
        Self {
            id,
            created_by,
            op,
            state: VersionState::Committed(seq),
        }
    }

    /// Returns true if this version is provisional.
    #[inline]
    #[must_use]
    pub const fn is_provisional(&self) -> bool {
        matches!(self.state, VersionState::Provisional)
    }

    /// Returns the commit sequence, if committed.
    #[inline]
    #[must_use]
    pub const fn commit_seq(&self) -> Option<CommitSeq> {
        match self.state {
            VersionState::Committed(seq) => Some(seq),
            VersionState::Provisional => None,
        }
    }

    /// Marks this version as committed at the given sequence.
    pub fn commit(&mut self, seq: CommitSeq) {
        self.state = VersionState::Committed(seq);
    }

    /// Returns the size of this version in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        let payload = match &self.op {
            VersionOp::Insert(value) => value.len(),
            VersionOp::Delete => 0,
        };
        std::mem::size_of::<Self>() + payload
    }
}

/// A provisional version as seen in a row snapshot.
#[derive(Debug, Clone)]
pub struct ProvisionalVersion {
    /// The version's identifier.
    pub id: VersionId,
    /// The owning transaction.
    pub owner: TxnId,
    /// The recorded operation.
    pub op: VersionOp,
}

/// A point-in-time copy of one row.
///
/// Snapshots are what cursors hand out: the resolved committed value
/// plus every provisional version with its owner, in append order.
#[derive(Debug, Clone)]
pub struct RowSnapshot {
    /// The row key.
    pub key: Key,
    /// The resolved committed value (`None` if absent or deleted).
    pub resolved: Option<Value>,
    /// Commit sequence of the last committed version, if any.
    pub last_seq: Option<CommitSeq>,
    /// Provisional versions in append order.
    pub provisional: Vec<ProvisionalVersion>,
}

impl RowSnapshot {
    /// Returns true if the snapshot carries provisional versions.
    #[inline]
    #[must_use]
    pub fn has_provisional(&self) -> bool {
        !self.provisional.is_empty()
    }
}

/// A chain of versions for a single row.
///
/// Chains are plain data; the owning table store serializes access.
#[derive(Debug, Default)]
pub struct VersionChain {
    /// All versions. The first `committed_len` entries are the committed
    /// prefix ordered by commit sequence; the rest are the provisional
    /// suffix in append order.
    versions: Vec<RowVersion>,
    committed_len: usize,
}

impl VersionChain {
    /// Creates a new empty chain.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            versions: Vec::new(),
            committed_len: 0,
        }
    }

    /// Returns the number of versions in the chain.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Returns true if the chain has no versions at all.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Returns the committed prefix.
    #[inline]
    #[must_use]
    pub fn committed(&self) -> &[RowVersion] {
        &self.versions[..self.committed_len]
    }

    /// Returns the provisional suffix.
    #[inline]
    #[must_use]
    pub fn provisional(&self) -> &[RowVersion] {
        &self.versions[self.committed_len..]
    }

    /// Returns true if the chain has provisional versions.
    #[inline]
    #[must_use]
    pub fn has_provisional(&self) -> bool {
        self.committed_len < self.versions.len()
    }

    /// Appends a provisional version to the suffix.
    pub fn append_provisional(&mut self, version: RowVersion) {
        debug_assert!(version.is_provisional());
        self.versions.push(version);
    }

    /// Inserts a committed version into the prefix, keeping it ordered
    /// by commit sequence. Versions with equal sequences keep their
    /// insertion order.
    pub fn insert_committed(&mut self, id: VersionId, created_by: TxnId, seq: CommitSeq, op: VersionOp) {
        let pos = self.versions[..self.committed_len]
            .partition_point(|v| v.commit_seq().is_some_and(|s| s <= seq));
        self.versions
            .insert(pos, RowVersion::committed(id, created_by, seq, op));
        self.committed_len += 1;
    }

    /// Moves every provisional version owned by `txn` into the committed
    /// prefix at sequence `seq`, preserving their relative order.
    ///
    /// Returns the number of versions committed.
    pub fn commit_owned(&mut self, txn: TxnId, seq: CommitSeq) -> usize {
        if !self.has_provisional() {
            return 0;
        }
        let suffix = self.versions.split_off(self.committed_len);
        let mut moved = 0;
        let mut rest = Vec::with_capacity(suffix.len());
        for mut version in suffix {
            if version.created_by == txn {
                version.commit(seq);
                self.versions.push(version);
                self.committed_len += 1;
                moved += 1;
            } else {
                rest.push(version);
            }
        }
        self.versions.extend(rest);
        moved
    }

    /// Removes every provisional version owned by `txn`.
    ///
    /// Returns the number of versions removed.
    pub fn abort_owned(&mut self, txn: TxnId) -> usize {
        let before = self.versions.len();
        let committed_len = self.committed_len;
        let mut idx = 0;
        self.versions.retain(|v| {
            let keep = idx < committed_len || v.created_by != txn;
            idx += 1;
            keep
        });
        before - self.versions.len()
    }

    /// Returns the resolved committed value of this row.
    ///
    /// The last committed version wins: an insert resolves to its value,
    /// a delete (or an empty prefix) resolves to `None`.
    #[must_use]
    pub fn resolved(&self) -> Option<&Value> {
        self.committed().last().and_then(|v| v.op.value())
    }

    /// Returns the commit sequence of the last committed version.
    #[must_use]
    pub fn last_committed_seq(&self) -> Option<CommitSeq> {
        self.committed().last().and_then(RowVersion::commit_seq)
    }

    /// Takes a point-in-time copy of this chain for the given key.
    #[must_use]
    pub fn snapshot(&self, key: Key) -> RowSnapshot {
        RowSnapshot {
            key,
            resolved: self.resolved().cloned(),
            last_seq: self.last_committed_seq(),
            provisional: self
                .provisional()
                .iter()
                .map(|v| ProvisionalVersion {
                    id: v.id,
                    owner: v.created_by,
                    op: v.op.clone(),
                })
                .collect(),
        }
    }

    /// Returns the total size of all versions in bytes.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.versions.iter().map(RowVersion::size).sum()
    }
}

/// Version ID generator.
#[derive(Debug)]
pub struct VersionIdGenerator {
    next_id: AtomicU64,
}

impl VersionIdGenerator {
    /// Creates a new generator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Generates the next version ID.
    pub fn next(&self) -> VersionId {
        VersionId::new(self.next_id.fetch_add(1, AtomicOrdering::SeqCst))
    }
}

impl Default for VersionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(v: &str) -> VersionOp {
        VersionOp::Insert(Value::from_str(v))
    }

    #[test]
    fn test_version_op() {
        let op = insert("data");
        assert!(!op.is_delete());
        assert_eq!(op.value().map(Value::as_bytes), Some(&b"data"[..]));
        assert!(VersionOp::Delete.is_delete());
        assert!(VersionOp::Delete.value().is_none());
    }

    #[test]
    fn test_empty_chain_resolves_to_none() {
        let chain = VersionChain::new();
        assert!(chain.resolved().is_none());
        assert!(chain.last_committed_seq().is_none());
        assert!(!chain.has_provisional());
    }

    #[test]
    fn test_provisional_not_visible() {
        let mut chain = VersionChain::new();
        chain.append_provisional(RowVersion::provisional(
            VersionId::new(1),
            TxnId::new(7),
            insert("pending"),
        ));

        assert!(chain.resolved().is_none());
        assert!(chain.has_provisional());
        assert_eq!(chain.provisional().len(), 1);
    }

    #[test]
    fn test_commit_moves_to_prefix() {
        let mut chain = VersionChain::new();
        chain.append_provisional(RowVersion::provisional(
            VersionId::new(1),
            TxnId::new(7),
            insert("v1"),
        ));

        let moved = chain.commit_owned(TxnId::new(7), CommitSeq::new(10));
        assert_eq!(moved, 1);
        assert!(!chain.has_provisional());
        assert_eq!(
            chain.resolved().map(Value::as_bytes),
            Some(&b"v1"[..])
        );
        assert_eq!(chain.last_committed_seq(), Some(CommitSeq::new(10)));
    }

    #[test]
    fn test_abort_removes_owned_only() {
        let mut chain = VersionChain::new();
        chain.append_provisional(RowVersion::provisional(
            VersionId::new(1),
            TxnId::new(7),
            insert("mine"),
        ));
        chain.append_provisional(RowVersion::provisional(
            VersionId::new(2),
            TxnId::new(8),
            insert("theirs"),
        ));

        let removed = chain.abort_owned(TxnId::new(7));
        assert_eq!(removed, 1);
        assert_eq!(chain.provisional().len(), 1);
        assert_eq!(chain.provisional()[0].created_by, TxnId::new(8));
    }

    #[test]
    fn test_commit_preserves_suffix_order() {
        let mut chain = VersionChain::new();
        // Interleaved owners: 7, 8, 7
        chain.append_provisional(RowVersion::provisional(
            VersionId::new(1),
            TxnId::new(7),
            insert("a"),
        ));
        chain.append_provisional(RowVersion::provisional(
            VersionId::new(2),
            TxnId::new(8),
            VersionOp::Delete,
        ));
        chain.append_provisional(RowVersion::provisional(
            VersionId::new(3),
            TxnId::new(7),
            insert("b"),
        ));

        let moved = chain.commit_owned(TxnId::new(7), CommitSeq::new(5));
        assert_eq!(moved, 2);

        // Txn 7's versions keep their relative order in the prefix
        let committed: Vec<_> = chain.committed().iter().map(|v| v.id).collect();
        assert_eq!(committed, vec![VersionId::new(1), VersionId::new(3)]);

        // Txn 8's version is still pending
        assert_eq!(chain.provisional().len(), 1);
        assert_eq!(chain.provisional()[0].id, VersionId::new(2));

        // Last committed version wins
        assert_eq!(chain.resolved().map(Value::as_bytes), Some(&b"b"[..]));
    }

    #[test]
    fn test_delete_resolves_to_none() {
        let mut chain = VersionChain::new();
        chain.append_provisional(RowVersion::provisional(
            VersionId::new(1),
            TxnId::new(7),
            insert("v1"),
        ));
        chain.append_provisional(RowVersion::provisional(
            VersionId::new(2),
            TxnId::new(7),
            VersionOp::Delete,
        ));
        chain.commit_owned(TxnId::new(7), CommitSeq::new(3));

        assert!(chain.resolved().is_none());
        assert_eq!(chain.last_committed_seq(), Some(CommitSeq::new(3)));
    }

    #[test]
    fn test_insert_committed_ordering() {
        let mut chain = VersionChain::new();
        chain.append_provisional(RowVersion::provisional(
            VersionId::new(1),
            TxnId::new(9),
            insert("newer"),
        ));
        chain.commit_owned(TxnId::new(9), CommitSeq::new(20));

        // A baseline from sequence 10 lands before the sequence-20 version
        chain.insert_committed(
            VersionId::new(2),
            TxnId::INVALID,
            CommitSeq::new(10),
            insert("baseline"),
        );

        assert_eq!(chain.committed().len(), 2);
        assert_eq!(chain.committed()[0].id, VersionId::new(2));
        assert_eq!(chain.resolved().map(Value::as_bytes), Some(&b"newer"[..]));
    }

    #[test]
    fn test_snapshot() {
        let mut chain = VersionChain::new();
        chain.append_provisional(RowVersion::provisional(
            VersionId::new(1),
            TxnId::new(7),
            insert("v1"),
        ));
        chain.commit_owned(TxnId::new(7), CommitSeq::new(4));
        chain.append_provisional(RowVersion::provisional(
            VersionId::new(2),
            TxnId::new(8),
            VersionOp::Delete,
        ));

        let snap = chain.snapshot(Key::from_str("k"));
        assert_eq!(snap.resolved.as_ref().map(|v| v.as_bytes()), Some(&b"v1"[..]));
        assert_eq!(snap.last_seq, Some(CommitSeq::new(4)));
        assert_eq!(snap.provisional.len(), 1);
        assert_eq!(snap.provisional[0].owner, TxnId::new(8));
        assert!(snap.has_provisional());
    }

    #[test]
    fn test_version_id_generator() {
        let gen = VersionIdGenerator::new();
        assert_eq!(gen.next().as_u64(), 1);
        assert_eq!(gen.next().as_u64(), 2);
        assert_eq!(gen.next().as_u64(), 3);
    }
}
