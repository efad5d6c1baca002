//! The table directory: which file backs which table.
//!
//! A table keeps its identity across rebuilds; only its binding (the
//! backing file and the in-memory store of that file's content) moves.
//! Redirects performed inside a transaction are recorded as undo
//! entries. Aborting the transaction restores the previous bindings in
//! reverse order; committing discards the undo entries. Files made
//! unreachable either way are reported back so the engine can unlink
//! them after the decision is durable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use kiln_common::error::{KilnError, KilnResult};
use kiln_common::types::{FileId, TableId, TxnId};

use crate::table::TableStore;

/// A table's current binding.
#[derive(Debug, Clone)]
pub struct TableBinding {
    /// The backing file.
    pub file_id: FileId,
    /// The in-memory content of the backing file.
    pub store: Arc<TableStore>,
}

/// One recorded redirect, undoable until its transaction commits.
#[derive(Debug)]
struct RedirectUndo {
    table_id: TableId,
    previous: TableBinding,
    installed_file: FileId,
}

/// Maps tables to their backing files and tracks in-flight redirects.
#[derive(Debug, Default)]
pub struct TableDirectory {
    bindings: RwLock<HashMap<TableId, TableBinding>>,
    files: RwLock<HashMap<FileId, PathBuf>>,
    undo: Mutex<HashMap<TxnId, Vec<RedirectUndo>>>,
}

impl TableDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records where a file lives on disk.
    pub fn register_file(&self, file_id: FileId, path: PathBuf) {
        self.files.write().insert(file_id, path);
    }

    /// Returns the path of a registered file.
    #[must_use]
    pub fn path_of(&self, file_id: FileId) -> Option<PathBuf> {
        self.files.read().get(&file_id).cloned()
    }

    /// Forgets a file and returns its path, if it was registered.
    pub fn deregister_file(&self, file_id: FileId) -> Option<PathBuf> {
        self.files.write().remove(&file_id)
    }

    /// Installs a table's initial binding.
    pub fn bind(&self, table_id: TableId, binding: TableBinding) {
        self.bindings.write().insert(table_id, binding);
    }

    /// Returns a table's current binding.
    #[must_use]
    pub fn binding_of(&self, table_id: TableId) -> Option<TableBinding> {
        self.bindings.read().get(&table_id).cloned()
    }

    /// Returns a table's current store.
    #[must_use]
    pub fn store_of(&self, table_id: TableId) -> Option<Arc<TableStore>> {
        self.bindings
            .read()
            .get(&table_id)
            .map(|b| Arc::clone(&b.store))
    }

    /// Returns true if the table exists.
    #[must_use]
    pub fn table_exists(&self, table_id: TableId) -> bool {
        self.bindings.read().contains_key(&table_id)
    }

    /// Returns all known table IDs.
    #[must_use]
    pub fn table_ids(&self) -> Vec<TableId> {
        self.bindings.read().keys().copied().collect()
    }

    /// Atomically swaps a table's binding, remembering the previous one
    /// under `txn` so the swap can be undone.
    pub fn redirect(
        &self,
        table_id: TableId,
        txn: TxnId,
        new_file: FileId,
        new_store: Arc<TableStore>,
    ) -> KilnResult<()> {
        let mut bindings = self.bindings.write();
        let Some(current) = bindings.get_mut(&table_id) else {
            return Err(KilnError::TableNotFound { table_id });
        };
        let previous = current.clone();
        *current = TableBinding {
            file_id: new_file,
            store: new_store,
        };
        drop(bindings);

        self.undo.lock().entry(txn).or_default().push(RedirectUndo {
            table_id,
            previous,
            installed_file: new_file,
        });
        Ok(())
    }

    /// Undoes every redirect performed by `txn`, newest first.
    ///
    /// Returns the paths of the files the redirects had installed; they
    /// are unreachable now and the caller should unlink them.
    pub fn rollback(&self, txn: TxnId) -> Vec<PathBuf> {
        let Some(undos) = self.undo.lock().remove(&txn) else {
            return Vec::new();
        };
        let mut orphaned = Vec::new();
        let mut bindings = self.bindings.write();
        for undo in undos.into_iter().rev() {
            bindings.insert(undo.table_id, undo.previous);
            if let Some(path) = self.files.write().remove(&undo.installed_file) {
                orphaned.push(path);
            }
        }
        orphaned
    }

    /// Makes every redirect performed by `txn` permanent.
    ///
    /// Returns the paths of the replaced files; nothing references them
    /// any more and the caller should unlink them.
    pub fn finalize(&self, txn: TxnId) -> Vec<PathBuf> {
        let Some(undos) = self.undo.lock().remove(&txn) else {
            return Vec::new();
        };
        let mut replaced = Vec::new();
        for undo in undos {
            if let Some(path) = self.files.write().remove(&undo.previous.file_id) {
                replaced.push(path);
            }
        }
        replaced
    }

    /// Returns true if `txn` has redirects that are not yet resolved.
    #[must_use]
    pub fn has_pending_redirects(&self, txn: TxnId) -> bool {
        self.undo.lock().contains_key(&txn)
    }
}
