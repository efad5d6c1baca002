//! Row generation for destination builds.
//!
//! A [`RowGenerator`] derives the row a destination receives from a
//! source row. The loader fan-out, the build loop's replay, and the
//! multi-table write path all go through the same generator, which is
//! what keeps a destination equal to a deterministic transform of its
//! source no matter which path delivered a row.

use kiln_common::types::{Key, TableId, Value};

/// Derives a destination row from a source row.
///
/// Implementations must be pure: the same inputs always produce the
/// same output pair. The generated key addresses the destination row,
/// so a value-dependent key turns updates into insert/delete pairs at
/// different destination keys.
pub trait RowGenerator: Send + Sync {
    /// Returns the row `dest` receives for the source row `(key, value)`.
    fn generate(&self, dest: TableId, dest_index: usize, key: &Key, value: &Value) -> (Key, Value);
}

/// Copies source rows through unchanged.
///
/// This is the generator an engine uses unless one is supplied at
/// construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityGenerator;

impl RowGenerator for IdentityGenerator {
    fn generate(
        &self,
        _dest: TableId,
        _dest_index: usize,
        key: &Key,
        value: &Value,
    ) -> (Key, Value) {
        (key.clone(), value.clone())
    }
}
