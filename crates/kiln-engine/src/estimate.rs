//! The build loop's published scan position.
//!
//! After finishing a row, the build loop publishes its key here as a
//! boundary: the scan will not process anything at or before that key
//! again. Writers consult the boundary without touching the scan lock,
//! so the common far-from-cursor case costs one short mutex.

use kiln_common::types::Key;
use parking_lot::Mutex;

/// A conservative, lock-cheap view of how far a scan has progressed.
///
/// Only the build loop publishes. The boundary is published after the
/// scan lock is released, so it may trail the precise position; it
/// never runs ahead of it.
#[derive(Debug, Default)]
pub struct PositionEstimate {
    boundary: Mutex<Option<Key>>,
}

impl PositionEstimate {
    /// Creates an unset estimate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a new boundary key.
    pub fn publish(&self, key: Key) {
        *self.boundary.lock() = Some(key);
    }

    /// Returns true only if the scan has provably finished with `key`.
    ///
    /// Any uncertainty, including an unset estimate, reads as `false`
    /// and sends the caller to the precise check.
    #[must_use]
    pub fn definitely_passed(&self, key: &Key) -> bool {
        match self.boundary.lock().as_ref() {
            Some(boundary) => key <= boundary,
            None => false,
        }
    }

    /// Returns the current boundary, if one has been published.
    #[must_use]
    pub fn boundary(&self) -> Option<Key> {
        self.boundary.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Key {
        Key::from_str(s)
    }

    #[test]
    fn test_unset_estimate_proves_nothing() {
        let estimate = PositionEstimate::new();
        assert!(!estimate.definitely_passed(&key("a")));
        assert!(estimate.boundary().is_none());
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let estimate = PositionEstimate::new();
        estimate.publish(key("m"));

        assert!(estimate.definitely_passed(&key("a")));
        assert!(estimate.definitely_passed(&key("m")));
        assert!(!estimate.definitely_passed(&key("n")));
    }

    #[test]
    fn test_publish_moves_boundary_forward() {
        let estimate = PositionEstimate::new();
        estimate.publish(key("e"));
        estimate.publish(key("t"));

        assert!(estimate.definitely_passed(&key("s")));
        assert_eq!(estimate.boundary(), Some(key("t")));
    }
}
