//! Transaction snapshots.
//!
//! A snapshot is the triple `(snap_min, snap_max, concurrent ids)`:
//! ids below the minimum were resolved before the snapshot; ids at or
//! above the maximum hadn't been allocated; in between, an id is
//! invisible exactly when it was in flight at snapshot time.

use crate::global::{TXN_ABORTED, TXN_NONE};
use smallvec::SmallVec;

/// One transaction's view of the id space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotData {
    /// Ids below this are visible
    pub snap_min: u64,
    /// Ids at or above this are invisible
    pub snap_max: u64,
    /// In-flight ids at snapshot time, sorted
    ids: SmallVec<[u64; 8]>,
}

impl SnapshotData {
    /// Build a snapshot; `ids` must be sorted.
    pub fn new(snap_min: u64, snap_max: u64, ids: SmallVec<[u64; 8]>) -> Self {
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]));
        SnapshotData {
            snap_min,
            snap_max,
            ids,
        }
    }

    /// Whether `id` was in flight at snapshot time.
    pub fn contains(&self, id: u64) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Whether no ids were in flight.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The in-flight ids, sorted.
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    /// Core visibility rule, without the own-transaction special case.
    pub fn visible(&self, id: u64) -> bool {
        if id == TXN_NONE {
            return true;
        }
        if id == TXN_ABORTED || id >= self.snap_max {
            return false;
        }
        if id < self.snap_min {
            return true;
        }
        !self.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn snap(min: u64, max: u64, ids: &[u64]) -> SnapshotData {
        SnapshotData::new(min, max, SmallVec::from_slice(ids))
    }

    #[test]
    fn test_visibility_rules() {
        let s = snap(10, 13, &[10, 11]);

        assert!(s.visible(TXN_NONE), "no-id updates are always visible");
        assert!(!s.visible(TXN_ABORTED));
        assert!(s.visible(9), "below snap_min");
        assert!(!s.visible(10), "in flight at snapshot time");
        assert!(!s.visible(11), "in flight at snapshot time");
        assert!(s.visible(12), "committed between min and max");
        assert!(!s.visible(13), "at snap_max");
        assert!(!s.visible(14), "after snap_max");
    }

    #[test]
    fn test_empty_snapshot() {
        let s = snap(5, 5, &[]);
        assert!(s.is_empty());
        assert!(s.visible(4));
        assert!(!s.visible(5));
    }

    #[test]
    fn test_contains_uses_exact_membership() {
        let s: SnapshotData = SnapshotData::new(3, 9, smallvec![3, 5, 7]);
        assert!(s.contains(5));
        assert!(!s.contains(4));
        assert!(s.visible(4));
        assert!(!s.visible(5));
    }
}
