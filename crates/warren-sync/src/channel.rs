//! Versioned snapshot + incremental diff channel.
//!
//! A [`DiffChannel`] materializes one domain's state as a [`DiffSet`]: keys
//! that are present with a value, and keys explicitly removed (relevant when
//! the domain layers over a baseline, as voxels do). The version counter
//! imposes a total order on mutations. An increment is applied only if it
//! is exactly `current + 1`; anything newer is a gap and triggers a resync.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::domain::{ChannelOp, DiffOp};

/// Materialized adds and removes for one domain.
#[derive(Debug, Clone)]
pub struct DiffSet<K, V> {
    adds: FxHashMap<K, V>,
    removes: FxHashSet<K>,
}

impl<K, V> Default for DiffSet<K, V> {
    fn default() -> Self {
        Self {
            adds: FxHashMap::default(),
            removes: FxHashSet::default(),
        }
    }
}

/// State of a single key within a [`DiffSet`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellState<'a, V> {
    /// Present with a value.
    Added(&'a V),
    /// Explicitly removed.
    Removed,
    /// Not mentioned.
    Absent,
}

impl<K: Clone + Eq + std::hash::Hash, V: Clone> DiffSet<K, V> {
    /// Apply one op. An add clears a removal; a remove cancels a pending add
    /// without leaving a tombstone. A remove of an unknown key is recorded
    /// only when `tombstones` is set.
    pub fn apply(&mut self, op: DiffOp<K, V>, tombstones: bool) {
        match op {
            DiffOp::Add(key, value) => {
                self.removes.remove(&key);
                self.adds.insert(key, value);
            }
            DiffOp::Remove(key) => {
                if self.adds.remove(&key).is_none() && tombstones {
                    self.removes.insert(key);
                }
            }
        }
    }

    /// Look up one key.
    pub fn state(&self, key: &K) -> CellState<'_, V> {
        if let Some(value) = self.adds.get(key) {
            CellState::Added(value)
        } else if self.removes.contains(key) {
            CellState::Removed
        } else {
            CellState::Absent
        }
    }

    /// Present keys and their values.
    pub fn adds(&self) -> &FxHashMap<K, V> {
        &self.adds
    }

    /// Explicitly removed keys.
    pub fn removes(&self) -> &FxHashSet<K> {
        &self.removes
    }

    /// Every key mentioned, added or removed.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.adds.keys().chain(self.removes.iter())
    }

    /// Whether nothing is materialized.
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.adds.clear();
        self.removes.clear();
    }
}

/// Outcome of [`DiffChannel::apply_ops`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome<K> {
    /// The batch was applied; these keys may have changed.
    Applied(Vec<K>),
    /// Version at or below the current one; nothing changed.
    Stale,
    /// Version skipped ahead; nothing changed and a resync from `current`
    /// is needed.
    Gap {
        /// Version the channel is at.
        current: u64,
    },
}

/// Versioned diff state for one domain.
#[derive(Debug, Clone)]
pub struct DiffChannel<Op: ChannelOp> {
    version: u64,
    state: DiffSet<Op::Key, Op::Value>,
}

impl<Op: ChannelOp> Default for DiffChannel<Op> {
    fn default() -> Self {
        Self {
            version: 0,
            state: DiffSet::default(),
        }
    }
}

impl<Op: ChannelOp> DiffChannel<Op> {
    /// Create an empty channel at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last applied version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Materialized state.
    pub fn state(&self) -> &DiffSet<Op::Key, Op::Value> {
        &self.state
    }

    /// Authoritative reset: clear, apply every op, and take `version`
    /// unconditionally.
    ///
    /// Returns every key whose state may have changed, previous keys included.
    pub fn apply_snapshot(&mut self, version: u64, ops: &[Op]) -> Vec<Op::Key> {
        let mut touched: Vec<Op::Key> = self.state.keys().cloned().collect();
        self.state.clear();
        for op in ops {
            let diff = op.to_diff();
            touched.push(diff.key().clone());
            self.state.apply(diff, Op::OVER_BASELINE);
        }
        tracing::debug!(
            domain = %Op::DOMAIN,
            from = self.version,
            to = version,
            ops = ops.len(),
            "Applied snapshot"
        );
        self.version = version;
        touched
    }

    /// Apply an increment if it is exactly the next version.
    pub fn apply_ops(&mut self, version: u64, ops: &[Op]) -> ApplyOutcome<Op::Key> {
        if version <= self.version {
            tracing::trace!(domain = %Op::DOMAIN, version, current = self.version, "Stale ops");
            return ApplyOutcome::Stale;
        }
        if version != self.version + 1 {
            tracing::warn!(
                domain = %Op::DOMAIN,
                version,
                current = self.version,
                "Version gap, requesting resync"
            );
            return ApplyOutcome::Gap {
                current: self.version,
            };
        }

        let touched = self.apply_unversioned(ops);
        self.version = version;
        ApplyOutcome::Applied(touched)
    }

    /// Apply ops without touching the version (optimistic local edits).
    pub fn apply_unversioned(&mut self, ops: &[Op]) -> Vec<Op::Key> {
        ops.iter()
            .map(|op| {
                let diff = op.to_diff();
                let key = diff.key().clone();
                self.state.apply(diff, Op::OVER_BASELINE);
                key
            })
            .collect()
    }

    /// Back to version 0 with nothing materialized. Returns the keys that
    /// were present.
    pub fn reset(&mut self) -> Vec<Op::Key> {
        let touched = self.state.keys().cloned().collect();
        self.state.clear();
        self.version = 0;
        touched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ColumnKey, VoxelKey};
    use warren_net::{TileOp, VoxelKind, VoxelOp};

    fn add(gx: i32, gy: i32, y: i32) -> VoxelOp {
        VoxelOp::Add {
            gx,
            gy,
            y,
            t: VoxelKind::Normal,
        }
    }

    fn remove(gx: i32, gy: i32, y: i32) -> VoxelOp {
        VoxelOp::Remove { gx, gy, y }
    }

    #[test]
    fn test_snapshot_replaces_state_and_version() {
        let mut ch = DiffChannel::<VoxelOp>::new();
        ch.apply_snapshot(10, &[add(0, 0, 0), add(1, 0, 0)]);
        assert_eq!(ch.version(), 10);
        assert_eq!(ch.state().adds().len(), 2);

        // Lower version is still taken: snapshots are authoritative.
        let touched = ch.apply_snapshot(3, &[add(5, 5, 5)]);
        assert_eq!(ch.version(), 3);
        assert_eq!(ch.state().adds().len(), 1);
        assert!(touched.contains(&VoxelKey::new(0, 0, 0)), "old keys reported");
        assert!(touched.contains(&VoxelKey::new(5, 5, 5)));
    }

    #[test]
    fn test_stale_and_duplicate_ops_ignored() {
        let mut ch = DiffChannel::<VoxelOp>::new();
        ch.apply_snapshot(1, &[add(0, 0, 0)]);
        assert!(matches!(ch.apply_ops(2, &[remove(0, 0, 0)]), ApplyOutcome::Applied(_)));

        assert_eq!(ch.apply_ops(2, &[add(9, 9, 9)]), ApplyOutcome::Stale);
        assert_eq!(ch.apply_ops(1, &[add(9, 9, 9)]), ApplyOutcome::Stale);
        assert!(ch.state().is_empty(), "stale ops never mutate state");
        assert_eq!(ch.version(), 2);
    }

    #[test]
    fn test_gap_reports_current_and_drops_batch() {
        let mut ch = DiffChannel::<VoxelOp>::new();
        ch.apply_snapshot(4, &[]);
        assert_eq!(
            ch.apply_ops(6, &[add(1, 1, 1)]),
            ApplyOutcome::Gap { current: 4 }
        );
        assert!(ch.state().is_empty());
        assert_eq!(ch.version(), 4);
    }

    #[test]
    fn test_remove_cancels_pending_add_without_tombstone() {
        let mut ch = DiffChannel::<VoxelOp>::new();
        ch.apply_ops(1, &[add(2, 2, 2)]);
        ch.apply_ops(2, &[remove(2, 2, 2)]);
        assert!(ch.state().is_empty());
    }

    #[test]
    fn test_remove_of_unknown_key_is_recorded() {
        let mut ch = DiffChannel::<VoxelOp>::new();
        ch.apply_ops(1, &[remove(3, 3, 3)]);
        assert_eq!(ch.state().state(&VoxelKey::new(3, 3, 3)), CellState::Removed);

        ch.apply_ops(2, &[add(3, 3, 3)]);
        assert_eq!(
            ch.state().state(&VoxelKey::new(3, 3, 3)),
            CellState::Added(&VoxelKind::Normal)
        );
        assert!(ch.state().removes().is_empty());
    }

    #[test]
    fn test_domains_without_baseline_keep_no_tombstones() {
        let mut ch = DiffChannel::<TileOp>::new();
        for v in 1..=50u64 {
            ch.apply_ops(
                v,
                &[TileOp::Remove {
                    gx: v as i32,
                    gy: 0,
                }],
            );
        }
        assert_eq!(ch.version(), 50);
        assert!(ch.state().removes().is_empty());
        assert_eq!(
            ch.state().state(&ColumnKey::new(1, 0)),
            CellState::Absent
        );
    }

    #[test]
    fn test_unversioned_apply_keeps_version() {
        let mut ch = DiffChannel::<TileOp>::new();
        ch.apply_snapshot(7, &[]);
        ch.apply_unversioned(&[TileOp::Add {
            gx: 0,
            gy: 0,
            tile: 12,
        }]);
        assert_eq!(ch.version(), 7);
        assert_eq!(ch.state().adds().len(), 1);
        // The authoritative echo then applies on top.
        assert!(matches!(
            ch.apply_ops(
                8,
                &[TileOp::Add {
                    gx: 0,
                    gy: 0,
                    tile: 12
                }]
            ),
            ApplyOutcome::Applied(_)
        ));
        assert_eq!(ch.state().adds().len(), 1);
    }

    #[test]
    fn test_reset_returns_to_zero() {
        let mut ch = DiffChannel::<VoxelOp>::new();
        ch.apply_snapshot(12, &[add(0, 0, 0), remove(0, 0, 1)]);
        let touched = ch.reset();
        assert_eq!(touched.len(), 2);
        assert_eq!(ch.version(), 0);
        assert!(ch.state().is_empty());
        // First increment after reset is version 1.
        assert!(matches!(ch.apply_ops(1, &[]), ApplyOutcome::Applied(_)));
    }
}
