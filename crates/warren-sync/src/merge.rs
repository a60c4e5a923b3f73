//! World merge: flat per-cell voxel diffs to normalized per-column spans.
//!
//! Every column starts from the level's baseline spans. Removed cells are
//! carved out of the baseline as 1-unit slices, then added cells are grouped
//! into runs and layered on top:
//!
//! - solid cells (`Normal`, `Hazard`, `NoClimb`) merge into a run only while
//!   the type stays the same, and a new solid run splits any different-typed
//!   solid span it overlaps, so at most one solid type occupies a height;
//! - marker cells (`Fence`, `HazardFence`, `Portal`, `Lock`) form runs the
//!   same way but never interact with solids, so a fence may float through
//!   open space or share a height with a block;
//! - slabs are half-height and never merge with anything.
//!
//! Only columns touched by the current batch are rebuilt.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};
use warren_net::VoxelKind;

use crate::channel::{CellState, DiffSet};
use crate::domain::{ColumnKey, VoxelKey};

/// Height of a slab span.
pub const SLAB_HEIGHT: f32 = 0.5;

const EPSILON: f32 = 1e-4;

/// How a voxel type participates in merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanClass {
    /// Collidable block. Solid types are mutually exclusive per height.
    Solid,
    /// Pass-through marker, independent of solids.
    Marker,
    /// Half-height block, never merged.
    Slab,
}

/// Merge class of a voxel type.
pub fn classify(kind: VoxelKind) -> SpanClass {
    match kind {
        VoxelKind::Normal | VoxelKind::Hazard | VoxelKind::NoClimb => SpanClass::Solid,
        VoxelKind::Fence | VoxelKind::HazardFence | VoxelKind::Portal | VoxelKind::Lock => {
            SpanClass::Marker
        }
        VoxelKind::Slab => SpanClass::Slab,
    }
}

/// A contiguous vertical run of one type in one column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Span {
    /// Bottom of the span.
    pub base: f32,
    /// Vertical extent.
    pub height: f32,
    /// Type shared by every cell in the span.
    pub kind: VoxelKind,
}

impl Span {
    /// Construct a span.
    pub const fn new(base: f32, height: f32, kind: VoxelKind) -> Self {
        Self { base, height, kind }
    }

    /// Span for a run of `len` unit cells starting at `y`. Slabs are always
    /// half-height.
    pub fn cells(y: i32, len: i32, kind: VoxelKind) -> Self {
        let height = if kind == VoxelKind::Slab {
            SLAB_HEIGHT
        } else {
            len as f32
        };
        Self::new(y as f32, height, kind)
    }

    /// Top of the span.
    pub fn top(&self) -> f32 {
        self.base + self.height
    }

    /// Merge class of the span's type.
    pub fn class(&self) -> SpanClass {
        classify(self.kind)
    }

    fn overlaps(&self, lo: f32, hi: f32) -> bool {
        self.base < hi - EPSILON && self.top() > lo + EPSILON
    }

    /// Parts of this span left after cutting out `[lo, hi)`.
    fn without(&self, lo: f32, hi: f32) -> (Option<Span>, Option<Span>) {
        let left =
            (self.base < lo - EPSILON).then(|| Span::new(self.base, lo - self.base, self.kind));
        let right =
            (self.top() > hi + EPSILON).then(|| Span::new(hi, self.top() - hi, self.kind));
        (left, right)
    }
}

/// Per-level baseline: column to spans.
pub type Baseline = FxHashMap<ColumnKey, Vec<Span>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellEdit {
    Add(VoxelKind),
    Remove,
}

/// Maintains merged spans for every column the diff overlay touches.
#[derive(Debug, Default)]
pub struct WorldMergeEngine {
    baseline: Baseline,
    /// Diff overlay indexed by column, kept in sync with the voxel channel.
    cells: FxHashMap<ColumnKey, BTreeMap<i32, CellEdit>>,
    /// Rebuilt columns. Columns absent here render their baseline.
    merged: FxHashMap<ColumnKey, Vec<Span>>,
}

impl WorldMergeEngine {
    /// Create an engine with an empty baseline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the baseline and drop the diff overlay.
    ///
    /// Returns every column whose spans may have changed.
    pub fn set_baseline(&mut self, baseline: Baseline) -> Vec<ColumnKey> {
        let mut touched: FxHashSet<ColumnKey> = self.merged.keys().copied().collect();
        touched.extend(self.baseline.keys().copied());
        touched.extend(baseline.keys().copied());

        self.baseline = baseline
            .into_iter()
            .map(|(col, mut spans)| {
                normalize(&mut spans);
                (col, spans)
            })
            .collect();
        self.cells.clear();
        self.merged.clear();

        sorted(touched)
    }

    /// Sync the overlay for `touched` cells from `diff` and rebuild the
    /// affected columns. Returns those columns, sorted.
    pub fn apply(
        &mut self,
        touched: &[VoxelKey],
        diff: &DiffSet<VoxelKey, VoxelKind>,
    ) -> Vec<ColumnKey> {
        let mut columns = FxHashSet::default();
        for key in touched {
            let column = key.column();
            columns.insert(column);
            let edit = match diff.state(key) {
                CellState::Added(kind) => Some(CellEdit::Add(*kind)),
                CellState::Removed => Some(CellEdit::Remove),
                CellState::Absent => None,
            };
            let cells = self.cells.entry(column).or_default();
            match edit {
                Some(edit) => {
                    cells.insert(key.y, edit);
                }
                None => {
                    cells.remove(&key.y);
                }
            }
        }

        let columns = sorted(columns);
        for column in &columns {
            self.rebuild(*column);
        }
        tracing::trace!(cells = touched.len(), columns = columns.len(), "Merged columns");
        columns
    }

    /// Current spans of a column.
    pub fn column(&self, column: ColumnKey) -> &[Span] {
        self.merged
            .get(&column)
            .or_else(|| self.baseline.get(&column))
            .map_or(&[][..], Vec::as_slice)
    }

    /// Every column that has at least one span.
    pub fn columns(&self) -> impl Iterator<Item = (ColumnKey, &[Span])> {
        let merged = self
            .merged
            .iter()
            .filter(|(_, spans)| !spans.is_empty())
            .map(|(col, spans)| (*col, spans.as_slice()));
        let baseline_only = self
            .baseline
            .iter()
            .filter(|(col, spans)| !self.merged.contains_key(*col) && !spans.is_empty())
            .map(|(col, spans)| (*col, spans.as_slice()));
        merged.chain(baseline_only)
    }

    fn rebuild(&mut self, column: ColumnKey) {
        let baseline = self.baseline.get(&column).map_or(&[][..], Vec::as_slice);
        let overlay = self.cells.get(&column);

        match overlay {
            Some(cells) if !cells.is_empty() => {
                let spans = merge_column(baseline, cells);
                self.merged.insert(column, spans);
            }
            _ => {
                self.cells.remove(&column);
                self.merged.remove(&column);
            }
        }
    }
}

fn sorted(columns: FxHashSet<ColumnKey>) -> Vec<ColumnKey> {
    let mut columns: Vec<_> = columns.into_iter().collect();
    columns.sort();
    columns
}

/// Baseline spans with the overlay's removals and additions applied.
fn merge_column(baseline: &[Span], cells: &BTreeMap<i32, CellEdit>) -> Vec<Span> {
    let mut spans = baseline.to_vec();

    for (&y, edit) in cells {
        if *edit == CellEdit::Remove {
            carve(&mut spans, y as f32, y as f32 + 1.0, |_| true);
        }
    }

    let added = cells.iter().filter_map(|(&y, edit)| match edit {
        CellEdit::Add(kind) => Some((y, *kind)),
        CellEdit::Remove => None,
    });
    let (solids, markers, slabs) = partition(added);

    normalize(&mut spans);

    for span in runs(&solids) {
        carve(&mut spans, span.base, span.top(), |existing| {
            existing.class() == SpanClass::Solid && existing.kind != span.kind
        });
        spans.push(span);
    }
    spans.extend(runs(&markers));
    spans.extend(slabs.iter().map(|&(y, kind)| Span::cells(y, 1, kind)));

    normalize(&mut spans);
    spans
}

type Cells = Vec<(i32, VoxelKind)>;

fn partition(added: impl Iterator<Item = (i32, VoxelKind)>) -> (Cells, Cells, Cells) {
    let mut solids = Vec::new();
    let mut markers = Vec::new();
    let mut slabs = Vec::new();
    for (y, kind) in added {
        match classify(kind) {
            SpanClass::Solid => solids.push((y, kind)),
            SpanClass::Marker => markers.push((y, kind)),
            SpanClass::Slab => slabs.push((y, kind)),
        }
    }
    (solids, markers, slabs)
}

/// Group cells (sorted by `y`) into runs of consecutive heights with the
/// same type.
fn runs(cells: &[(i32, VoxelKind)]) -> Vec<Span> {
    let mut out = Vec::new();
    let mut current: Option<(i32, i32, VoxelKind)> = None;

    for &(y, kind) in cells {
        current = match current {
            Some((start, len, run_kind)) if run_kind == kind && start + len == y => {
                Some((start, len + 1, run_kind))
            }
            Some((start, len, run_kind)) => {
                out.push(Span::cells(start, len, run_kind));
                Some((y, 1, kind))
            }
            None => Some((y, 1, kind)),
        };
    }
    if let Some((start, len, kind)) = current {
        out.push(Span::cells(start, len, kind));
    }
    out
}

/// Cut `[lo, hi)` out of every span selected by `affects`, keeping the
/// remainders on either side.
fn carve(spans: &mut Vec<Span>, lo: f32, hi: f32, affects: impl Fn(&Span) -> bool) {
    let mut out = Vec::with_capacity(spans.len() + 1);
    for span in spans.drain(..) {
        if span.overlaps(lo, hi) && affects(&span) {
            let (left, right) = span.without(lo, hi);
            out.extend(left);
            out.extend(right);
        } else {
            out.push(span);
        }
    }
    *spans = out;
}

/// Sort spans and fuse touching or overlapping spans of the same type.
/// Slabs are only de-duplicated.
fn normalize(spans: &mut Vec<Span>) {
    spans.sort_by(|a, b| a.kind.cmp(&b.kind).then(a.base.total_cmp(&b.base)));

    let mut out: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans.drain(..) {
        match out.last_mut() {
            Some(last) if last.kind == span.kind && span.kind == VoxelKind::Slab => {
                if (last.base - span.base).abs() > EPSILON {
                    out.push(span);
                }
            }
            Some(last) if last.kind == span.kind && span.base <= last.top() + EPSILON => {
                let top = last.top().max(span.top());
                last.height = top - last.base;
            }
            _ => out.push(span),
        }
    }

    out.sort_by(|a, b| a.base.total_cmp(&b.base).then(a.kind.cmp(&b.kind)));
    *spans = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DiffChannel;
    use warren_net::VoxelOp;

    fn add(y: i32, t: VoxelKind) -> VoxelOp {
        VoxelOp::Add { gx: 0, gy: 0, y, t }
    }

    fn remove(y: i32) -> VoxelOp {
        VoxelOp::Remove { gx: 0, gy: 0, y }
    }

    const ORIGIN: ColumnKey = ColumnKey::new(0, 0);

    /// Drive a channel and engine together the way the session does.
    struct Harness {
        channel: DiffChannel<VoxelOp>,
        engine: WorldMergeEngine,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                channel: DiffChannel::new(),
                engine: WorldMergeEngine::new(),
            }
        }

        fn with_baseline(spans: Vec<Span>) -> Self {
            let mut harness = Self::new();
            let mut baseline = Baseline::default();
            baseline.insert(ORIGIN, spans);
            harness.engine.set_baseline(baseline);
            harness
        }

        fn ops(&mut self, ops: &[VoxelOp]) -> Vec<ColumnKey> {
            let touched = self.channel.apply_unversioned(ops);
            self.engine.apply(&touched, self.channel.state())
        }

        fn origin(&self) -> Vec<Span> {
            self.engine.column(ORIGIN).to_vec()
        }
    }

    #[test]
    fn test_consecutive_same_type_merge_into_one_span() {
        let mut h = Harness::new();
        h.ops(&[
            add(0, VoxelKind::Normal),
            add(1, VoxelKind::Normal),
            add(2, VoxelKind::Normal),
        ]);
        assert_eq!(h.origin(), vec![Span::new(0.0, 3.0, VoxelKind::Normal)]);
    }

    #[test]
    fn test_different_solid_type_splits_run() {
        let mut h = Harness::new();
        h.ops(&[
            add(0, VoxelKind::Normal),
            add(1, VoxelKind::Normal),
            add(2, VoxelKind::Normal),
        ]);
        h.ops(&[add(1, VoxelKind::Hazard)]);
        assert_eq!(
            h.origin(),
            vec![
                Span::new(0.0, 1.0, VoxelKind::Normal),
                Span::new(1.0, 1.0, VoxelKind::Hazard),
                Span::new(2.0, 1.0, VoxelKind::Normal),
            ]
        );
    }

    #[test]
    fn test_gap_starts_new_span() {
        let mut h = Harness::new();
        h.ops(&[add(0, VoxelKind::Normal), add(2, VoxelKind::Normal)]);
        assert_eq!(
            h.origin(),
            vec![
                Span::new(0.0, 1.0, VoxelKind::Normal),
                Span::new(2.0, 1.0, VoxelKind::Normal),
            ]
        );
    }

    #[test]
    fn test_removing_middle_of_added_run_splits() {
        let mut h = Harness::new();
        h.ops(&[
            add(0, VoxelKind::Normal),
            add(1, VoxelKind::Normal),
            add(2, VoxelKind::Normal),
        ]);
        h.ops(&[remove(1)]);
        assert_eq!(
            h.origin(),
            vec![
                Span::new(0.0, 1.0, VoxelKind::Normal),
                Span::new(2.0, 1.0, VoxelKind::Normal),
            ]
        );
    }

    #[test]
    fn test_removing_middle_of_baseline_span_splits() {
        let mut h = Harness::with_baseline(vec![Span::new(0.0, 3.0, VoxelKind::Normal)]);
        h.ops(&[remove(1)]);
        assert_eq!(
            h.origin(),
            vec![
                Span::new(0.0, 1.0, VoxelKind::Normal),
                Span::new(2.0, 1.0, VoxelKind::Normal),
            ]
        );
    }

    #[test]
    fn test_removing_edge_shrinks_and_unit_span_drops() {
        let mut h = Harness::with_baseline(vec![
            Span::new(0.0, 3.0, VoxelKind::Normal),
            Span::new(5.0, 1.0, VoxelKind::Hazard),
        ]);
        h.ops(&[remove(2), remove(5)]);
        assert_eq!(h.origin(), vec![Span::new(0.0, 2.0, VoxelKind::Normal)]);

        h.ops(&[remove(0)]);
        assert_eq!(h.origin(), vec![Span::new(1.0, 1.0, VoxelKind::Normal)]);
    }

    #[test]
    fn test_new_solid_splits_baseline_of_other_type() {
        let mut h = Harness::with_baseline(vec![Span::new(0.0, 4.0, VoxelKind::Normal)]);
        h.ops(&[add(1, VoxelKind::NoClimb), add(2, VoxelKind::NoClimb)]);
        assert_eq!(
            h.origin(),
            vec![
                Span::new(0.0, 1.0, VoxelKind::Normal),
                Span::new(1.0, 2.0, VoxelKind::NoClimb),
                Span::new(3.0, 1.0, VoxelKind::Normal),
            ]
        );
    }

    #[test]
    fn test_same_type_addition_extends_baseline() {
        let mut h = Harness::with_baseline(vec![Span::new(0.0, 2.0, VoxelKind::Hazard)]);
        h.ops(&[add(2, VoxelKind::Hazard)]);
        assert_eq!(h.origin(), vec![Span::new(0.0, 3.0, VoxelKind::Hazard)]);
    }

    #[test]
    fn test_marker_coexists_with_solid_at_same_height() {
        let mut h = Harness::with_baseline(vec![Span::new(0.0, 2.0, VoxelKind::Normal)]);
        h.ops(&[add(1, VoxelKind::Fence), add(2, VoxelKind::Fence)]);
        assert_eq!(
            h.origin(),
            vec![
                Span::new(0.0, 2.0, VoxelKind::Normal),
                Span::new(1.0, 2.0, VoxelKind::Fence),
            ]
        );
    }

    #[test]
    fn test_marker_runs_break_on_type_change() {
        let mut h = Harness::new();
        h.ops(&[
            add(4, VoxelKind::Portal),
            add(5, VoxelKind::Portal),
            add(6, VoxelKind::Lock),
        ]);
        assert_eq!(
            h.origin(),
            vec![
                Span::new(4.0, 2.0, VoxelKind::Portal),
                Span::new(6.0, 1.0, VoxelKind::Lock),
            ]
        );
    }

    #[test]
    fn test_slabs_never_merge() {
        let mut h = Harness::new();
        h.ops(&[add(0, VoxelKind::Slab), add(1, VoxelKind::Slab)]);
        assert_eq!(
            h.origin(),
            vec![
                Span::new(0.0, SLAB_HEIGHT, VoxelKind::Slab),
                Span::new(1.0, SLAB_HEIGHT, VoxelKind::Slab),
            ]
        );
    }

    #[test]
    fn test_removing_slab_cell_drops_slab() {
        let mut h = Harness::with_baseline(vec![Span::new(3.0, SLAB_HEIGHT, VoxelKind::Slab)]);
        h.ops(&[remove(3)]);
        assert!(h.origin().is_empty());
    }

    #[test]
    fn test_overlapping_markers_terminate() {
        let mut h = Harness::with_baseline(vec![Span::new(0.0, 3.0, VoxelKind::Lock)]);
        h.ops(&[add(1, VoxelKind::Portal)]);
        let spans = h.origin();
        assert!(spans.iter().any(|s| s.kind == VoxelKind::Lock));
        assert!(spans.iter().any(|s| s.kind == VoxelKind::Portal));
    }

    #[test]
    fn test_only_touched_columns_rebuilt() {
        let mut h = Harness::new();
        let touched = h.ops(&[
            VoxelOp::Add {
                gx: 3,
                gy: 1,
                y: 0,
                t: VoxelKind::Normal,
            },
            VoxelOp::Add {
                gx: -1,
                gy: 0,
                y: 0,
                t: VoxelKind::Normal,
            },
        ]);
        assert_eq!(touched, vec![ColumnKey::new(-1, 0), ColumnKey::new(3, 1)]);
        assert!(h.engine.column(ORIGIN).is_empty());
    }

    #[test]
    fn test_clearing_overlay_restores_baseline() {
        let mut h = Harness::with_baseline(vec![Span::new(0.0, 2.0, VoxelKind::Normal)]);
        h.ops(&[remove(0)]);
        assert_eq!(h.origin(), vec![Span::new(1.0, 1.0, VoxelKind::Normal)]);

        let touched = h.channel.reset();
        h.engine.apply(&touched, h.channel.state());
        assert_eq!(h.origin(), vec![Span::new(0.0, 2.0, VoxelKind::Normal)]);
    }

    #[test]
    fn test_baseline_is_normalized_on_install() {
        let h = Harness::with_baseline(vec![
            Span::new(1.0, 1.0, VoxelKind::Normal),
            Span::new(0.0, 1.0, VoxelKind::Normal),
        ]);
        assert_eq!(h.origin(), vec![Span::new(0.0, 2.0, VoxelKind::Normal)]);
    }

    #[test]
    fn test_columns_lists_baseline_and_merged() {
        let mut h = Harness::with_baseline(vec![Span::new(0.0, 1.0, VoxelKind::Normal)]);
        h.ops(&[VoxelOp::Add {
            gx: 9,
            gy: 9,
            y: 0,
            t: VoxelKind::Fence,
        }]);
        let mut cols: Vec<_> = h.engine.columns().map(|(c, _)| c).collect();
        cols.sort();
        assert_eq!(cols, vec![ORIGIN, ColumnKey::new(9, 9)]);
    }
}
