#![forbid(unsafe_code)]
//! Per-extent refcount propagation over the group DAG.
//!
//! A [`RefcountPass`] keeps two scratch counters per group slot, stored as
//! `seq + increments`. A value below the current `seq` belongs to an earlier
//! extent and reads as zero, so the map never needs a reset between
//! extents. After each extent the caller advances `seq` past every value the
//! extent could have produced.

use rustc_hash::{FxHashMap, FxHashSet};

use super::graph::{QgroupGraph, Slot};
use crate::types::{QgroupId, QuotaError, Result, RootSet};

/// Which root set a propagation feeds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Side {
    /// Roots referencing the extent before the change.
    Old,
    /// Roots referencing the extent after the change.
    New,
}

#[derive(Copy, Clone, Default, Debug)]
struct Scratch {
    old: u64,
    new: u64,
    touched: u64,
}

/// Scratch state for refcount propagation, reusable across extents.
pub struct RefcountPass {
    seq: u64,
    counts: FxHashMap<Slot, Scratch>,
    touched: Vec<Slot>,
    stack: Vec<Slot>,
    visited: FxHashSet<Slot>,
    closure: Vec<Slot>,
    max_groups: usize,
}

impl RefcountPass {
    /// Creates a pass that refuses to touch more than `max_groups` groups per extent.
    pub fn new(max_groups: usize) -> Self {
        Self {
            seq: 1,
            counts: FxHashMap::default(),
            touched: Vec::new(),
            stack: Vec::new(),
            visited: FxHashSet::default(),
            closure: Vec::new(),
            max_groups: max_groups.max(1),
        }
    }

    /// Current epoch.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Groups reached since the last [`RefcountPass::finish`], each listed once.
    pub fn touched(&self) -> &[Slot] {
        &self.touched
    }

    /// Count of roots in the last propagated `side` whose closure reaches `slot`.
    pub fn count(&self, slot: Slot, side: Side) -> u64 {
        let Some(scratch) = self.counts.get(&slot) else {
            return 0;
        };
        let raw = match side {
            Side::Old => scratch.old,
            Side::New => scratch.new,
        };
        raw.saturating_sub(self.seq)
    }

    /// Walks every root's ancestor closure and counts each reached group once per root.
    ///
    /// Roots without a level-0 group are skipped. Fails with
    /// `ResourceExhausted` before touching any scratch counter when the walk
    /// would exceed the pass budget or memory cannot be reserved.
    pub fn propagate(&mut self, graph: &QgroupGraph, roots: &RootSet, side: Side) -> Result<()> {
        let mut starts = Vec::new();
        starts
            .try_reserve(roots.len())
            .map_err(|_| QuotaError::ResourceExhausted("propagation worklist"))?;
        for root in roots {
            if let Some(slot) = graph.slot(QgroupId::for_root(*root)) {
                starts.push(slot);
            }
        }
        let mut per_root: Vec<Vec<Slot>> = Vec::new();
        per_root
            .try_reserve(starts.len())
            .map_err(|_| QuotaError::ResourceExhausted("propagation worklist"))?;
        let mut fresh = FxHashSet::default();
        for start in starts {
            let walk = self.walk(graph, start)?;
            fresh.extend(walk.iter().copied().filter(|slot| !self.is_touched(*slot)));
            per_root.push(walk);
        }
        self.ensure_capacity(fresh.len())?;
        for walk in per_root {
            for slot in walk {
                self.bump(slot, side);
            }
        }
        Ok(())
    }

    /// Collects the deduplicated ancestor closure of `start`, including `start`.
    pub fn closure(&mut self, graph: &QgroupGraph, start: Slot) -> Result<&[Slot]> {
        let walk = self.walk(graph, start)?;
        self.closure = walk;
        Ok(&self.closure)
    }

    /// Ends the current extent: clears the touched list and advances `seq`
    /// past every count this extent produced.
    pub fn finish(&mut self, nr_old: usize, nr_new: usize) {
        self.touched.clear();
        self.seq = self
            .seq
            .saturating_add(nr_old.max(nr_new) as u64)
            .saturating_add(1);
    }

    fn walk(&mut self, graph: &QgroupGraph, start: Slot) -> Result<Vec<Slot>> {
        self.visited.clear();
        self.stack.clear();
        let mut out = Vec::new();
        self.stack.push(start);
        self.visited.insert(start);
        while let Some(slot) = self.stack.pop() {
            if out.len() >= self.max_groups {
                return Err(QuotaError::ResourceExhausted("qgroup pass budget"));
            }
            out.try_reserve(1)
                .map_err(|_| QuotaError::ResourceExhausted("qgroup closure"))?;
            out.push(slot);
            let parents = &graph.node(slot).parents;
            self.stack
                .try_reserve(parents.len())
                .map_err(|_| QuotaError::ResourceExhausted("qgroup closure"))?;
            for &parent in parents {
                if self.visited.insert(parent) {
                    self.stack.push(parent);
                }
            }
        }
        Ok(out)
    }

    fn is_touched(&self, slot: Slot) -> bool {
        self.counts
            .get(&slot)
            .map(|s| s.touched == self.seq)
            .unwrap_or(false)
    }

    fn ensure_capacity(&mut self, fresh: usize) -> Result<()> {
        if self.touched.len().saturating_add(fresh) > self.max_groups {
            return Err(QuotaError::ResourceExhausted("qgroup pass budget"));
        }
        self.touched
            .try_reserve(fresh)
            .map_err(|_| QuotaError::ResourceExhausted("qgroup touched list"))?;
        self.counts
            .try_reserve(fresh)
            .map_err(|_| QuotaError::ResourceExhausted("qgroup scratch counters"))?;
        Ok(())
    }

    fn bump(&mut self, slot: Slot, side: Side) {
        let seq = self.seq;
        let scratch = self.counts.entry(slot).or_default();
        if scratch.touched != seq {
            scratch.touched = seq;
            self.touched.push(slot);
        }
        let raw = match side {
            Side::Old => &mut scratch.old,
            Side::New => &mut scratch.new,
        };
        if *raw < seq {
            *raw = seq;
        }
        *raw += 1;
    }
}
