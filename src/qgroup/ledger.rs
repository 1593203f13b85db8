#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::graph::{QgroupLimit, LIMIT_MAX_EXCL, LIMIT_MAX_RFER};
use super::{CounterState, EngineInner, QuotaEngine, Transaction};
use crate::types::{LimitKind, QgroupId, QuotaError, Result, RootId};

/// Disjoint, coalesced half-open byte ranges.
#[derive(Clone, Debug, Default)]
pub(crate) struct RangeSet {
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    /// Ranges overlapping or touching `[start, end)`, in order.
    fn neighbours(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        if let Some((&s, &e)) = self.ranges.range(..start).next_back() {
            if e >= start {
                out.push((s, e));
            }
        }
        out.extend(self.ranges.range(start..=end).map(|(&s, &e)| (s, e)));
        out
    }

    /// Marks `[start, end)` and returns the pieces that were not marked yet.
    pub(crate) fn set(&mut self, start: u64, end: u64) -> Vec<(u64, u64)> {
        if start >= end {
            return Vec::new();
        }
        let mut gaps = Vec::new();
        let mut pos = start;
        let mut lo = start;
        let mut hi = end;
        for (s, e) in self.neighbours(start, end) {
            let gap_end = s.min(end);
            if gap_end > pos {
                gaps.push((pos, gap_end));
            }
            pos = pos.max(e);
            lo = lo.min(s);
            hi = hi.max(e);
            self.ranges.remove(&s);
        }
        if pos < end {
            gaps.push((pos, end));
        }
        self.ranges.insert(lo, hi);
        gaps
    }

    /// Unmarks `[start, end)` and returns the pieces that were marked.
    pub(crate) fn clear(&mut self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut removed = Vec::new();
        if start >= end {
            return removed;
        }
        for (s, e) in self.neighbours(start, end) {
            let lo = s.max(start);
            let hi = e.min(end);
            if lo >= hi {
                continue;
            }
            self.ranges.remove(&s);
            if s < lo {
                self.ranges.insert(s, lo);
            }
            if hi < e {
                self.ranges.insert(hi, e);
            }
            removed.push((lo, hi));
        }
        removed
    }

    pub(crate) fn take_all(&mut self) -> Vec<(u64, u64)> {
        std::mem::take(&mut self.ranges).into_iter().collect()
    }

    pub(crate) fn covered(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }
}

fn total(ranges: &[(u64, u64)]) -> u64 {
    ranges.iter().map(|(s, e)| e - s).sum()
}

fn range_end(start: u64, len: u64) -> Result<u64> {
    start
        .checked_add(len)
        .ok_or(QuotaError::Invalid("data range overflows"))
}

/// Data-space reservation held by one file.
///
/// Remembers which byte ranges are already reserved so that rewriting a
/// dirty range does not reserve it twice.
#[derive(Debug)]
pub struct DataReservation {
    root: RootId,
    ranges: Mutex<RangeSet>,
}

impl DataReservation {
    /// Creates an empty reservation charged to `root`.
    pub fn new(root: RootId) -> Self {
        Self {
            root,
            ranges: Mutex::new(RangeSet::default()),
        }
    }

    /// Root the reservation is charged to.
    pub fn root(&self) -> RootId {
        self.root
    }

    /// Bytes currently marked reserved.
    pub fn reserved_bytes(&self) -> u64 {
        self.ranges.lock().covered()
    }
}

/// Metadata-space reservation held by one root.
#[derive(Debug)]
pub struct MetaReservation {
    root: RootId,
    reserved: AtomicU64,
}

impl MetaReservation {
    /// Creates an empty reservation charged to `root`.
    pub fn new(root: RootId) -> Self {
        Self {
            root,
            reserved: AtomicU64::new(0),
        }
    }

    /// Root the reservation is charged to.
    pub fn root(&self) -> RootId {
        self.root
    }

    /// Bytes currently held.
    pub fn reserved_bytes(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }
}

impl QuotaEngine {
    /// Reserves `num_bytes` against every group in `root`'s closure.
    ///
    /// Either every group is charged or, when any of them would pass a
    /// configured limit, none is and `QuotaExceeded` names the first one.
    /// Checks run against the in-memory totals even while they are flagged
    /// inconsistent.
    pub fn reserve(&self, root: RootId, num_bytes: u64) -> Result<()> {
        self.inner.reserve_inner(root, num_bytes).map(|_| ())
    }

    /// Returns `num_bytes` previously reserved for `root`.
    pub fn release(&self, root: RootId, num_bytes: u64) {
        self.inner.release_inner(root, num_bytes);
    }

    /// Updates the limits of a group. Fields flagged in `limit` are set, or
    /// cleared when their value is [`super::CLEAR_LIMIT`].
    pub fn set_limit(&self, txn: &mut Transaction, id: QgroupId, limit: QgroupLimit) -> Result<()> {
        let inner = &self.inner;
        let _structural = inner.structural.lock();
        let mut state = inner.counters.lock();
        let graph = state
            .graph
            .as_mut()
            .ok_or(QuotaError::InvalidState("quota is not enabled"))?;
        let slot = graph.slot(id).ok_or(QuotaError::NotFound("qgroup"))?;
        graph.node_mut(slot).limit.apply(&limit);
        graph.mark_dirty(slot);
        debug!(qgroup = %id, flags = limit.flags, txn = txn.id(), "qgroup.limit");
        Ok(())
    }

    /// Reserves the not-yet-reserved part of `[start, start + len)`.
    /// Returns the bytes newly reserved.
    pub fn reserve_data(&self, rsv: &DataReservation, start: u64, len: u64) -> Result<u64> {
        let end = range_end(start, len)?;
        let mut ranges = rsv.ranges.lock();
        let gaps = ranges.set(start, end);
        let bytes = total(&gaps);
        if bytes == 0 {
            return Ok(0);
        }
        match self.inner.reserve_inner(rsv.root, bytes) {
            Ok(true) => Ok(bytes),
            Ok(false) => {
                for (s, e) in gaps {
                    ranges.clear(s, e);
                }
                Ok(0)
            }
            Err(err) => {
                for (s, e) in gaps {
                    ranges.clear(s, e);
                }
                Err(err)
            }
        }
    }

    /// Drops the reservation of `[start, start + len)` and gives the bytes
    /// back to the groups. Used when the write is abandoned.
    pub fn free_data(&self, rsv: &DataReservation, start: u64, len: u64) -> Result<u64> {
        let end = range_end(start, len)?;
        let bytes = total(&rsv.ranges.lock().clear(start, end));
        self.inner.release_inner(rsv.root, bytes);
        Ok(bytes)
    }

    /// Forgets the reservation of `[start, start + len)` without touching the
    /// groups: the bytes are booked when the extent is accounted at commit.
    pub fn release_data(&self, rsv: &DataReservation, start: u64, len: u64) -> Result<u64> {
        let end = range_end(start, len)?;
        Ok(total(&rsv.ranges.lock().clear(start, end)))
    }

    /// Frees whatever `rsv` still holds. Returns the leaked bytes.
    pub fn check_reserved_leak(&self, rsv: &DataReservation) -> u64 {
        let leaked = rsv.ranges.lock().take_all();
        let bytes = total(&leaked);
        if bytes > 0 {
            warn!(
                root = rsv.root.0,
                bytes,
                ranges = leaked.len(),
                "qgroup.data.leak"
            );
            self.inner.release_inner(rsv.root, bytes);
        }
        bytes
    }

    /// Reserves `num_bytes` of metadata space.
    pub fn reserve_meta(&self, rsv: &MetaReservation, num_bytes: u64) -> Result<()> {
        if self.inner.reserve_inner(rsv.root, num_bytes)? {
            rsv.reserved.fetch_add(num_bytes, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Returns up to `num_bytes` of the metadata reservation.
    pub fn free_meta(&self, rsv: &MetaReservation, num_bytes: u64) {
        let taken = rsv
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                Some(held.saturating_sub(num_bytes))
            })
            .map(|held| held.min(num_bytes))
            .unwrap_or(0);
        self.inner.release_inner(rsv.root, taken);
    }

    /// Returns the whole metadata reservation.
    pub fn free_meta_all(&self, rsv: &MetaReservation) {
        let held = rsv.reserved.swap(0, Ordering::AcqRel);
        self.inner.release_inner(rsv.root, held);
    }
}

impl EngineInner {
    /// Returns whether anything was reserved: nothing is while quota is off
    /// or `root` has no group.
    pub(crate) fn reserve_inner(&self, root: RootId, num_bytes: u64) -> Result<bool> {
        if num_bytes == 0 {
            return Ok(false);
        }
        let Some(_guard) = self.admit() else {
            return Ok(false);
        };
        let mut state = self.counters.lock();
        let CounterState { graph, pass, .. } = &mut *state;
        let Some(graph) = graph.as_mut() else {
            return Ok(false);
        };
        let Some(start) = graph.slot(QgroupId::for_root(root)) else {
            return Ok(false);
        };
        let closure = pass.closure(graph, start)?.to_vec();
        for &slot in &closure {
            let group = graph.node(slot);
            let pending = group.reserved.saturating_add(num_bytes);
            let over = if group.limit.flags & LIMIT_MAX_RFER != 0
                && pending.saturating_add(group.counters.rfer) > group.limit.max_rfer
            {
                Some(LimitKind::Referenced)
            } else if group.limit.flags & LIMIT_MAX_EXCL != 0
                && pending.saturating_add(group.counters.excl) > group.limit.max_excl
            {
                Some(LimitKind::Exclusive)
            } else {
                None
            };
            if let Some(kind) = over {
                self.metrics.reservation(false);
                debug!(qgroup = %group.id, root = root.0, num_bytes, %kind, "qgroup.reserve.refused");
                return Err(QuotaError::QuotaExceeded {
                    qgroup: group.id,
                    kind,
                });
            }
        }
        for slot in closure {
            let group = graph.node_mut(slot);
            group.reserved = group.reserved.saturating_add(num_bytes);
        }
        self.metrics.reservation(true);
        Ok(true)
    }

    pub(crate) fn release_inner(&self, root: RootId, num_bytes: u64) {
        if num_bytes == 0 {
            return;
        }
        let Some(_guard) = self.admit() else {
            return;
        };
        let mut state = self.counters.lock();
        let CounterState { graph, pass, .. } = &mut *state;
        let Some(graph) = graph.as_mut() else {
            return;
        };
        let Some(start) = graph.slot(QgroupId::for_root(root)) else {
            return;
        };
        let closure = match pass.closure(graph, start) {
            Ok(slots) => slots.to_vec(),
            Err(err) => {
                warn!(root = root.0, num_bytes, error = %err, "qgroup.release.failed");
                self.mark_inconsistent(&mut state, "reservation release failed");
                return;
            }
        };
        for slot in closure {
            let group = graph.node_mut(slot);
            if group.reserved < num_bytes {
                warn!(qgroup = %group.id, have = group.reserved, num_bytes, "qgroup.reserve.underflow");
            }
            group.reserved = group.reserved.saturating_sub(num_bytes);
        }
    }
}
