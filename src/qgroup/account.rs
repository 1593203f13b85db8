#![forbid(unsafe_code)]

use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::warn;

use super::graph::{QgroupGraph, Slot};
use super::propagate::{RefcountPass, Side};
use crate::types::{Result, RootSet};

/// Whether booking referenced bytes also consumes in-flight reservations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ReservationPolicy {
    /// Live commit path: a newly allocated extent books the writer's
    /// reservation. Extents that already had owners (clones, reflinks)
    /// consume nothing.
    Consume,
    /// Rescan: recomputed totals never correspond to a pending reservation.
    Keep,
}

/// Direction of a counter change.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Delta {
    /// Add the extent size.
    Add,
    /// Subtract the extent size.
    Sub,
    /// Leave the counter alone.
    Keep,
}

/// Classifies one group's refcount transition for a single extent.
///
/// `cur_old`/`cur_new` count the roots of the old/new sets whose closure
/// contains the group; `nr_old`/`nr_new` are the sizes of those sets.
/// Returns the change to referenced and exclusive bytes.
pub fn classify(cur_old: u64, cur_new: u64, nr_old: u64, nr_new: u64) -> (Delta, Delta) {
    let rfer = match (cur_old, cur_new) {
        (0, n) if n > 0 => Delta::Add,
        (o, 0) if o > 0 => Delta::Sub,
        _ => Delta::Keep,
    };
    let old_excl = cur_old == nr_old;
    let new_excl = cur_new == nr_new;
    let excl = if old_excl && new_excl {
        match (cur_old, cur_new) {
            (0, n) if n != 0 => Delta::Add,
            (o, 0) if o != 0 => Delta::Sub,
            _ => Delta::Keep,
        }
    } else if old_excl && cur_old != 0 {
        Delta::Sub
    } else if new_excl && cur_new != 0 {
        Delta::Add
    } else {
        Delta::Keep
    };
    (rfer, excl)
}

fn add(field: &mut u64, bytes: u64) {
    *field = field.saturating_add(bytes);
}

fn sub(field: &mut u64, bytes: u64, what: &'static str, group: &dyn std::fmt::Display) {
    if *field < bytes {
        warn!(qgroup = %group, field = what, have = *field, bytes, "qgroup.counter.underflow");
    }
    *field = field.saturating_sub(bytes);
}

/// Applies the rfer/excl transition of one extent to every group reached by
/// either root set. Returns the number of groups whose counters changed.
///
/// Propagation runs before any counter moves, so a `ResourceExhausted`
/// failure leaves every group untouched. `seq` always advances.
pub(crate) fn account_extent(
    graph: &mut QgroupGraph,
    pass: &mut RefcountPass,
    num_bytes: u64,
    old_roots: &RootSet,
    new_roots: &RootSet,
    policy: ReservationPolicy,
) -> Result<usize> {
    let nr_old = old_roots.len();
    let nr_new = new_roots.len();
    let propagated = pass
        .propagate(graph, old_roots, Side::Old)
        .and_then(|_| pass.propagate(graph, new_roots, Side::New));
    if let Err(err) = propagated {
        pass.finish(nr_old, nr_new);
        return Err(err);
    }

    let consume = policy == ReservationPolicy::Consume && nr_old == 0;
    let mut changed = 0;
    for i in 0..pass.touched().len() {
        let slot = pass.touched()[i];
        let cur_old = pass.count(slot, Side::Old);
        let cur_new = pass.count(slot, Side::New);
        let (rfer, excl) = classify(cur_old, cur_new, nr_old as u64, nr_new as u64);
        if rfer == Delta::Keep && excl == Delta::Keep {
            continue;
        }
        let group = graph.node_mut(slot);
        let id = group.id;
        match rfer {
            Delta::Add => {
                add(&mut group.counters.rfer, num_bytes);
                add(&mut group.counters.rfer_cmpr, num_bytes);
                if consume {
                    group.reserved = group.reserved.saturating_sub(num_bytes);
                }
            }
            Delta::Sub => {
                sub(&mut group.counters.rfer, num_bytes, "rfer", &id);
                sub(&mut group.counters.rfer_cmpr, num_bytes, "rfer_cmpr", &id);
            }
            Delta::Keep => {}
        }
        match excl {
            Delta::Add => {
                add(&mut group.counters.excl, num_bytes);
                add(&mut group.counters.excl_cmpr, num_bytes);
            }
            Delta::Sub => {
                sub(&mut group.counters.excl, num_bytes, "excl", &id);
                sub(&mut group.counters.excl_cmpr, num_bytes, "excl_cmpr", &id);
            }
            Delta::Keep => {}
        }
        graph.mark_dirty(slot);
        changed += 1;
    }
    pass.finish(nr_old, nr_new);
    Ok(changed)
}

/// Why a relation change could not be applied incrementally.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RescanReason {
    /// The member shares extents with groups outside it (`excl != rfer`),
    /// so the parent's new totals depend on per-extent ownership.
    SharedExtents {
        /// Member's referenced bytes at the time of the change.
        rfer: u64,
        /// Member's exclusive bytes at the time of the change.
        excl: u64,
    },
    /// The closure walk ran out of its budget.
    PassExhausted,
}

/// Result of a relation add/remove.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RelationOutcome {
    /// Counters were adjusted in place.
    Applied,
    /// Counters were flagged inconsistent; a rescan is needed.
    NeedsRescan(RescanReason),
}

/// Pushes (`adding`) or pulls a fully exclusive member's totals into the
/// groups the changed edge connects it to or disconnects it from.
///
/// The edge must already reflect the change. Ancestors the member still
/// reaches through another parent keep their totals.
pub(crate) fn quick_update(
    graph: &mut QgroupGraph,
    pass: &mut RefcountPass,
    member: Slot,
    parent: Slot,
    adding: bool,
) -> RelationOutcome {
    let counters = graph.node(member).counters;
    if counters.excl != counters.rfer {
        return RelationOutcome::NeedsRescan(RescanReason::SharedExtents {
            rfer: counters.rfer,
            excl: counters.excl,
        });
    }
    let others: Vec<Slot> = graph
        .node(member)
        .parents
        .iter()
        .copied()
        .filter(|&p| p != parent)
        .collect();
    let mut still_reached = FxHashSet::default();
    for other in others {
        match pass.closure(graph, other) {
            Ok(slots) => still_reached.extend(slots.iter().copied()),
            Err(_) => return RelationOutcome::NeedsRescan(RescanReason::PassExhausted),
        }
    }
    let closure = match pass.closure(graph, parent) {
        Ok(slots) => slots.to_vec(),
        Err(_) => return RelationOutcome::NeedsRescan(RescanReason::PassExhausted),
    };
    for slot in closure {
        if still_reached.contains(&slot) {
            continue;
        }
        let group = graph.node_mut(slot);
        let id = group.id;
        if adding {
            add(&mut group.counters.rfer, counters.excl);
            add(&mut group.counters.rfer_cmpr, counters.excl_cmpr);
            add(&mut group.counters.excl, counters.excl);
            add(&mut group.counters.excl_cmpr, counters.excl_cmpr);
        } else {
            sub(&mut group.counters.rfer, counters.excl, "rfer", &id);
            sub(&mut group.counters.rfer_cmpr, counters.excl_cmpr, "rfer_cmpr", &id);
            sub(&mut group.counters.excl, counters.excl, "excl", &id);
            sub(&mut group.counters.excl_cmpr, counters.excl_cmpr, "excl_cmpr", &id);
        }
        graph.mark_dirty(slot);
    }
    RelationOutcome::Applied
}
