#![forbid(unsafe_code)]

use tracing::info;

use super::graph::{QgroupGraph, QgroupLimit};
use super::{QuotaEngine, Transaction};
use crate::storage::{QuotaKey, RelationItem};
use crate::types::{QgroupId, QuotaError, Result, RootId};

/// How a new subvolume or snapshot joins the group hierarchy.
///
/// Entries naming a missing group, or a group not above the new level-0
/// group, are ignored.
#[derive(Clone, Debug, Default)]
pub struct QgroupInherit {
    /// Higher-level groups the new group becomes a member of.
    pub groups: Vec<QgroupId>,
    /// `(src, dst)` pairs: `dst.rfer` becomes `src.rfer - level_size`
    /// (saturating).
    pub rfer_copies: Vec<(QgroupId, QgroupId)>,
    /// `(src, dst)` pairs: `dst.excl` becomes `src.excl + level_size`.
    pub excl_copies: Vec<(QgroupId, QgroupId)>,
    /// Explicit limits for the new group.
    pub limit: Option<QgroupLimit>,
}

impl QgroupInherit {
    /// Creates an empty description.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parent group.
    pub fn group(mut self, parent: QgroupId) -> Self {
        self.groups.push(parent);
        self
    }

    /// Adds a referenced-bytes copy.
    pub fn copy_rfer(mut self, src: QgroupId, dst: QgroupId) -> Self {
        self.rfer_copies.push((src, dst));
        self
    }

    /// Adds an exclusive-bytes copy.
    pub fn copy_excl(mut self, src: QgroupId, dst: QgroupId) -> Self {
        self.excl_copies.push((src, dst));
        self
    }

    /// Sets explicit limits for the new group.
    pub fn limit(mut self, limit: QgroupLimit) -> Self {
        self.limit = Some(limit);
        self
    }

    fn valid(graph: &QgroupGraph, dst: QgroupId, id: QgroupId) -> bool {
        id.level > dst.level && graph.slot(id).is_some()
    }

    fn usable_groups(&self, graph: &QgroupGraph, dst: QgroupId) -> Vec<QgroupId> {
        self.groups
            .iter()
            .copied()
            .filter(|&id| Self::valid(graph, dst, id))
            .collect()
    }

    fn usable_pairs(
        pairs: &[(QgroupId, QgroupId)],
        graph: &QgroupGraph,
        dst: QgroupId,
    ) -> Vec<(QgroupId, QgroupId)> {
        pairs
            .iter()
            .copied()
            .filter(|&(a, b)| Self::valid(graph, dst, a) && Self::valid(graph, dst, b))
            .collect()
    }
}

impl QuotaEngine {
    /// Creates the level-0 group of a new subvolume `dst_root`.
    ///
    /// With `src_root` the new root is a snapshot: it takes over the source's
    /// referenced bytes and limits, and both groups keep only `level_size`
    /// (the unshared root block) as exclusive. A no-op while quota is off.
    pub fn inherit(
        &self,
        txn: &mut Transaction,
        src_root: Option<RootId>,
        dst_root: RootId,
        inherit: Option<&QgroupInherit>,
        level_size: u64,
    ) -> Result<()> {
        let inner = &self.inner;
        let _structural = inner.structural.lock();
        if !inner.runtime.enabled() {
            return Ok(());
        }
        let mut state = inner.counters.lock();
        let graph = state
            .graph
            .as_mut()
            .ok_or(QuotaError::InvalidState("quota is not enabled"))?;
        let dst = QgroupId::for_root(dst_root);
        if graph.slot(dst).is_some() {
            return Err(QuotaError::AlreadyExists("qgroup"));
        }
        let empty = QgroupInherit::default();
        let inherit = inherit.unwrap_or(&empty);
        let parents = inherit.usable_groups(graph, dst);
        let rfer_copies = QgroupInherit::usable_pairs(&inherit.rfer_copies, graph, dst);
        let excl_copies = QgroupInherit::usable_pairs(&inherit.excl_copies, graph, dst);

        let dst_slot = graph.create(dst)?;
        for &parent in &parents {
            graph.add_relation(dst, parent)?;
            txn.batch.put(QuotaKey::Relation(dst, parent), &RelationItem);
            txn.batch.put(QuotaKey::Relation(parent, dst), &RelationItem);
        }
        if let Some(limit) = inherit.limit {
            graph.node_mut(dst_slot).limit = limit;
        }

        let src_slot = src_root.and_then(|root| graph.slot(QgroupId::for_root(root)));
        if let Some(src_slot) = src_slot {
            let src = graph.node(src_slot);
            let (rfer, rfer_cmpr, limit) = (src.counters.rfer, src.counters.rfer_cmpr, src.limit);
            let dst_group = graph.node_mut(dst_slot);
            dst_group.counters.rfer = rfer;
            dst_group.counters.rfer_cmpr = rfer_cmpr;
            dst_group.counters.excl = level_size;
            dst_group.counters.excl_cmpr = level_size;
            dst_group.limit = limit;
            let src_group = graph.node_mut(src_slot);
            src_group.counters.excl = level_size;
            src_group.counters.excl_cmpr = level_size;
            graph.mark_dirty(src_slot);
        }
        graph.mark_dirty(dst_slot);

        for (from, to) in rfer_copies {
            let (Some(from), Some(to)) = (graph.slot(from), graph.slot(to)) else {
                continue;
            };
            let src = graph.node(from).counters;
            let group = graph.node_mut(to);
            group.counters.rfer = src.rfer.saturating_sub(level_size);
            group.counters.rfer_cmpr = src.rfer_cmpr.saturating_sub(level_size);
            graph.mark_dirty(to);
        }
        for (from, to) in excl_copies {
            let (Some(from), Some(to)) = (graph.slot(from), graph.slot(to)) else {
                continue;
            };
            let src = graph.node(from).counters;
            let group = graph.node_mut(to);
            group.counters.excl = src.excl.saturating_add(level_size);
            group.counters.excl_cmpr = src.excl_cmpr.saturating_add(level_size);
            graph.mark_dirty(to);
        }
        info!(
            dst = %dst,
            src = ?src_root.map(|root| root.0),
            parents = parents.len(),
            level_size,
            txn = txn.id(),
            "qgroup.inherit"
        );
        Ok(())
    }
}
