#![forbid(unsafe_code)]
//! Hierarchical quota-group accounting.
//!
//! [`QuotaEngine`] tracks, for every content extent, which groups reference
//! it and keeps per-group referenced/exclusive byte totals. Changes are
//! batched per [`Transaction`] and accounted at commit; a background rescan
//! recomputes everything when the incremental totals cannot be trusted.
//!
//! Lock order: structural, commit, rescan, counter. The counter lock is never
//! held across tree or resolver I/O.

pub mod account;
pub mod backref;
mod delayed;
pub mod graph;
mod inherit;
mod ledger;
pub mod metrics;
pub mod options;
pub mod propagate;
mod rescan;
pub mod status;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::primitives::concurrency::{OpGate, OpGuard};
use crate::storage::items::unseal;
use crate::storage::{
    InfoItem, KeyCodec, LimitItem, QuotaBatch, QuotaKey, QuotaTree, RelationItem, StatusItem,
    QUOTA_STATUS_VERSION,
};
use crate::types::{QgroupId, QuotaError, Result};

pub use account::{classify, Delta, RelationOutcome, RescanReason};
pub use backref::{BackrefResolver, ExtentItem, ExtentLeaf, ExtentScanner, TimeSeq};
pub use delayed::{AccountSummary, CommitSummary, DirtyExtent, Transaction};
pub use graph::{
    Qgroup, QgroupCounters, QgroupGraph, QgroupLimit, CLEAR_LIMIT, LIMIT_MAX_EXCL,
    LIMIT_MAX_RFER, LIMIT_RSV_EXCL, LIMIT_RSV_RFER,
};
pub use inherit::QgroupInherit;
pub use ledger::{DataReservation, MetaReservation};
pub use metrics::{default_metrics, CounterMetrics, NoopMetrics, QuotaMetrics};
pub use options::{ConfigError, QuotaConfig, QuotaOptions};
pub use propagate::{RefcountPass, Side};
pub use rescan::RescanProgress;
pub use status::{
    QuotaStatus, RescanPhase, StatusFlags, STATUS_FLAG_INCONSISTENT, STATUS_FLAG_ON,
    STATUS_FLAG_RESCAN,
};

use rescan::RescanState;
use status::RuntimeFlags;

/// Snapshot of one group for reporting.
#[derive(Clone, Debug, Serialize)]
pub struct QgroupInfo {
    /// Group identifier, `level/subid`.
    #[serde(serialize_with = "serialize_id")]
    pub id: QgroupId,
    /// Byte totals.
    pub counters: QgroupCounters,
    /// Configured limits.
    pub limit: QgroupLimit,
    /// Bytes reserved by in-flight writes.
    pub reserved: u64,
    /// Groups this group belongs to.
    #[serde(serialize_with = "serialize_ids")]
    pub parents: Vec<QgroupId>,
    /// Groups that belong to this group.
    #[serde(serialize_with = "serialize_ids")]
    pub members: Vec<QgroupId>,
}

fn serialize_id<S: serde::Serializer>(id: &QgroupId, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_str(id)
}

fn serialize_ids<S: serde::Serializer>(
    ids: &[QgroupId],
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.collect_seq(ids.iter().map(|id| id.to_string()))
}

impl QgroupInfo {
    fn capture(graph: &QgroupGraph, group: &Qgroup) -> Self {
        Self {
            id: group.id,
            counters: group.counters,
            limit: group.limit,
            reserved: group.reserved,
            parents: graph.parents_of(group.id),
            members: graph.members_of(group.id),
        }
    }
}

/// Counter-lock protected state.
pub(crate) struct CounterState {
    pub(crate) graph: Option<QgroupGraph>,
    pub(crate) pass: RefcountPass,
    pub(crate) flags: StatusFlags,
    pub(crate) generation: u64,
    pub(crate) rescan_cursor: u64,
}

pub(crate) struct EngineInner {
    pub(crate) tree: Arc<dyn QuotaTree>,
    pub(crate) resolver: Arc<dyn BackrefResolver>,
    pub(crate) scanner: Arc<dyn ExtentScanner>,
    pub(crate) options: QuotaOptions,
    pub(crate) metrics: Arc<dyn QuotaMetrics>,
    pub(crate) structural: Mutex<()>,
    pub(crate) commit: Mutex<()>,
    pub(crate) rescan: Mutex<RescanState>,
    pub(crate) counters: Mutex<CounterState>,
    pub(crate) runtime: RuntimeFlags,
    pub(crate) gate: OpGate,
    pub(crate) pause_rescan: AtomicBool,
    pub(crate) closing: AtomicBool,
    next_txn: AtomicU64,
}

/// Quota-group accounting engine.
///
/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct QuotaEngine {
    pub(crate) inner: Arc<EngineInner>,
}

struct LoadedConfig {
    graph: Option<QgroupGraph>,
    flags: StatusFlags,
    generation: u64,
    rescan_cursor: u64,
}

impl LoadedConfig {
    fn off(generation: u64) -> Self {
        Self {
            graph: None,
            flags: StatusFlags::default(),
            generation,
            rescan_cursor: 0,
        }
    }
}

fn load_config(tree: &dyn QuotaTree) -> Result<LoadedConfig> {
    let tree_generation = tree.generation();
    let rows = tree.scan()?;
    let mut status: Option<StatusItem> = None;
    let mut graph = QgroupGraph::new();
    let mut inconsistent = false;

    for (key_bytes, value) in &rows {
        let key = match QuotaKey::decode_key(key_bytes) {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, "qgroup.load.unknown_row");
                inconsistent = true;
                continue;
            }
        };
        match key {
            QuotaKey::Status => match unseal::<StatusItem>(key_bytes, value) {
                Ok(item) => status = Some(item),
                Err(err) => {
                    warn!(error = %err, "qgroup.load.status_corrupt");
                    return Ok(LoadedConfig::off(tree_generation));
                }
            },
            QuotaKey::Info(id) => match unseal::<InfoItem>(key_bytes, value) {
                Ok(item) => {
                    if graph.slot(id).is_some() {
                        inconsistent = true;
                    }
                    let slot = graph.get_or_create(id);
                    let group = graph.node_mut(slot);
                    group.counters = QgroupCounters {
                        rfer: item.rfer,
                        rfer_cmpr: item.rfer_cmpr,
                        excl: item.excl,
                        excl_cmpr: item.excl_cmpr,
                    };
                }
                Err(err) => {
                    warn!(qgroup = %id, error = %err, "qgroup.load.info_corrupt");
                    inconsistent = true;
                }
            },
            QuotaKey::Limit(id) => match unseal::<LimitItem>(key_bytes, value) {
                Ok(item) => {
                    if graph.slot(id).is_none() {
                        inconsistent = true;
                    }
                    let slot = graph.get_or_create(id);
                    graph.node_mut(slot).limit = QgroupLimit::from_item(&item);
                }
                Err(err) => {
                    warn!(qgroup = %id, error = %err, "qgroup.load.limit_corrupt");
                    inconsistent = true;
                }
            },
            QuotaKey::Relation(member, parent) => {
                if !key.is_primary_relation() {
                    continue;
                }
                if let Err(err) = unseal::<RelationItem>(key_bytes, value) {
                    warn!(member = %member, parent = %parent, error = %err, "qgroup.load.relation_corrupt");
                    inconsistent = true;
                    continue;
                }
                match graph.add_relation(member, parent) {
                    Ok(_) => {}
                    Err(QuotaError::NotFound(_)) => {
                        warn!(member = %member, parent = %parent, "qgroup.load.orphan_relation");
                    }
                    Err(err) => {
                        warn!(member = %member, parent = %parent, error = %err, "qgroup.load.bad_relation");
                    }
                }
            }
        }
    }

    let Some(status) = status else {
        debug!(rows = rows.len(), "qgroup.load.no_status");
        return Ok(LoadedConfig::off(tree_generation));
    };
    if status.version != QUOTA_STATUS_VERSION {
        warn!(
            found = status.version,
            expected = QUOTA_STATUS_VERSION,
            "qgroup.load.version_mismatch"
        );
        return Ok(LoadedConfig::off(tree_generation));
    }
    let mut flags = StatusFlags::from_bits(status.flags);
    if !flags.is_on() {
        return Ok(LoadedConfig::off(tree_generation));
    }
    if status.generation != tree_generation {
        warn!(
            status_generation = status.generation,
            tree_generation, "qgroup.load.generation_mismatch"
        );
        inconsistent = true;
    }
    if inconsistent {
        flags.insert(STATUS_FLAG_INCONSISTENT);
    }
    Ok(LoadedConfig {
        graph: Some(graph),
        flags,
        generation: tree_generation,
        rescan_cursor: status.rescan,
    })
}

impl QuotaEngine {
    /// Opens the engine over `tree`, loading any persisted quota state.
    ///
    /// Inconsistent or foreign rows never fail the open: they are logged and
    /// either flag the counters inconsistent or leave quota off.
    pub fn open(
        tree: Arc<dyn QuotaTree>,
        resolver: Arc<dyn BackrefResolver>,
        scanner: Arc<dyn ExtentScanner>,
        options: QuotaOptions,
    ) -> Result<Self> {
        let loaded = load_config(tree.as_ref())?;
        let metrics = options
            .metrics
            .clone()
            .unwrap_or_else(metrics::default_metrics);
        let pass = RefcountPass::new(options.max_pass_groups);
        let quota_on = loaded.graph.is_some();
        let resume = quota_on && loaded.flags.is_rescanning();
        let groups = loaded.graph.as_ref().map(|g| g.len()).unwrap_or(0);
        let flags = loaded.flags;
        let inner = Arc::new(EngineInner {
            tree,
            resolver,
            scanner,
            metrics,
            structural: Mutex::new(()),
            commit: Mutex::new(()),
            rescan: Mutex::new(RescanState::default()),
            counters: Mutex::new(CounterState {
                graph: loaded.graph,
                pass,
                flags,
                generation: loaded.generation,
                rescan_cursor: loaded.rescan_cursor,
            }),
            runtime: RuntimeFlags::default(),
            gate: OpGate::new(),
            pause_rescan: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            next_txn: AtomicU64::new(1),
            options,
        });
        inner.runtime.set_enabled(quota_on);
        info!(
            quota_on,
            groups,
            flags = %flags,
            generation = loaded.generation,
            "qgroup.open"
        );
        if resume {
            let mut rescan = inner.rescan.lock();
            if inner.options.auto_resume_rescan {
                inner.spawn_rescan_worker(&mut rescan)?;
                info!("qgroup.rescan.resumed");
            } else {
                rescan.phase = RescanPhase::Paused;
            }
        }
        Ok(Self { inner })
    }

    /// Starts a transaction that collects staged rows and dirty extents.
    pub fn begin_transaction(&self) -> Transaction {
        Transaction::new(self.inner.next_txn.fetch_add(1, Ordering::Relaxed))
    }

    /// Accounts pending extents, flushes dirty groups and status, and
    /// commits everything to the tree in one batch.
    ///
    /// Accounting failures only flag the counters inconsistent; a tree
    /// failure is returned and leaves the tree at the previous generation.
    pub fn commit_transaction(&self, mut txn: Transaction) -> Result<CommitSummary> {
        let inner = &self.inner;
        let _commit = inner.commit.lock();
        let accounting = inner.account_pending_locked(&mut txn);
        let generation = inner.tree.generation().saturating_add(1);
        inner.run_qgroups_locked(&mut txn, generation);
        if let Err(err) = inner.tree.commit(generation, &txn.batch) {
            let mut state = inner.counters.lock();
            if let Some(graph) = state.graph.as_mut() {
                redirty(graph, &txn.flushed);
            }
            inner.mark_inconsistent(&mut state, "quota commit failed");
            error!(txn = txn.id(), error = %err, "qgroup.commit.failed");
            return Err(err);
        }
        inner.counters.lock().generation = generation;
        inner.resolver.switch_commit_roots(generation);
        let mut rescan_started = false;
        if txn.start_rescan {
            let mut rescan = inner.rescan.lock();
            if !rescan.alive {
                inner.spawn_rescan_worker(&mut rescan)?;
                rescan_started = true;
            }
        }
        debug!(
            txn = txn.id(),
            generation,
            rows = txn.batch.len(),
            "qgroup.commit"
        );
        Ok(CommitSummary {
            generation,
            accounting,
            rows_written: txn.batch.len(),
            rescan_started,
        })
    }

    /// Discards a transaction without committing it.
    ///
    /// In-memory structural changes already made through it stay in place, so
    /// the counters are flagged inconsistent when it carried any work.
    pub fn abort_transaction(&self, txn: Transaction) {
        if txn.batch.is_empty() && txn.delayed.is_empty() {
            return;
        }
        let mut state = self.inner.counters.lock();
        if state.graph.is_some() {
            self.inner
                .mark_inconsistent(&mut state, "transaction aborted with quota changes");
        }
        debug!(
            txn = txn.id(),
            rows = txn.batch.len(),
            extents = txn.delayed.len(),
            "qgroup.txn.aborted"
        );
    }

    /// Flushes dirty groups and the status row into `txn`.
    ///
    /// Also completes a pending enable, arming the initial rescan for after
    /// the commit.
    pub fn run_qgroups(&self, txn: &mut Transaction) {
        let inner = &self.inner;
        let _commit = inner.commit.lock();
        let generation = inner.tree.generation().saturating_add(1);
        inner.run_qgroups_locked(txn, generation);
    }

    /// Turns quota on.
    ///
    /// Stages STATUS (on, inconsistent) and a level-0 group for every
    /// subvolume root. Accounting starts when `txn` commits, together with a
    /// rescan that fills the new groups. Calling it while quota is already on
    /// only re-arms that step.
    pub fn enable(&self, txn: &mut Transaction) -> Result<()> {
        let inner = &self.inner;
        let _structural = inner.structural.lock();
        if inner.runtime.disabling() {
            return Err(QuotaError::InvalidState("quota is being disabled"));
        }
        let roots = inner.scanner.subvolume_roots()?;
        let stale = inner.tree.scan()?;
        let mut state = inner.counters.lock();
        if state.graph.is_some() {
            inner.runtime.set_enabling(true);
            return Ok(());
        }
        for (key, _) in stale {
            txn.batch.delete_raw(key);
        }
        let mut graph = QgroupGraph::new();
        for root in &roots {
            let slot = graph.get_or_create(QgroupId::for_root(*root));
            graph.mark_dirty(slot);
        }
        state.graph = Some(graph);
        state.flags = StatusFlags::default();
        state.flags.insert(STATUS_FLAG_ON | STATUS_FLAG_INCONSISTENT);
        state.rescan_cursor = 0;
        inner.runtime.set_enabling(true);
        info!(groups = roots.len(), txn = txn.id(), "qgroup.enable");
        Ok(())
    }

    /// Turns quota off and removes every quota row in `txn`.
    ///
    /// Blocks until a running rescan has exited and every in-flight
    /// accounting operation has drained; only then is the group graph torn
    /// down.
    pub fn disable(&self, txn: &mut Transaction) -> Result<()> {
        let inner = &self.inner;
        let _structural = inner.structural.lock();
        {
            // Same lock as the ENABLING transition in run_qgroups.
            let state = inner.counters.lock();
            if state.graph.is_none() {
                return Ok(());
            }
            inner.runtime.set_enabling(false);
            inner.runtime.set_enabled(false);
            inner.runtime.set_disabling(true);
        }
        inner.gate.begin_drain();
        info!(txn = txn.id(), "qgroup.disable.draining");

        let result = self.teardown(txn);

        inner.runtime.set_disabling(false);
        inner.gate.reopen();
        match &result {
            Ok(()) => info!(txn = txn.id(), rows = txn.batch.len(), "qgroup.disable"),
            Err(err) => warn!(error = %err, "qgroup.disable.failed"),
        }
        result
    }

    fn teardown(&self, txn: &mut Transaction) -> Result<()> {
        let inner = &self.inner;
        self.rescan_wait(false)?;
        inner.gate.wait_drained();
        {
            let mut state = inner.counters.lock();
            state.graph = None;
            state.flags = StatusFlags::default();
            state.rescan_cursor = 0;
        }
        txn.batch.clear();
        txn.delayed.clear();
        for (key, _) in inner.tree.scan()? {
            txn.batch.delete_raw(key);
        }
        Ok(())
    }

    /// Creates an empty group.
    pub fn create_group(&self, txn: &mut Transaction, id: QgroupId) -> Result<()> {
        let inner = &self.inner;
        let _structural = inner.structural.lock();
        let mut state = inner.counters.lock();
        let graph = state
            .graph
            .as_mut()
            .ok_or(QuotaError::InvalidState("quota is not enabled"))?;
        let slot = graph.create(id)?;
        graph.mark_dirty(slot);
        debug!(qgroup = %id, txn = txn.id(), "qgroup.create");
        Ok(())
    }

    /// Deletes a group that has no members.
    ///
    /// The group's own parent relations are removed first, each with a
    /// quick update of the parent totals.
    pub fn delete_group(&self, txn: &mut Transaction, id: QgroupId) -> Result<()> {
        let inner = &self.inner;
        let _structural = inner.structural.lock();
        let mut state = inner.counters.lock();
        let CounterState { graph, pass, .. } = &mut *state;
        let graph = graph
            .as_mut()
            .ok_or(QuotaError::InvalidState("quota is not enabled"))?;
        let group = graph.get(id).ok_or(QuotaError::NotFound("qgroup"))?;
        if group.has_members() {
            return Err(QuotaError::Busy(id));
        }
        let mut needs_rescan = None;
        for parent in graph.parents_of(id) {
            let (m, p) = graph.del_relation(id, parent)?;
            txn.batch.delete(QuotaKey::Relation(id, parent));
            txn.batch.delete(QuotaKey::Relation(parent, id));
            if let RelationOutcome::NeedsRescan(reason) =
                account::quick_update(graph, pass, m, p, false)
            {
                needs_rescan = Some(reason);
            }
        }
        graph.remove(id)?;
        txn.batch.delete(QuotaKey::Info(id));
        txn.batch.delete(QuotaKey::Limit(id));
        if let Some(reason) = needs_rescan {
            warn!(qgroup = %id, ?reason, "qgroup.delete.needs_rescan");
            inner.mark_inconsistent(&mut state, "group removal needs rescan");
        }
        debug!(qgroup = %id, txn = txn.id(), "qgroup.delete");
        Ok(())
    }

    /// Makes `member` a member of `parent`.
    pub fn add_relation(
        &self,
        txn: &mut Transaction,
        member: QgroupId,
        parent: QgroupId,
    ) -> Result<RelationOutcome> {
        self.change_relation(txn, member, parent, true)
    }

    /// Removes `member` from `parent`.
    pub fn del_relation(
        &self,
        txn: &mut Transaction,
        member: QgroupId,
        parent: QgroupId,
    ) -> Result<RelationOutcome> {
        self.change_relation(txn, member, parent, false)
    }

    fn change_relation(
        &self,
        txn: &mut Transaction,
        member: QgroupId,
        parent: QgroupId,
        adding: bool,
    ) -> Result<RelationOutcome> {
        let inner = &self.inner;
        let _structural = inner.structural.lock();
        let mut state = inner.counters.lock();
        let CounterState { graph, pass, .. } = &mut *state;
        let graph = graph
            .as_mut()
            .ok_or(QuotaError::InvalidState("quota is not enabled"))?;
        let (m, p) = if adding {
            let slots = graph.add_relation(member, parent)?;
            txn.batch.put(QuotaKey::Relation(member, parent), &RelationItem);
            txn.batch.put(QuotaKey::Relation(parent, member), &RelationItem);
            slots
        } else {
            let slots = graph.del_relation(member, parent)?;
            txn.batch.delete(QuotaKey::Relation(member, parent));
            txn.batch.delete(QuotaKey::Relation(parent, member));
            slots
        };
        let outcome = account::quick_update(graph, pass, m, p, adding);
        if let RelationOutcome::NeedsRescan(reason) = outcome {
            warn!(member = %member, parent = %parent, adding, ?reason, "qgroup.relation.needs_rescan");
            inner.mark_inconsistent(&mut state, "relation change needs rescan");
        }
        debug!(member = %member, parent = %parent, adding, txn = txn.id(), "qgroup.relation");
        Ok(outcome)
    }

    /// Returns a point-in-time view of the quota status.
    pub fn status(&self) -> QuotaStatus {
        let inner = &self.inner;
        let phase = inner.rescan.lock().phase;
        let state = inner.counters.lock();
        QuotaStatus {
            on: state.flags.is_on(),
            enabled: inner.runtime.enabled(),
            enabling: inner.runtime.enabling(),
            disabling: inner.runtime.disabling(),
            rescan: state.flags.is_rescanning(),
            inconsistent: state.flags.is_inconsistent(),
            flags: state.flags.bits(),
            generation: state.generation,
            rescan_cursor: state.rescan_cursor,
            rescan_phase: phase,
        }
    }

    /// Whether the counters are flagged as untrustworthy.
    pub fn is_inconsistent(&self) -> bool {
        self.inner.counters.lock().flags.is_inconsistent()
    }

    /// Returns a snapshot of one group.
    pub fn qgroup(&self, id: QgroupId) -> Option<QgroupInfo> {
        let state = self.inner.counters.lock();
        let graph = state.graph.as_ref()?;
        graph.get(id).map(|group| QgroupInfo::capture(graph, group))
    }

    /// Returns snapshots of every group in id order.
    pub fn qgroups(&self) -> Vec<QgroupInfo> {
        let state = self.inner.counters.lock();
        match state.graph.as_ref() {
            Some(graph) => graph
                .iter()
                .map(|group| QgroupInfo::capture(graph, group))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Stops the rescan worker, leaving any persisted rescan resumable.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.rescan_pause()?;
        info!("qgroup.shutdown");
        Ok(())
    }
}

pub(crate) fn redirty(graph: &mut QgroupGraph, ids: &[QgroupId]) {
    for id in ids {
        if let Some(slot) = graph.slot(*id) {
            graph.mark_dirty(slot);
        }
    }
}

impl EngineInner {
    /// Admits an accounting operation, or returns `None` while quota is off
    /// or being disabled.
    pub(crate) fn admit(&self) -> Option<OpGuard> {
        if !self.runtime.enabled() {
            return None;
        }
        let guard = self.gate.enter().ok()?;
        self.runtime.enabled().then_some(guard)
    }

    pub(crate) fn mark_inconsistent(&self, state: &mut CounterState, reason: &'static str) {
        if !state.flags.is_inconsistent() {
            warn!(reason, "qgroup.inconsistent");
        }
        state.flags.insert(STATUS_FLAG_INCONSISTENT);
        self.metrics.inconsistency(reason);
    }

    /// Stages INFO and LIMIT rows for every dirty group plus the STATUS row.
    /// Returns the flushed ids so a failed commit can re-dirty them.
    pub(crate) fn stage_flush(
        &self,
        state: &mut CounterState,
        generation: u64,
        batch: &mut QuotaBatch,
    ) -> Vec<QgroupId> {
        let Some(graph) = state.graph.as_mut() else {
            return Vec::new();
        };
        let dirty = graph.take_dirty();
        let mut flushed = Vec::with_capacity(dirty.len());
        for slot in dirty {
            let group = graph.node(slot);
            batch.put(QuotaKey::Info(group.id), &group.info_item(generation));
            batch.put(QuotaKey::Limit(group.id), &group.limit.to_item());
            flushed.push(group.id);
        }
        if state.flags.is_on() {
            batch.put(
                QuotaKey::Status,
                &StatusItem {
                    version: QUOTA_STATUS_VERSION,
                    generation,
                    flags: state.flags.bits(),
                    rescan: state.rescan_cursor,
                },
            );
        }
        flushed
    }

    pub(crate) fn run_qgroups_locked(&self, txn: &mut Transaction, generation: u64) {
        let worker_alive = self.rescan.lock().alive;
        let mut state = self.counters.lock();
        if state.graph.is_none() {
            return;
        }
        if self.runtime.enabling() && !self.runtime.disabling() {
            self.runtime.set_enabling(false);
            self.runtime.set_enabled(true);
            if !worker_alive {
                state.flags.insert(STATUS_FLAG_RESCAN);
                state.rescan_cursor = 0;
                if let Some(graph) = state.graph.as_mut() {
                    graph.reset_counters();
                }
                txn.start_rescan = true;
            }
            info!(txn = txn.id(), "qgroup.enabled");
        }
        let flushed = self.stage_flush(&mut state, generation, &mut txn.batch);
        txn.flushed.extend(flushed);
    }

    /// Commits a batch built outside a caller transaction, re-dirtying the
    /// flushed groups when the tree refuses it.
    pub(crate) fn commit_internal(
        &self,
        generation: u64,
        batch: &QuotaBatch,
        flushed: &[QgroupId],
    ) -> Result<()> {
        match self.tree.commit(generation, batch) {
            Ok(()) => {
                self.counters.lock().generation = generation;
                Ok(())
            }
            Err(err) => {
                let mut state = self.counters.lock();
                if let Some(graph) = state.graph.as_mut() {
                    redirty(graph, flushed);
                }
                Err(err)
            }
        }
    }
}
