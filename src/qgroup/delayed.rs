#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use super::account::{self, ReservationPolicy};
use super::backref::TimeSeq;
use super::{CounterState, EngineInner, QuotaEngine};
use crate::storage::QuotaBatch;
use crate::types::{QgroupId, Result, RootId, RootSet};

/// An extent whose ownership changed in the running transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirtyExtent {
    /// Start address.
    pub bytenr: u64,
    /// Length in bytes.
    pub num_bytes: u64,
    /// Roots resolved against the committed state, once prepared.
    pub old_roots: Option<RootSet>,
}

/// Dirty extents of one transaction, keyed and deduplicated by address.
#[derive(Debug, Default)]
pub(crate) struct DelayedExtents {
    records: BTreeMap<u64, DirtyExtent>,
    skip_root: Option<RootId>,
}

impl DelayedExtents {
    /// Records an extent. Returns `false` when one at `bytenr` already exists.
    pub(crate) fn insert(&mut self, bytenr: u64, num_bytes: u64) -> bool {
        if self.records.contains_key(&bytenr) {
            return false;
        }
        self.records.insert(
            bytenr,
            DirtyExtent {
                bytenr,
                num_bytes,
                old_roots: None,
            },
        );
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
        self.skip_root = None;
    }

    fn take(&mut self) -> BTreeMap<u64, DirtyExtent> {
        std::mem::take(&mut self.records)
    }

    fn filter(&self, mut roots: RootSet) -> RootSet {
        if let Some(skip) = self.skip_root {
            roots.remove(&skip);
        }
        roots
    }
}

/// Unit of work against the quota tree.
///
/// Collects row changes and dirty extents; nothing reaches the tree until
/// [`QuotaEngine::commit_transaction`].
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    pub(crate) batch: QuotaBatch,
    pub(crate) delayed: DelayedExtents,
    pub(crate) start_rescan: bool,
    pub(crate) flushed: Vec<QgroupId>,
}

impl Transaction {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            batch: QuotaBatch::new(),
            delayed: DelayedExtents::default(),
            start_rescan: false,
            flushed: Vec::new(),
        }
    }

    /// Transaction number, unique per engine.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Rows staged so far.
    pub fn batch(&self) -> &QuotaBatch {
        &self.batch
    }

    /// Dirty extents waiting for accounting, in address order.
    pub fn dirty_extents(&self) -> impl Iterator<Item = &DirtyExtent> {
        self.delayed.records.values()
    }
}

/// Outcome of accounting one transaction's dirty extents.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct AccountSummary {
    /// Extents whose transition was applied.
    pub accounted: usize,
    /// Extents left to the rescan or dropped because quota is off.
    pub skipped: usize,
    /// Extents that could not be accounted.
    pub failed: usize,
}

/// Outcome of [`QuotaEngine::commit_transaction`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CommitSummary {
    /// Generation the tree now carries.
    pub generation: u64,
    /// Dirty-extent accounting results.
    pub accounting: AccountSummary,
    /// Rows written or deleted.
    pub rows_written: usize,
    /// Whether the commit started the initial rescan.
    pub rescan_started: bool,
}

impl QuotaEngine {
    /// Records that the extent at `bytenr` changed ownership in `txn`.
    ///
    /// Returns `false` when quota is off, the extent is empty, or the
    /// address is already recorded in this transaction.
    pub fn insert_dirty_extent(&self, txn: &mut Transaction, bytenr: u64, num_bytes: u64) -> bool {
        if bytenr == 0 || num_bytes == 0 || !self.inner.runtime.enabled() {
            return false;
        }
        txn.delayed.insert(bytenr, num_bytes)
    }

    /// Excludes `root` from both root sets of every extent in `txn`.
    ///
    /// Used while a root is being dropped: its references are about to go
    /// away and must not be counted in either direction.
    pub fn set_skip_root(&self, txn: &mut Transaction, root: Option<RootId>) {
        txn.delayed.skip_root = root;
    }

    /// Resolves the pre-change roots of every dirty extent against the
    /// committed state.
    pub fn prepare_account_extents(&self, txn: &mut Transaction) -> Result<()> {
        let Some(_guard) = self.inner.admit() else {
            return Ok(());
        };
        for record in txn.delayed.records.values_mut() {
            if record.old_roots.is_none() {
                let roots = self
                    .inner
                    .resolver
                    .find_all_roots(record.bytenr, TimeSeq::Live)?;
                record.old_roots = Some(roots);
            }
        }
        Ok(())
    }

    /// Applies the ownership transition of one extent to every reached
    /// group. Returns the number of groups whose counters changed.
    ///
    /// A no-op while quota is off or when a running rescan has not yet
    /// reached `bytenr`.
    pub fn account_extent(
        &self,
        bytenr: u64,
        num_bytes: u64,
        old_roots: &RootSet,
        new_roots: &RootSet,
    ) -> Result<usize> {
        let Some(_guard) = self.inner.admit() else {
            return Ok(0);
        };
        let changed = self.inner.apply_extent(
            bytenr,
            num_bytes,
            old_roots,
            new_roots,
            ReservationPolicy::Consume,
        )?;
        Ok(changed.unwrap_or(0))
    }

    /// Accounts every dirty extent of `txn` and empties its list.
    ///
    /// Failures flag the counters inconsistent and are reported in the
    /// summary rather than returned.
    pub fn account_all_pending_extents(&self, txn: &mut Transaction) -> AccountSummary {
        let _commit = self.inner.commit.lock();
        self.inner.account_pending_locked(txn)
    }
}

impl EngineInner {
    /// Applies one transition under the counter lock. `None` means the
    /// extent was skipped.
    pub(crate) fn apply_extent(
        &self,
        bytenr: u64,
        num_bytes: u64,
        old_roots: &RootSet,
        new_roots: &RootSet,
        policy: ReservationPolicy,
    ) -> Result<Option<usize>> {
        let mut state = self.counters.lock();
        if !self.runtime.enabled() {
            return Ok(None);
        }
        if state.flags.is_rescanning() && bytenr >= state.rescan_cursor {
            self.metrics.extent_skipped();
            return Ok(None);
        }
        let CounterState { graph, pass, .. } = &mut *state;
        let Some(graph) = graph.as_mut() else {
            return Ok(None);
        };
        match account::account_extent(graph, pass, num_bytes, old_roots, new_roots, policy) {
            Ok(changed) => {
                self.metrics.extent_accounted(changed);
                debug!(
                    bytenr,
                    num_bytes,
                    nr_old = old_roots.len(),
                    nr_new = new_roots.len(),
                    changed,
                    "qgroup.account.extent"
                );
                Ok(Some(changed))
            }
            Err(err) => {
                warn!(bytenr, num_bytes, error = %err, "qgroup.account.failed");
                self.mark_inconsistent(&mut state, "accounting pass failed");
                Err(err)
            }
        }
    }

    /// Caller holds the commit lock.
    pub(crate) fn account_pending_locked(&self, txn: &mut Transaction) -> AccountSummary {
        let records = txn.delayed.take();
        let mut summary = AccountSummary::default();
        if records.is_empty() {
            return summary;
        }
        let Some(_guard) = self.admit() else {
            summary.skipped = records.len();
            return summary;
        };
        for record in records.into_values() {
            let old = match record.old_roots {
                Some(roots) => Ok(roots),
                None => self.resolver.find_all_roots(record.bytenr, TimeSeq::Live),
            };
            let new = self
                .resolver
                .find_all_roots(record.bytenr, TimeSeq::InTransaction);
            let (old, new) = match (old, new) {
                (Ok(old), Ok(new)) => (txn.delayed.filter(old), txn.delayed.filter(new)),
                (Err(err), _) | (_, Err(err)) => {
                    warn!(bytenr = record.bytenr, error = %err, "qgroup.account.resolve_failed");
                    self.mark_inconsistent(&mut self.counters.lock(), "backref resolution failed");
                    summary.failed += 1;
                    continue;
                }
            };
            match self.apply_extent(
                record.bytenr,
                record.num_bytes,
                &old,
                &new,
                ReservationPolicy::Consume,
            ) {
                Ok(Some(_)) => summary.accounted += 1,
                Ok(None) => summary.skipped += 1,
                Err(_) => summary.failed += 1,
            }
        }
        debug!(
            txn = txn.id(),
            accounted = summary.accounted,
            skipped = summary.skipped,
            failed = summary.failed,
            "qgroup.account.pending"
        );
        summary
    }
}
