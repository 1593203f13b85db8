#![forbid(unsafe_code)]
//! Background recomputation of every group's totals.
//!
//! The worker walks the committed extent tree in address order, one batch of
//! leaves per commit. Live accounting skips extents at or past the persisted
//! cursor, so each extent is counted exactly once by either side.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::account::{self, ReservationPolicy};
use super::backref::{ExtentItem, TimeSeq};
use super::status::{RescanPhase, STATUS_FLAG_INCONSISTENT, STATUS_FLAG_RESCAN};
use super::{CounterState, EngineInner, QuotaEngine};
use crate::primitives::concurrency::Completion;
use crate::storage::QuotaBatch;
use crate::types::{QuotaError, Result, RootSet};

const WAIT_POLL: Duration = Duration::from_millis(20);

pub(crate) struct RescanState {
    pub(crate) phase: RescanPhase,
    pub(crate) alive: bool,
    worker: Option<JoinHandle<()>>,
    completion: Completion,
    interrupt_epoch: u64,
    last_error: Option<String>,
    leaves: u64,
    items: u64,
}

impl Default for RescanState {
    fn default() -> Self {
        Self {
            phase: RescanPhase::Idle,
            alive: false,
            worker: None,
            completion: Completion::completed(),
            interrupt_epoch: 0,
            last_error: None,
            leaves: 0,
            items: 0,
        }
    }
}

/// Progress of the current or last rescan.
#[derive(Clone, Debug, Serialize)]
pub struct RescanProgress {
    /// Worker lifecycle phase.
    pub phase: RescanPhase,
    /// First address not yet covered.
    pub cursor: u64,
    /// Whether STATUS records a rescan in progress.
    pub rescan_flag: bool,
    /// Leaves processed by the current or last worker.
    pub leaves_scanned: u64,
    /// Extent items processed by the current or last worker.
    pub items_scanned: u64,
    /// Error that stopped the last worker.
    pub last_error: Option<String>,
}

enum Outcome {
    Completed,
    Paused,
    Failed(QuotaError),
}

impl QuotaEngine {
    /// Zeroes every counter and starts recomputing them in the background.
    ///
    /// Fails with `AlreadyRunning` while a rescan is running or recorded in
    /// STATUS; a recorded one is continued with [`QuotaEngine::rescan_resume`].
    pub fn rescan_start(&self) -> Result<()> {
        let inner = &self.inner;
        let Some(_guard) = inner.admit() else {
            return Err(QuotaError::InvalidState("quota is not enabled"));
        };
        if inner.closing.load(Ordering::SeqCst) {
            return Err(QuotaError::InvalidState("engine is shutting down"));
        }
        let _commit = inner.commit.lock();
        let mut rescan = inner.rescan.lock();
        if rescan.alive {
            return Err(QuotaError::AlreadyRunning);
        }
        let generation = inner.tree.generation().saturating_add(1);
        let mut batch = QuotaBatch::new();
        let flushed = {
            let mut state = inner.counters.lock();
            if !state.flags.is_on() || state.graph.is_none() {
                return Err(QuotaError::InvalidState("quota is not enabled"));
            }
            if state.flags.is_rescanning() {
                return Err(QuotaError::AlreadyRunning);
            }
            state.flags.insert(STATUS_FLAG_RESCAN);
            state.rescan_cursor = 0;
            if let Some(graph) = state.graph.as_mut() {
                graph.reset_counters();
            }
            inner.stage_flush(&mut state, generation, &mut batch)
        };
        if let Err(err) = inner.commit_internal(generation, &batch, &flushed) {
            let mut state = inner.counters.lock();
            state.flags.remove(STATUS_FLAG_RESCAN);
            inner.mark_inconsistent(&mut state, "rescan start not persisted");
            warn!(error = %err, "qgroup.rescan.start_failed");
            return Err(err);
        }
        inner.spawn_rescan_worker(&mut rescan)?;
        info!(generation, "qgroup.rescan.started");
        Ok(())
    }

    /// Asks the worker to stop after its current step and waits for it.
    ///
    /// STATUS keeps the rescan flag and cursor, so the rescan can be resumed,
    /// including after a reopen.
    pub fn rescan_pause(&self) -> Result<()> {
        self.inner.pause_rescan.store(true, Ordering::SeqCst);
        self.rescan_wait(false)
    }

    /// Restarts the worker from the persisted cursor.
    pub fn rescan_resume(&self) -> Result<()> {
        let inner = &self.inner;
        let Some(_guard) = inner.admit() else {
            return Err(QuotaError::InvalidState("quota is not enabled"));
        };
        if inner.closing.load(Ordering::SeqCst) {
            return Err(QuotaError::InvalidState("engine is shutting down"));
        }
        let _commit = inner.commit.lock();
        let mut rescan = inner.rescan.lock();
        if rescan.alive {
            return Err(QuotaError::AlreadyRunning);
        }
        let cursor = {
            let state = inner.counters.lock();
            if !state.flags.is_rescanning() {
                return Err(QuotaError::InvalidState("no rescan to resume"));
            }
            state.rescan_cursor
        };
        inner.spawn_rescan_worker(&mut rescan)?;
        info!(cursor, "qgroup.rescan.resumed");
        Ok(())
    }

    /// Blocks until the worker has exited. Returns at once when none runs.
    ///
    /// An `interruptible` wait returns `Interrupted` when
    /// [`QuotaEngine::interrupt_rescan_waiters`] is called meanwhile.
    pub fn rescan_wait(&self, interruptible: bool) -> Result<()> {
        let inner = &self.inner;
        let (completion, epoch) = {
            let rescan = inner.rescan.lock();
            (rescan.completion.clone(), rescan.interrupt_epoch)
        };
        while !completion.wait_timeout(WAIT_POLL) {
            if interruptible && inner.rescan.lock().interrupt_epoch != epoch {
                return Err(QuotaError::Interrupted);
            }
        }
        let handle = {
            let mut rescan = inner.rescan.lock();
            if rescan.alive {
                None
            } else {
                rescan.worker.take()
            }
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("qgroup.rescan.worker_panicked");
            }
        }
        Ok(())
    }

    /// Wakes every interruptible [`QuotaEngine::rescan_wait`] caller.
    pub fn interrupt_rescan_waiters(&self) {
        let mut rescan = self.inner.rescan.lock();
        rescan.interrupt_epoch = rescan.interrupt_epoch.wrapping_add(1);
        rescan.completion.notify();
    }

    /// Reports the phase and position of the rescan.
    pub fn rescan_progress(&self) -> RescanProgress {
        let rescan = self.inner.rescan.lock();
        let state = self.inner.counters.lock();
        RescanProgress {
            phase: rescan.phase,
            cursor: state.rescan_cursor,
            rescan_flag: state.flags.is_rescanning(),
            leaves_scanned: rescan.leaves,
            items_scanned: rescan.items,
            last_error: rescan.last_error.clone(),
        }
    }
}

impl EngineInner {
    /// Caller holds the rescan lock and has checked that no worker is alive.
    pub(crate) fn spawn_rescan_worker(self: &Arc<Self>, rescan: &mut RescanState) -> Result<()> {
        if let Some(previous) = rescan.worker.take() {
            let _ = previous.join();
        }
        self.pause_rescan.store(false, Ordering::SeqCst);
        rescan.completion.reset();
        rescan.alive = true;
        rescan.phase = RescanPhase::Running;
        rescan.last_error = None;
        rescan.leaves = 0;
        rescan.items = 0;
        let engine = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("qgroup-rescan".into())
            .spawn(move || engine.run_rescan_worker());
        match spawned {
            Ok(handle) => {
                rescan.worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                rescan.alive = false;
                rescan.phase = RescanPhase::Idle;
                rescan.completion.complete();
                error!(error = %err, "qgroup.rescan.spawn_failed");
                Err(QuotaError::Io(err))
            }
        }
    }

    fn run_rescan_worker(self: Arc<Self>) {
        let outcome = loop {
            if self.pause_rescan.load(Ordering::SeqCst) || self.closing.load(Ordering::SeqCst) {
                break Outcome::Paused;
            }
            match self.rescan_step() {
                Ok(true) => {}
                Ok(false) => break Outcome::Completed,
                Err(err) => break Outcome::Failed(err),
            }
            if !self.options.rescan_throttle.is_zero() {
                thread::sleep(self.options.rescan_throttle);
            }
        };
        self.finish_rescan(outcome);
    }

    /// Processes one batch of leaves and commits the result. Returns whether
    /// more leaves remain.
    fn rescan_step(&self) -> Result<bool> {
        let _commit = self.commit.lock();
        if !self.runtime.enabled() {
            return Err(QuotaError::Interrupted);
        }
        let cursor = {
            let state = self.counters.lock();
            if state.graph.is_none() || !state.flags.is_rescanning() {
                return Err(QuotaError::Interrupted);
            }
            state.rescan_cursor
        };

        let mut work: Vec<Vec<(ExtentItem, RootSet)>> = Vec::new();
        let mut next = cursor;
        let mut exhausted = false;
        for _ in 0..self.options.rescan_leaf_batch {
            if next == u64::MAX {
                exhausted = true;
                break;
            }
            let Some(leaf) = self.scanner.next_leaf(next)? else {
                exhausted = true;
                break;
            };
            let Some(last) = leaf.last_bytenr() else {
                exhausted = true;
                break;
            };
            let mut resolved = Vec::with_capacity(leaf.items.len());
            for item in leaf.items {
                let roots = self.resolver.find_all_roots(item.bytenr, TimeSeq::Live)?;
                resolved.push((item, roots));
            }
            work.push(resolved);
            next = last.saturating_add(1);
        }

        let generation = self.tree.generation().saturating_add(1);
        let mut batch = QuotaBatch::new();
        let items: usize = work.iter().map(Vec::len).sum();
        let flushed = {
            let mut state = self.counters.lock();
            let CounterState { graph, pass, .. } = &mut *state;
            let Some(graph) = graph.as_mut() else {
                return Err(QuotaError::Interrupted);
            };
            let empty = RootSet::new();
            for leaf in &work {
                for (item, roots) in leaf {
                    account::account_extent(
                        graph,
                        pass,
                        item.num_bytes,
                        &empty,
                        roots,
                        ReservationPolicy::Keep,
                    )?;
                }
                self.metrics.rescan_leaf(leaf.len());
            }
            state.rescan_cursor = if exhausted { u64::MAX } else { next };
            if exhausted {
                state.flags.remove(STATUS_FLAG_RESCAN);
                state.flags.remove(STATUS_FLAG_INCONSISTENT);
            }
            self.stage_flush(&mut state, generation, &mut batch)
        };
        self.commit_internal(generation, &batch, &flushed)?;
        {
            let mut rescan = self.rescan.lock();
            rescan.leaves += work.len() as u64;
            rescan.items += items as u64;
        }
        debug!(
            from = cursor,
            to = next,
            leaves = work.len(),
            items,
            exhausted,
            "qgroup.rescan.step"
        );
        Ok(!exhausted)
    }

    fn finish_rescan(&self, outcome: Outcome) {
        let (phase, last_error) = match outcome {
            Outcome::Completed => (RescanPhase::Complete, None),
            Outcome::Paused => (RescanPhase::Paused, None),
            Outcome::Failed(err) => {
                if matches!(err, QuotaError::Interrupted) {
                    info!("qgroup.rescan.interrupted");
                } else {
                    warn!(error = %err, "qgroup.rescan.failed");
                }
                self.abandon_rescan();
                (RescanPhase::Idle, Some(err.to_string()))
            }
        };
        let mut rescan = self.rescan.lock();
        match phase {
            RescanPhase::Complete => {
                info!(leaves = rescan.leaves, items = rescan.items, "qgroup.rescan.completed")
            }
            RescanPhase::Paused => info!(leaves = rescan.leaves, "qgroup.rescan.paused"),
            _ => {}
        }
        rescan.phase = phase;
        rescan.last_error = last_error;
        rescan.alive = false;
        rescan.completion.complete();
    }

    /// Clears the rescan flag after a failure and persists the now
    /// inconsistent status when quota is still on.
    fn abandon_rescan(&self) {
        let _commit = self.commit.lock();
        let generation = self.tree.generation().saturating_add(1);
        let mut batch = QuotaBatch::new();
        let flushed = {
            let mut state = self.counters.lock();
            state.flags.remove(STATUS_FLAG_RESCAN);
            if state.graph.is_none() {
                return;
            }
            self.mark_inconsistent(&mut state, "rescan failed");
            if !self.runtime.enabled() {
                return;
            }
            self.stage_flush(&mut state, generation, &mut batch)
        };
        if let Err(err) = self.commit_internal(generation, &batch, &flushed) {
            error!(error = %err, "qgroup.rescan.status_persist_failed");
        }
    }
}
