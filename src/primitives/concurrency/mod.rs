#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::types::{QuotaError, Result};

/// Admission gate counting in-flight operations so a teardown can drain them.
///
/// While draining, new entries are refused; `wait_drained` blocks until every
/// outstanding [`OpGuard`] has been dropped.
#[derive(Clone, Default)]
pub struct OpGate {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    state: Mutex<GateState>,
    drained: Condvar,
}

#[derive(Default, Debug)]
struct GateState {
    in_flight: u32,
    draining: bool,
}

/// Snapshot of gate state for observability.
#[derive(Default, Debug, Clone, Copy)]
pub struct GateSnapshot {
    /// Operations currently inside the gate.
    pub in_flight: u32,
    /// Whether the gate is refusing new entries.
    pub draining: bool,
}

/// Guard representing one admitted operation.
pub struct OpGuard {
    inner: Arc<GateInner>,
}

impl OpGate {
    /// Creates an open gate with nothing in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits one operation, or fails with `InvalidState` while draining.
    pub fn enter(&self) -> Result<OpGuard> {
        let mut state = self.inner.state.lock();
        if state.draining {
            return Err(QuotaError::InvalidState("quota is being disabled"));
        }
        state.in_flight = state.in_flight.saturating_add(1);
        Ok(OpGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Stops admitting new operations. Returns false if already draining.
    pub fn begin_drain(&self) -> bool {
        let mut state = self.inner.state.lock();
        !std::mem::replace(&mut state.draining, true)
    }

    /// Blocks until no admitted operation remains.
    pub fn wait_drained(&self) {
        let mut state = self.inner.state.lock();
        while state.in_flight > 0 {
            self.inner.drained.wait(&mut state);
        }
    }

    /// Re-opens the gate after a drain.
    pub fn reopen(&self) {
        self.inner.state.lock().draining = false;
    }

    /// Returns a snapshot of the current gate state.
    pub fn snapshot(&self) -> GateSnapshot {
        let state = self.inner.state.lock();
        GateSnapshot {
            in_flight: state.in_flight,
            draining: state.draining,
        }
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.inner.drained.notify_all();
        }
    }
}

/// One-shot latch that waiters can block on until it is set or reset.
#[derive(Clone, Default)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

#[derive(Default)]
struct CompletionInner {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Completion {
    /// Creates a latch in the completed state.
    pub fn completed() -> Self {
        let latch = Self::default();
        latch.complete();
        latch
    }

    /// Marks the latch pending again.
    pub fn reset(&self) {
        *self.inner.done.lock() = false;
    }

    /// Sets the latch and wakes every waiter.
    pub fn complete(&self) {
        *self.inner.done.lock() = true;
        self.inner.cv.notify_all();
    }

    /// Returns whether the latch is set.
    pub fn is_complete(&self) -> bool {
        *self.inner.done.lock()
    }

    /// Waits up to `timeout` for the latch. Returns whether it was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.inner.done.lock();
        if !*done {
            let _ = self.inner.cv.wait_for(&mut done, timeout);
        }
        *done
    }

    /// Wakes waiters without setting the latch.
    pub fn notify(&self) {
        self.inner.cv.notify_all();
    }
}
