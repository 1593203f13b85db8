#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Persisted status flag: quota tracking is on.
pub const STATUS_FLAG_ON: u64 = 1 << 0;
/// Persisted status flag: a rescan owns the counters beyond its cursor.
pub const STATUS_FLAG_RESCAN: u64 = 1 << 1;
/// Persisted status flag: counters may be stale until a rescan completes.
pub const STATUS_FLAG_INCONSISTENT: u64 = 1 << 2;

const STATUS_FLAG_MASK: u64 = STATUS_FLAG_ON | STATUS_FLAG_RESCAN | STATUS_FLAG_INCONSISTENT;

/// Persisted status flags.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct StatusFlags(u64);

impl StatusFlags {
    /// Builds flags from persisted bits, dropping unknown ones.
    pub fn from_bits(bits: u64) -> Self {
        Self(bits & STATUS_FLAG_MASK)
    }

    /// Raw bits for persistence.
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Returns whether every bit of `flag` is set.
    pub fn contains(self, flag: u64) -> bool {
        self.0 & flag == flag
    }

    /// Sets `flag`.
    pub fn insert(&mut self, flag: u64) {
        self.0 |= flag & STATUS_FLAG_MASK;
    }

    /// Clears `flag`.
    pub fn remove(&mut self, flag: u64) {
        self.0 &= !flag;
    }

    /// Whether quota tracking is on.
    pub fn is_on(self) -> bool {
        self.contains(STATUS_FLAG_ON)
    }

    /// Whether a rescan is recorded as in progress.
    pub fn is_rescanning(self) -> bool {
        self.contains(STATUS_FLAG_RESCAN)
    }

    /// Whether counters are flagged as untrustworthy.
    pub fn is_inconsistent(self) -> bool {
        self.contains(STATUS_FLAG_INCONSISTENT)
    }
}

impl fmt::Display for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.is_on() {
            names.push("on");
        }
        if self.is_rescanning() {
            names.push("rescan");
        }
        if self.is_inconsistent() {
            names.push("inconsistent");
        }
        if names.is_empty() {
            f.write_str("off")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

const RUNTIME_ENABLED: u8 = 1 << 0;
const RUNTIME_ENABLING: u8 = 1 << 1;
const RUNTIME_DISABLING: u8 = 1 << 2;

/// Runtime-only lifecycle flags; never persisted.
#[derive(Default)]
pub(crate) struct RuntimeFlags(AtomicU8);

impl RuntimeFlags {
    pub(crate) fn enabled(&self) -> bool {
        self.0.load(Ordering::Acquire) & RUNTIME_ENABLED != 0
    }

    pub(crate) fn enabling(&self) -> bool {
        self.0.load(Ordering::Acquire) & RUNTIME_ENABLING != 0
    }

    pub(crate) fn disabling(&self) -> bool {
        self.0.load(Ordering::Acquire) & RUNTIME_DISABLING != 0
    }

    pub(crate) fn set_enabled(&self, on: bool) {
        self.set(RUNTIME_ENABLED, on);
    }

    pub(crate) fn set_enabling(&self, on: bool) {
        self.set(RUNTIME_ENABLING, on);
    }

    pub(crate) fn set_disabling(&self, on: bool) {
        self.set(RUNTIME_DISABLING, on);
    }

    fn set(&self, bit: u8, on: bool) {
        if on {
            self.0.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.0.fetch_and(!bit, Ordering::AcqRel);
        }
    }
}

/// Lifecycle phase of the rescan worker.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RescanPhase {
    /// No rescan has run since open, or the last one stopped on an error.
    #[default]
    Idle,
    /// Worker is scanning leaves.
    Running,
    /// Worker stopped on request; the persisted cursor allows resuming.
    Paused,
    /// Last rescan finished the whole extent space.
    Complete,
}

/// Point-in-time view of the quota status.
#[derive(Clone, Debug, Serialize)]
pub struct QuotaStatus {
    /// Quota on (persisted).
    pub on: bool,
    /// Accounting active for this session.
    pub enabled: bool,
    /// Enable staged, waiting for the next commit.
    pub enabling: bool,
    /// Disable in progress.
    pub disabling: bool,
    /// Rescan recorded as in progress (persisted).
    pub rescan: bool,
    /// Counters flagged as untrustworthy (persisted).
    pub inconsistent: bool,
    /// Raw persisted flag bits.
    pub flags: u64,
    /// Generation of the last commit that touched quota state.
    pub generation: u64,
    /// Rescan progress cursor.
    pub rescan_cursor: u64,
    /// Rescan worker phase.
    pub rescan_phase: RescanPhase,
}
