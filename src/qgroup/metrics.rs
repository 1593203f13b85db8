use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for observing quota accounting activity.
///
/// Implementations receive one call per accounted extent, reservation
/// decision, rescan leaf and inconsistency event. Calls happen on hot paths,
/// sometimes while the counter lock is held, so they must be cheap.
pub trait QuotaMetrics: Send + Sync {
    /// Records one extent run through transition accounting.
    ///
    /// # Parameters
    /// * `groups_changed` - Number of groups whose counters moved.
    fn extent_accounted(&self, groups_changed: usize);

    /// Records an extent skipped because a rescan will cover it.
    fn extent_skipped(&self);

    /// Records a reservation attempt.
    ///
    /// # Parameters
    /// * `granted` - Whether the reservation fit within every limit.
    fn reservation(&self, granted: bool);

    /// Records one leaf processed by the rescan worker.
    fn rescan_leaf(&self, items: usize);

    /// Records that counters were flagged inconsistent.
    fn inconsistency(&self, reason: &'static str);
}

/// A no-op implementation of [`QuotaMetrics`] that discards all recorded metrics.
#[derive(Default)]
pub struct NoopMetrics;

impl QuotaMetrics for NoopMetrics {
    fn extent_accounted(&self, _groups_changed: usize) {}
    fn extent_skipped(&self) {}
    fn reservation(&self, _granted: bool) {}
    fn rescan_leaf(&self, _items: usize) {}
    fn inconsistency(&self, _reason: &'static str) {}
}

/// A thread-safe counter-based implementation of [`QuotaMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Extents run through transition accounting.
    pub extents_accounted: AtomicU64,

    /// Extents skipped behind the rescan cursor.
    pub extents_skipped: AtomicU64,

    /// Total group counter updates across all extents.
    pub group_updates: AtomicU64,

    /// Reservations granted.
    pub reservations_granted: AtomicU64,

    /// Reservations refused by a limit.
    pub reservations_refused: AtomicU64,

    /// Leaves processed by rescans.
    pub rescan_leaves: AtomicU64,

    /// Extent items processed by rescans.
    pub rescan_items: AtomicU64,

    /// Times counters were flagged inconsistent.
    pub inconsistencies: AtomicU64,
}

impl QuotaMetrics for CounterMetrics {
    fn extent_accounted(&self, groups_changed: usize) {
        self.extents_accounted.fetch_add(1, Ordering::Relaxed);
        self.group_updates
            .fetch_add(groups_changed as u64, Ordering::Relaxed);
    }

    fn extent_skipped(&self) {
        self.extents_skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn reservation(&self, granted: bool) {
        if granted {
            self.reservations_granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reservations_refused.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn rescan_leaf(&self, items: usize) {
        self.rescan_leaves.fetch_add(1, Ordering::Relaxed);
        self.rescan_items.fetch_add(items as u64, Ordering::Relaxed);
    }

    fn inconsistency(&self, _reason: &'static str) {
        self.inconsistencies.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics sink.
pub fn default_metrics() -> Arc<dyn QuotaMetrics> {
    Arc::new(NoopMetrics)
}
