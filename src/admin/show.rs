use serde::Serialize;

use crate::admin::Result;
use crate::qgroup::{QgroupInfo, QuotaEngine, QuotaStatus, RescanProgress};

/// Point-in-time listing of the quota state and every group.
#[derive(Debug, Clone, Serialize)]
pub struct ShowReport {
    /// Persisted and runtime status.
    pub status: QuotaStatus,
    /// Rescan worker progress.
    pub rescan: RescanProgress,
    /// Every group in id order.
    pub groups: Vec<QgroupInfo>,
    /// Aggregates over the level-0 groups.
    pub totals: ShowTotals,
}

/// Sums over the level-0 groups.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShowTotals {
    /// All groups.
    pub groups: usize,
    /// Level-0 groups.
    pub level0_groups: usize,
    /// Sum of level-0 referenced bytes.
    pub level0_rfer: u64,
    /// Sum of level-0 exclusive bytes.
    pub level0_excl: u64,
    /// Sum of level-0 reservations.
    pub reserved: u64,
}

impl ShowReport {
    /// Renders the report as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Collects status, rescan progress and every group of `engine`.
pub fn show(engine: &QuotaEngine) -> ShowReport {
    let status = engine.status();
    let rescan = engine.rescan_progress();
    let groups = engine.qgroups();
    let mut totals = ShowTotals {
        groups: groups.len(),
        ..ShowTotals::default()
    };
    for group in groups.iter().filter(|group| group.id.level == 0) {
        totals.level0_groups += 1;
        totals.level0_rfer = totals.level0_rfer.saturating_add(group.counters.rfer);
        totals.level0_excl = totals.level0_excl.saturating_add(group.counters.excl);
        totals.reserved = totals.reserved.saturating_add(group.reserved);
    }
    ShowReport {
        status,
        rescan,
        groups,
        totals,
    }
}
