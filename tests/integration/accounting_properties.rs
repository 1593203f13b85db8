#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use sombra_qgroup::admin::reference_totals;
use sombra_qgroup::qgroup::{QuotaEngine, QuotaOptions};
use sombra_qgroup::storage::MemQuotaTree;
use sombra_qgroup::testkit::{init_tracing, SimExtents, Workload};
use sombra_qgroup::types::{QgroupId, Result, RootId};

const ROOTS: [u64; 4] = [5, 6, 7, 8];
const LEVEL1: [u64; 2] = [1, 2];

struct Case {
    sim: Arc<SimExtents>,
    engine: QuotaEngine,
    workload: Workload,
    extents: Vec<(u64, u64)>,
}

impl Case {
    /// Builds an engine whose hierarchy is drawn from `layout`: one bit per
    /// (root, level-1 group) membership plus one bit per level-1 group under 2/1.
    fn new(seed: u64, layout: u16) -> Result<Self> {
        init_tracing();
        let sim = Arc::new(SimExtents::with_leaf_items(3));
        let roots: Vec<RootId> = ROOTS.iter().map(|&r| RootId(r)).collect();
        for root in &roots {
            sim.add_subvolume(*root);
        }
        let engine = QuotaEngine::open(
            Arc::new(MemQuotaTree::new()),
            sim.clone(),
            sim.clone(),
            QuotaOptions::new(),
        )?;
        let mut txn = engine.begin_transaction();
        engine.enable(&mut txn)?;
        engine.commit_transaction(txn)?;
        engine.rescan_wait(false)?;

        let top = QgroupId::new(2, 1);
        let mut txn = engine.begin_transaction();
        engine.create_group(&mut txn, top)?;
        let mut bit = 0;
        for &subid in &LEVEL1 {
            let group = QgroupId::new(1, subid);
            engine.create_group(&mut txn, group)?;
            for &root in &ROOTS {
                if layout & (1 << bit) != 0 {
                    engine.add_relation(&mut txn, QgroupId::new(0, root), group)?;
                }
                bit += 1;
            }
        }
        for &subid in &LEVEL1 {
            if layout & (1 << bit) != 0 {
                engine.add_relation(&mut txn, QgroupId::new(1, subid), top)?;
            }
            bit += 1;
        }
        engine.commit_transaction(txn)?;
        assert!(!engine.is_inconsistent());

        Ok(Self {
            sim,
            engine,
            workload: Workload::new(seed, roots),
            extents: Vec::new(),
        })
    }

    /// Applies one transaction of one to three random ownership changes.
    fn round(&mut self) -> Result<()> {
        let mut txn = self.engine.begin_transaction();
        let changes = 1 + (self.workload.chance(0.5) as usize) + (self.workload.chance(0.5) as usize);
        for _ in 0..changes {
            if self.extents.is_empty() || self.workload.chance(0.4) {
                let (bytenr, num_bytes) = self.workload.extent();
                for root in self.workload.root_set() {
                    self.sim.add_ref(bytenr, num_bytes, root);
                }
                self.extents.push((bytenr, num_bytes));
                self.engine.insert_dirty_extent(&mut txn, bytenr, num_bytes);
                continue;
            }
            let pick = self.workload.extent().0 as usize % self.extents.len();
            let (bytenr, num_bytes) = self.extents[pick];
            let root = self.workload.root();
            if self.workload.chance(0.5) {
                self.sim.add_ref(bytenr, num_bytes, root);
            } else {
                self.sim.drop_ref(bytenr, root);
            }
            self.engine.insert_dirty_extent(&mut txn, bytenr, num_bytes);
        }
        self.engine.commit_transaction(txn)?;
        Ok(())
    }

    fn totals(&self) -> BTreeMap<QgroupId, (u64, u64)> {
        self.engine
            .qgroups()
            .into_iter()
            .map(|g| (g.id, (g.counters.rfer, g.counters.excl)))
            .collect()
    }

    fn expected(&self) -> BTreeMap<QgroupId, (u64, u64)> {
        reference_totals(&self.engine.qgroups(), &self.sim.committed_extents())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn incremental_totals_match_a_full_recount(
        seed in any::<u64>(),
        layout in any::<u16>(),
        rounds in 1usize..40,
    ) {
        let mut case = Case::new(seed, layout).unwrap();
        for _ in 0..rounds {
            case.round().unwrap();
        }
        prop_assert!(!case.engine.is_inconsistent());
        prop_assert_eq!(case.totals(), case.expected());
    }

    #[test]
    fn reaccounting_unchanged_extents_is_a_noop(
        seed in any::<u64>(),
        layout in any::<u16>(),
        rounds in 1usize..20,
    ) {
        let mut case = Case::new(seed, layout).unwrap();
        for _ in 0..rounds {
            case.round().unwrap();
        }
        let before = case.totals();
        let mut txn = case.engine.begin_transaction();
        for &(bytenr, num_bytes) in &case.extents {
            case.engine.insert_dirty_extent(&mut txn, bytenr, num_bytes);
        }
        case.engine.commit_transaction(txn).unwrap();
        prop_assert_eq!(case.totals(), before);
    }

    #[test]
    fn rescan_reproduces_incremental_totals(
        seed in any::<u64>(),
        layout in any::<u16>(),
        rounds in 1usize..30,
    ) {
        let mut case = Case::new(seed, layout).unwrap();
        for _ in 0..rounds {
            case.round().unwrap();
        }
        let incremental = case.totals();
        case.engine.rescan_start().unwrap();
        case.engine.rescan_wait(false).unwrap();
        prop_assert!(!case.engine.status().rescan);
        prop_assert_eq!(case.totals(), incremental);
    }
}

#[test]
fn seeded_workloads_converge_after_relation_changes() -> Result<()> {
    for seed in [3u64, 17, 29, 101] {
        let mut case = Case::new(seed, 0b11_0101_1010)?;
        for _ in 0..25 {
            case.round()?;
        }
        let mut txn = case.engine.begin_transaction();
        case.engine
            .add_relation(&mut txn, QgroupId::new(0, 8), QgroupId::new(1, 1))
            .or_else(|_| case.engine.del_relation(&mut txn, QgroupId::new(0, 8), QgroupId::new(1, 1)))?;
        case.engine.commit_transaction(txn)?;
        if case.engine.is_inconsistent() {
            case.engine.rescan_start()?;
            case.engine.rescan_wait(false)?;
        }
        assert!(!case.engine.is_inconsistent(), "seed {seed}");
        assert_eq!(case.totals(), case.expected(), "seed {seed}");
    }
    Ok(())
}
