#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use sombra_qgroup::qgroup::{
    CounterMetrics, DataReservation, MetaReservation, QgroupLimit, QuotaEngine, QuotaOptions,
};
use sombra_qgroup::storage::MemQuotaTree;
use sombra_qgroup::testkit::{init_tracing, SimExtents};
use sombra_qgroup::types::{LimitKind, QgroupId, QuotaError, Result, RootId};

const ROOT: RootId = RootId(5);

struct Ledger {
    sim: Arc<SimExtents>,
    engine: QuotaEngine,
    metrics: Arc<CounterMetrics>,
}

impl Ledger {
    fn new() -> Result<Self> {
        init_tracing();
        let sim = Arc::new(SimExtents::new());
        sim.add_subvolume(ROOT);
        let metrics = Arc::new(CounterMetrics::default());
        let engine = QuotaEngine::open(
            Arc::new(MemQuotaTree::new()),
            sim.clone(),
            sim.clone(),
            QuotaOptions::new().metrics(metrics.clone()),
        )?;
        let mut txn = engine.begin_transaction();
        engine.enable(&mut txn)?;
        engine.commit_transaction(txn)?;
        engine.rescan_wait(false)?;
        Ok(Self {
            sim,
            engine,
            metrics,
        })
    }

    fn reserved(&self) -> u64 {
        self.engine
            .qgroup(QgroupId::for_root(ROOT))
            .map(|g| g.reserved)
            .unwrap_or_default()
    }

    fn limit(&self, limit: QgroupLimit) -> Result<()> {
        let mut txn = self.engine.begin_transaction();
        self.engine
            .set_limit(&mut txn, QgroupId::for_root(ROOT), limit)?;
        self.engine.commit_transaction(txn)?;
        Ok(())
    }
}

#[test]
fn overlapping_data_ranges_are_reserved_once() -> Result<()> {
    let l = Ledger::new()?;
    let rsv = DataReservation::new(ROOT);
    assert_eq!(l.engine.reserve_data(&rsv, 0, 8192)?, 8192);
    assert_eq!(l.engine.reserve_data(&rsv, 4096, 8192)?, 4096);
    assert_eq!(l.engine.reserve_data(&rsv, 0, 12288)?, 0);
    assert_eq!(rsv.reserved_bytes(), 12288);
    assert_eq!(l.reserved(), 12288);

    assert_eq!(l.engine.free_data(&rsv, 0, 4096)?, 4096);
    assert_eq!(l.reserved(), 8192);
    assert_eq!(l.engine.free_data(&rsv, 0, 4096)?, 0, "already freed");

    assert_eq!(l.engine.release_data(&rsv, 4096, 4096)?, 4096);
    assert_eq!(l.reserved(), 8192, "released bytes wait for accounting");
    assert_eq!(rsv.reserved_bytes(), 4096);

    assert_eq!(l.engine.check_reserved_leak(&rsv), 4096);
    assert_eq!(l.reserved(), 4096);
    assert_eq!(rsv.reserved_bytes(), 0);
    assert_eq!(l.engine.check_reserved_leak(&rsv), 0);
    Ok(())
}

#[test]
fn refused_data_reservation_marks_nothing() -> Result<()> {
    let l = Ledger::new()?;
    l.limit(QgroupLimit::default().with_max_excl(10_000))?;
    let rsv = DataReservation::new(ROOT);
    assert_eq!(l.engine.reserve_data(&rsv, 0, 8192)?, 8192);
    let err = l.engine.reserve_data(&rsv, 8192, 4096).unwrap_err();
    assert!(matches!(
        err,
        QuotaError::QuotaExceeded {
            kind: LimitKind::Exclusive,
            ..
        }
    ));
    assert_eq!(rsv.reserved_bytes(), 8192);
    assert_eq!(l.reserved(), 8192);
    assert_eq!(l.metrics.reservations_refused.load(Ordering::Relaxed), 1);
    assert_eq!(l.metrics.reservations_granted.load(Ordering::Relaxed), 1);

    assert_eq!(l.engine.free_data(&rsv, 0, 8192)?, 8192);
    assert_eq!(l.engine.reserve_data(&rsv, 8192, 4096)?, 4096);
    Ok(())
}

#[test]
fn range_past_the_address_space_is_rejected() -> Result<()> {
    let l = Ledger::new()?;
    let rsv = DataReservation::new(ROOT);
    assert!(matches!(
        l.engine.reserve_data(&rsv, u64::MAX - 10, 100),
        Err(QuotaError::Invalid(_))
    ));
    assert_eq!(l.reserved(), 0);
    Ok(())
}

#[test]
fn committed_extent_consumes_the_reservation() -> Result<()> {
    let l = Ledger::new()?;
    let rsv = DataReservation::new(ROOT);
    assert_eq!(l.engine.reserve_data(&rsv, 0, 4096)?, 4096);
    assert_eq!(l.engine.release_data(&rsv, 0, 4096)?, 4096);

    l.sim.add_ref(1 << 20, 4096, ROOT);
    let mut txn = l.engine.begin_transaction();
    l.engine.insert_dirty_extent(&mut txn, 1 << 20, 4096);
    l.engine.commit_transaction(txn)?;

    let group = l.engine.qgroup(QgroupId::for_root(ROOT)).expect("group");
    assert_eq!(group.reserved, 0);
    assert_eq!((group.counters.rfer, group.counters.excl), (4096, 4096));
    assert_eq!(l.metrics.extents_accounted.load(Ordering::Relaxed), 1);
    Ok(())
}

#[test]
fn metadata_reservations_track_their_holder() -> Result<()> {
    let l = Ledger::new()?;
    let rsv = MetaReservation::new(ROOT);
    l.engine.reserve_meta(&rsv, 1000)?;
    l.engine.reserve_meta(&rsv, 1000)?;
    assert_eq!(rsv.reserved_bytes(), 2000);
    assert_eq!(l.reserved(), 2000);

    l.engine.free_meta(&rsv, 500);
    assert_eq!(rsv.reserved_bytes(), 1500);
    assert_eq!(l.reserved(), 1500);

    l.engine.free_meta(&rsv, 5000);
    assert_eq!(rsv.reserved_bytes(), 0);
    assert_eq!(l.reserved(), 0, "frees at most what the holder had");

    l.engine.reserve_meta(&rsv, 700)?;
    l.engine.free_meta_all(&rsv);
    assert_eq!(rsv.reserved_bytes(), 0);
    assert_eq!(l.reserved(), 0);

    l.limit(QgroupLimit::default().with_max_rfer(100))?;
    assert!(l.engine.reserve_meta(&rsv, 101).is_err());
    assert_eq!(rsv.reserved_bytes(), 0);
    Ok(())
}

#[test]
fn reservations_are_free_while_quota_is_off() -> Result<()> {
    init_tracing();
    let sim = Arc::new(SimExtents::new());
    let engine = QuotaEngine::open(
        Arc::new(MemQuotaTree::new()),
        sim.clone(),
        sim,
        QuotaOptions::new(),
    )?;
    let data = DataReservation::new(ROOT);
    assert_eq!(engine.reserve_data(&data, 0, 1 << 30)?, 0);
    assert_eq!(data.reserved_bytes(), 0);
    let meta = MetaReservation::new(ROOT);
    engine.reserve_meta(&meta, 1 << 30)?;
    assert_eq!(meta.reserved_bytes(), 0);
    assert_eq!(engine.check_reserved_leak(&data), 0);
    Ok(())
}
