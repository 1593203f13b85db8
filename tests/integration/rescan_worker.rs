#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sombra_qgroup::admin::reference_totals;
use sombra_qgroup::qgroup::{QuotaEngine, QuotaOptions, RescanPhase};
use sombra_qgroup::storage::MemQuotaTree;
use sombra_qgroup::testkit::{init_tracing, SimExtents, Workload};
use sombra_qgroup::types::{QgroupId, QuotaError, Result, RootId};

const ROOTS: [u64; 3] = [5, 6, 7];

fn slow_options() -> QuotaOptions {
    QuotaOptions::new().rescan_throttle(Duration::from_millis(5))
}

/// A world with `extents` committed extents, one per leaf.
fn populated(seed: u64, extents: usize) -> (Arc<SimExtents>, Workload) {
    init_tracing();
    let sim = Arc::new(SimExtents::with_leaf_items(1));
    let roots: Vec<RootId> = ROOTS.iter().map(|&r| RootId(r)).collect();
    for root in &roots {
        sim.add_subvolume(*root);
    }
    let mut workload = Workload::new(seed, roots);
    for _ in 0..extents {
        let (bytenr, num_bytes) = workload.extent();
        for root in workload.root_set() {
            sim.add_ref(bytenr, num_bytes, root);
        }
    }
    sim.publish();
    (sim, workload)
}

/// Opens an engine over `tree` and turns quota on; the initial rescan is left running.
fn enable(tree: Arc<MemQuotaTree>, sim: &Arc<SimExtents>, options: QuotaOptions) -> Result<QuotaEngine> {
    let engine = QuotaEngine::open(tree, sim.clone(), sim.clone(), options)?;
    let mut txn = engine.begin_transaction();
    engine.enable(&mut txn)?;
    let summary = engine.commit_transaction(txn)?;
    assert!(summary.rescan_started);
    Ok(engine)
}

fn assert_converged(engine: &QuotaEngine, sim: &SimExtents) {
    let status = engine.status();
    assert!(!status.rescan, "rescan flag still set");
    assert!(!status.inconsistent, "counters still flagged");
    assert_eq!(status.rescan_cursor, u64::MAX);
    let groups = engine.qgroups();
    let expected = reference_totals(&groups, &sim.committed_extents());
    for group in &groups {
        assert_eq!(
            (group.counters.rfer, group.counters.excl),
            expected[&group.id],
            "totals of {}",
            group.id
        );
    }
}

#[test]
fn pause_keeps_the_cursor_and_resume_finishes() -> Result<()> {
    let (sim, _) = populated(11, 60);
    let engine = enable(Arc::new(MemQuotaTree::new()), &sim, slow_options())?;

    engine.rescan_pause()?;
    let progress = engine.rescan_progress();
    assert_eq!(progress.phase, RescanPhase::Paused);
    assert!(progress.rescan_flag);
    assert!(progress.cursor < u64::MAX);
    assert!(engine.status().rescan);
    assert!(matches!(engine.rescan_start(), Err(QuotaError::AlreadyRunning)));

    engine.rescan_resume()?;
    engine.rescan_wait(false)?;
    let progress = engine.rescan_progress();
    assert_eq!(progress.phase, RescanPhase::Complete);
    assert!(progress.last_error.is_none());
    assert_converged(&engine, &sim);
    assert!(matches!(
        engine.rescan_resume(),
        Err(QuotaError::InvalidState(_))
    ));
    Ok(())
}

#[test]
fn live_changes_during_a_rescan_are_counted_once() -> Result<()> {
    let (sim, mut workload) = populated(23, 40);
    let engine = enable(Arc::new(MemQuotaTree::new()), &sim, slow_options())?;
    assert!(matches!(engine.rescan_start(), Err(QuotaError::AlreadyRunning)));

    let mut live = Vec::new();
    for round in 0..30u64 {
        let mut txn = engine.begin_transaction();
        if round % 3 == 0 && !live.is_empty() {
            let (bytenr, num_bytes) = live[(round as usize) % live.len()];
            for root in sim.current_roots(bytenr) {
                if workload.chance(0.5) {
                    sim.drop_ref(bytenr, root);
                }
            }
            engine.insert_dirty_extent(&mut txn, bytenr, num_bytes);
        } else {
            let (bytenr, num_bytes) = workload.extent();
            for root in workload.root_set() {
                sim.add_ref(bytenr, num_bytes, root);
            }
            engine.insert_dirty_extent(&mut txn, bytenr, num_bytes);
            live.push((bytenr, num_bytes));
        }
        engine.commit_transaction(txn)?;
        thread::sleep(Duration::from_millis(2));
    }

    engine.rescan_wait(false)?;
    assert_converged(&engine, &sim);
    Ok(())
}

#[test]
fn disable_waits_for_a_running_rescan() -> Result<()> {
    let (sim, _) = populated(31, 80);
    let tree = Arc::new(MemQuotaTree::new());
    let engine = enable(tree.clone(), &sim, slow_options())?;
    assert_eq!(engine.rescan_progress().phase, RescanPhase::Running);

    let mut txn = engine.begin_transaction();
    engine.disable(&mut txn)?;
    assert_ne!(engine.rescan_progress().phase, RescanPhase::Running);
    engine.commit_transaction(txn)?;

    let status = engine.status();
    assert!(!status.on && !status.enabled && !status.disabling);
    assert!(engine.qgroups().is_empty());
    assert_eq!(tree.row_count(), 0);

    let mut txn = engine.begin_transaction();
    engine.enable(&mut txn)?;
    engine.commit_transaction(txn)?;
    engine.rescan_wait(false)?;
    assert_converged(&engine, &sim);
    Ok(())
}

#[test]
fn interrupted_waiters_return_early() -> Result<()> {
    let (sim, _) = populated(47, 40);
    let options = QuotaOptions::new().rescan_throttle(Duration::from_millis(50));
    let engine = enable(Arc::new(MemQuotaTree::new()), &sim, options)?;

    let waiter = {
        let engine = engine.clone();
        thread::spawn(move || engine.rescan_wait(true))
    };
    while !waiter.is_finished() {
        engine.interrupt_rescan_waiters();
        thread::sleep(Duration::from_millis(10));
    }
    let result = waiter.join().expect("waiter thread");
    assert!(matches!(result, Err(QuotaError::Interrupted)));
    assert_eq!(engine.rescan_progress().phase, RescanPhase::Running);

    engine.rescan_pause()?;
    engine.rescan_resume()?;
    engine.interrupt_rescan_waiters();
    engine.rescan_wait(false)?;
    assert_converged(&engine, &sim);
    Ok(())
}

#[test]
fn reopen_after_a_crash_resumes_from_the_persisted_cursor() -> Result<()> {
    let (sim, _) = populated(59, 50);
    let tree = Arc::new(MemQuotaTree::new());
    let engine = enable(tree.clone(), &sim, slow_options())?;
    thread::sleep(Duration::from_millis(30));
    engine.rescan_pause()?;
    let cursor = engine.rescan_progress().cursor;
    let crashed = Arc::new(tree.fork());
    engine.shutdown()?;
    drop(engine);

    let reopened = QuotaEngine::open(
        crashed.clone(),
        sim.clone(),
        sim.clone(),
        QuotaOptions::new().auto_resume_rescan(false),
    )?;
    let progress = reopened.rescan_progress();
    assert_eq!(progress.phase, RescanPhase::Paused);
    assert_eq!(progress.cursor, cursor);
    assert!(reopened.status().on);

    reopened.rescan_resume()?;
    reopened.rescan_wait(false)?;
    assert_converged(&reopened, &sim);

    let again = QuotaEngine::open(crashed, sim.clone(), sim.clone(), QuotaOptions::new())?;
    again.rescan_wait(false)?;
    assert_eq!(again.rescan_progress().phase, RescanPhase::Idle);
    assert_converged(&again, &sim);
    Ok(())
}

#[test]
fn automatic_resume_on_open() -> Result<()> {
    let (sim, _) = populated(61, 30);
    let tree = Arc::new(MemQuotaTree::new());
    let engine = enable(tree.clone(), &sim, slow_options())?;
    engine.rescan_pause()?;
    engine.shutdown()?;
    drop(engine);

    let reopened = QuotaEngine::open(tree, sim.clone(), sim.clone(), QuotaOptions::new())?;
    reopened.rescan_wait(false)?;
    assert_eq!(reopened.rescan_progress().phase, RescanPhase::Complete);
    assert_converged(&reopened, &sim);
    Ok(())
}

#[test]
fn failed_step_abandons_the_rescan_until_restarted() -> Result<()> {
    let (sim, _) = populated(73, 20);
    let tree = Arc::new(MemQuotaTree::new());
    let engine = enable(tree.clone(), &sim, slow_options())?;
    engine.rescan_pause()?;

    tree.fail_next_commits(1);
    engine.rescan_resume()?;
    engine.rescan_wait(false)?;
    let progress = engine.rescan_progress();
    assert_eq!(progress.phase, RescanPhase::Idle);
    assert!(progress.last_error.is_some());
    let status = engine.status();
    assert!(!status.rescan);
    assert!(status.inconsistent);

    engine.rescan_start()?;
    engine.rescan_wait(false)?;
    assert_converged(&engine, &sim);
    let group = engine.qgroup(QgroupId::new(0, 5)).expect("level-0 group");
    assert!(group.parents.is_empty());
    Ok(())
}
