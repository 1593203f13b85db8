#![allow(missing_docs)]

use std::sync::Arc;

use sombra_qgroup::admin::{show, verify, AdminError, VerifyLevel, VerifySeverity};
use sombra_qgroup::qgroup::{QuotaEngine, QuotaOptions};
use sombra_qgroup::storage::MemQuotaTree;
use sombra_qgroup::testkit::{init_tracing, SimExtents};
use sombra_qgroup::types::{QgroupId, RootId, RootSet};

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

fn settled(roots: &[u64]) -> Result<(Arc<SimExtents>, QuotaEngine), AdminError> {
    init_tracing();
    let sim = Arc::new(SimExtents::new());
    for &root in roots {
        sim.add_subvolume(RootId(root));
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
    Ok((sim, engine))
}

fn write(engine: &QuotaEngine, sim: &SimExtents, bytenr: u64, num_bytes: u64, roots: &[u64]) -> Result<(), AdminError> {
    for &root in roots {
        sim.add_ref(bytenr, num_bytes, RootId(root));
    }
    let mut txn = engine.begin_transaction();
    engine.insert_dirty_extent(&mut txn, bytenr, num_bytes);
    engine.commit_transaction(txn)?;
    Ok(())
}

#[test]
fn show_lists_groups_and_level0_totals() -> TestResult {
    let (sim, engine) = settled(&[5, 6])?;
    write(&engine, &sim, 4096, 100, &[5])?;
    write(&engine, &sim, 8192, 50, &[5, 6])?;
    let mut txn = engine.begin_transaction();
    engine.create_group(&mut txn, QgroupId::new(1, 1))?;
    engine.commit_transaction(txn)?;
    engine.reserve(RootId(6), 10)?;

    let report = show(&engine);
    assert!(report.status.on);
    assert_eq!(report.totals.groups, 3);
    assert_eq!(report.totals.level0_groups, 2);
    assert_eq!(report.totals.level0_rfer, 200);
    assert_eq!(report.totals.level0_excl, 100);
    assert_eq!(report.totals.reserved, 10);

    let json = report.to_json()?;
    let value: serde_json::Value = serde_json::from_str(&json)?;
    assert_eq!(value["groups"][0]["id"], "0/5");
    assert_eq!(value["groups"][2]["id"], "1/1");
    assert_eq!(value["rescan"]["phase"], "complete");
    assert_eq!(value["status"]["inconsistent"], false);
    Ok(())
}

#[test]
fn full_verify_agrees_with_settled_counters() -> TestResult {
    let (sim, engine) = settled(&[5, 6])?;
    write(&engine, &sim, 4096, 100, &[5])?;
    write(&engine, &sim, 8192, 50, &[5, 6])?;
    write(&engine, &sim, 12288, 70, &[6])?;
    let mut txn = engine.begin_transaction();
    engine.create_group(&mut txn, QgroupId::new(1, 1))?;
    engine.add_relation(&mut txn, QgroupId::new(0, 6), QgroupId::new(1, 1))?;
    engine.commit_transaction(txn)?;
    engine.rescan_start()?;
    engine.rescan_wait(false)?;

    let fast = verify(&engine, sim.as_ref(), sim.as_ref(), VerifyLevel::Fast)?;
    assert!(fast.success, "{:?}", fast.findings);
    assert_eq!(fast.counts.groups, 3);
    assert_eq!(fast.counts.relations, 1);
    assert_eq!(fast.counts.extents_scanned, 0);

    let full = verify(&engine, sim.as_ref(), sim.as_ref(), VerifyLevel::Full)?;
    assert!(full.success, "{:?}", full.findings);
    assert!(full.findings.is_empty());
    assert_eq!(full.counts.extents_scanned, 3);
    assert_eq!(full.counts.bytes_scanned, 220);
    assert_eq!(full.counts.mismatched_groups, 0);
    let json = serde_json::to_string(&full)?;
    assert!(json.contains("\"level\":\"full\""));
    Ok(())
}

#[test]
fn full_verify_reports_drifted_counters() -> TestResult {
    let (sim, engine) = settled(&[5])?;
    write(&engine, &sim, 4096, 100, &[5])?;
    let phantom: RootSet = [RootId(5)].into_iter().collect();
    engine.account_extent(1 << 40, 500, &RootSet::new(), &phantom)?;

    let report = verify(&engine, sim.as_ref(), sim.as_ref(), VerifyLevel::Full)?;
    assert!(!report.success);
    assert_eq!(report.counts.mismatched_groups, 1);
    let finding = &report.findings[0];
    assert_eq!(finding.severity, VerifySeverity::Error);
    assert!(finding.message.contains("0/5"));
    assert!(finding.message.contains("rfer=600"));
    Ok(())
}

#[test]
fn untrusted_counters_downgrade_mismatches_to_warnings() -> TestResult {
    let (sim, engine) = settled(&[5, 6])?;
    write(&engine, &sim, 4096, 100, &[5, 6])?;
    let mut txn = engine.begin_transaction();
    engine.create_group(&mut txn, QgroupId::new(1, 1))?;
    engine.add_relation(&mut txn, QgroupId::new(0, 5), QgroupId::new(1, 1))?;
    engine.commit_transaction(txn)?;
    assert!(engine.is_inconsistent());

    let report = verify(&engine, sim.as_ref(), sim.as_ref(), VerifyLevel::Full)?;
    assert!(report.success);
    assert_eq!(report.counts.mismatched_groups, 1);
    assert!(report
        .findings
        .iter()
        .all(|f| f.severity == VerifySeverity::Warning));
    Ok(())
}

#[test]
fn verify_requires_quota() -> TestResult {
    init_tracing();
    let sim = Arc::new(SimExtents::new());
    let engine = QuotaEngine::open(
        Arc::new(MemQuotaTree::new()),
        sim.clone(),
        sim.clone(),
        QuotaOptions::new(),
    )?;
    let result = verify(&engine, sim.as_ref(), sim.as_ref(), VerifyLevel::Fast);
    assert!(matches!(result, Err(AdminError::Message(_))));
    Ok(())
}
