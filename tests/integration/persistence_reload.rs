#![allow(missing_docs)]

use std::sync::Arc;

use sombra_qgroup::qgroup::{
    QgroupInfo, QgroupLimit, QuotaEngine, QuotaOptions, STATUS_FLAG_ON, STATUS_FLAG_RESCAN,
};
use sombra_qgroup::storage::items::seal;
use sombra_qgroup::storage::{
    read_row, FileQuotaTree, InfoItem, LimitItem, MemQuotaTree, QuotaKey, QuotaTree, RelationItem,
    StatusItem, QUOTA_STATUS_VERSION,
};
use sombra_qgroup::testkit::{init_tracing, SimExtents};
use sombra_qgroup::types::{QgroupId, Result, RootId};
use tempfile::tempdir;

fn sim_with(roots: &[u64]) -> Arc<SimExtents> {
    init_tracing();
    let sim = Arc::new(SimExtents::new());
    for &root in roots {
        sim.add_subvolume(RootId(root));
    }
    sim
}

fn open(tree: Arc<dyn QuotaTree>, sim: &Arc<SimExtents>) -> Result<QuotaEngine> {
    QuotaEngine::open(tree, sim.clone(), sim.clone(), QuotaOptions::new())
}

fn snapshot(groups: &[QgroupInfo]) -> String {
    serde_json::to_string(groups).expect("serialize groups")
}

fn raw_row<V: sombra_qgroup::storage::ValCodec>(key: QuotaKey, value: &V) -> (Vec<u8>, Vec<u8>) {
    let encoded = key.to_bytes();
    let sealed = seal(&encoded, value);
    (encoded, sealed)
}

fn status_row(version: u64, generation: u64, flags: u64) -> (Vec<u8>, Vec<u8>) {
    raw_row(
        QuotaKey::Status,
        &StatusItem {
            version,
            generation,
            flags,
            rescan: u64::MAX,
        },
    )
}

#[test]
fn file_tree_reopen_restores_groups_relations_and_limits() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("quota.tree");
    let sim = sim_with(&[5, 6]);

    let before = {
        let tree = Arc::new(FileQuotaTree::open(&path)?);
        let engine = open(tree, &sim)?;
        let mut txn = engine.begin_transaction();
        engine.enable(&mut txn)?;
        engine.commit_transaction(txn)?;
        engine.rescan_wait(false)?;

        sim.add_ref(4096, 1000, RootId(5));
        sim.add_ref(8192, 500, RootId(5));
        sim.add_ref(8192, 500, RootId(6));
        let mut txn = engine.begin_transaction();
        engine.insert_dirty_extent(&mut txn, 4096, 1000);
        engine.insert_dirty_extent(&mut txn, 8192, 500);
        engine.create_group(&mut txn, QgroupId::new(1, 1))?;
        engine.set_limit(
            &mut txn,
            QgroupId::new(1, 1),
            QgroupLimit::default().with_max_rfer(1 << 20).with_max_excl(1 << 19),
        )?;
        engine.commit_transaction(txn)?;

        let mut txn = engine.begin_transaction();
        engine.add_relation(&mut txn, QgroupId::new(0, 6), QgroupId::new(1, 1))?;
        engine.commit_transaction(txn)?;
        assert!(engine.is_inconsistent(), "0/6 shares an extent");
        engine.rescan_start()?;
        engine.rescan_wait(false)?;
        assert!(!engine.is_inconsistent());
        engine.shutdown()?;
        snapshot(&engine.qgroups())
    };

    let tree = Arc::new(FileQuotaTree::open(&path)?);
    let generation = tree.generation();
    let engine = open(tree.clone(), &sim)?;
    let status = engine.status();
    assert!(status.on && status.enabled);
    assert!(!status.inconsistent && !status.rescan);
    assert_eq!(status.generation, generation);
    assert_eq!(snapshot(&engine.qgroups()), before);

    let parent = engine.qgroup(QgroupId::new(1, 1)).expect("parent group");
    assert_eq!(parent.members, vec![QgroupId::new(0, 6)]);
    assert_eq!((parent.counters.rfer, parent.counters.excl), (500, 0));
    assert_eq!(parent.limit.max_rfer, 1 << 20);

    let info: Option<InfoItem> = read_row(tree.as_ref(), QuotaKey::Info(QgroupId::new(0, 5)))?;
    assert_eq!(info.map(|i| (i.rfer, i.excl)), Some((1500, 1000)));
    let relation: Option<RelationItem> = read_row(
        tree.as_ref(),
        QuotaKey::Relation(QgroupId::new(1, 1), QgroupId::new(0, 6)),
    )?;
    assert!(relation.is_some(), "both directions are stored");
    Ok(())
}

#[test]
fn status_from_another_version_leaves_quota_off() -> Result<()> {
    let sim = sim_with(&[5]);
    let tree = Arc::new(MemQuotaTree::new());
    let (key, value) = status_row(QUOTA_STATUS_VERSION + 1, 0, STATUS_FLAG_ON);
    tree.insert_raw(key, value);
    let (key, value) = raw_row(QuotaKey::Info(QgroupId::new(0, 5)), &InfoItem::default());
    tree.insert_raw(key, value);

    let engine = open(tree, &sim)?;
    assert!(!engine.status().on);
    assert!(engine.qgroups().is_empty());
    Ok(())
}

#[test]
fn status_from_another_generation_flags_inconsistent() -> Result<()> {
    let sim = sim_with(&[5]);
    let tree = Arc::new(MemQuotaTree::new());
    let (key, value) = status_row(QUOTA_STATUS_VERSION, 7, STATUS_FLAG_ON);
    tree.insert_raw(key, value);
    let (key, value) = raw_row(
        QuotaKey::Info(QgroupId::new(0, 5)),
        &InfoItem {
            generation: 7,
            rfer: 42,
            rfer_cmpr: 42,
            excl: 42,
            excl_cmpr: 42,
        },
    );
    tree.insert_raw(key, value);

    let engine = open(tree, &sim)?;
    let status = engine.status();
    assert!(status.on && status.inconsistent);
    let group = engine.qgroup(QgroupId::new(0, 5)).expect("loaded group");
    assert_eq!(group.counters.rfer, 42);
    Ok(())
}

#[test]
fn damaged_status_row_leaves_quota_off() -> Result<()> {
    let sim = sim_with(&[5]);
    let tree = Arc::new(MemQuotaTree::new());
    let (key, mut value) = status_row(QUOTA_STATUS_VERSION, 0, STATUS_FLAG_ON);
    value[0] ^= 0x5A;
    tree.insert_raw(key, value);

    let engine = open(tree, &sim)?;
    assert!(!engine.status().on);
    Ok(())
}

#[test]
fn limit_without_info_and_orphan_relations_are_tolerated() -> Result<()> {
    let sim = sim_with(&[5]);
    let tree = Arc::new(MemQuotaTree::new());
    let rows = [
        status_row(QUOTA_STATUS_VERSION, 0, STATUS_FLAG_ON),
        raw_row(QuotaKey::Info(QgroupId::new(0, 5)), &InfoItem::default()),
        raw_row(
            QuotaKey::Limit(QgroupId::new(1, 9)),
            &LimitItem {
                flags: 1,
                max_rfer: 4096,
                ..LimitItem::default()
            },
        ),
        raw_row(
            QuotaKey::Relation(QgroupId::new(0, 8), QgroupId::new(1, 8)),
            &RelationItem,
        ),
        raw_row(
            QuotaKey::Relation(QgroupId::new(0, 5), QgroupId::new(1, 9)),
            &RelationItem,
        ),
    ];
    for (key, value) in rows {
        tree.insert_raw(key, value);
    }

    let engine = open(tree, &sim)?;
    let status = engine.status();
    assert!(status.on);
    assert!(status.inconsistent, "limit row without info");
    let limited = engine.qgroup(QgroupId::new(1, 9)).expect("created from limit");
    assert_eq!(limited.limit.max_rfer, 4096);
    assert_eq!(limited.members, vec![QgroupId::new(0, 5)]);
    assert!(engine.qgroup(QgroupId::new(0, 8)).is_none());
    assert_eq!(engine.qgroups().len(), 2);
    Ok(())
}

#[test]
fn recorded_rescan_without_auto_resume_waits_for_the_caller() -> Result<()> {
    let sim = sim_with(&[5]);
    sim.add_ref(4096, 100, RootId(5));
    sim.publish();
    let tree = Arc::new(MemQuotaTree::new());
    let (key, value) = raw_row(
        QuotaKey::Status,
        &StatusItem {
            version: QUOTA_STATUS_VERSION,
            generation: 0,
            flags: STATUS_FLAG_ON | STATUS_FLAG_RESCAN,
            rescan: 0,
        },
    );
    tree.insert_raw(key, value);
    let (key, value) = raw_row(QuotaKey::Info(QgroupId::new(0, 5)), &InfoItem::default());
    tree.insert_raw(key, value);

    let engine = QuotaEngine::open(
        tree,
        sim.clone(),
        sim.clone(),
        QuotaOptions::new().auto_resume_rescan(false),
    )?;
    assert!(engine.status().rescan);
    let group = engine.qgroup(QgroupId::new(0, 5)).expect("group");
    assert_eq!(group.counters.rfer, 0);

    engine.rescan_resume()?;
    engine.rescan_wait(false)?;
    let group = engine.qgroup(QgroupId::new(0, 5)).expect("group");
    assert_eq!((group.counters.rfer, group.counters.excl), (100, 100));
    assert!(!engine.status().rescan);
    Ok(())
}
