#![allow(missing_docs)]

use std::path::Path;

use heapvac::storage::{Cluster, ClusterOptions, CreateIndex, CreateRelation, KeySpec};
use heapvac::types::{Result, RoleId};
use heapvac::vacuum::{vacuum, VacuumConfig, VacuumOptions};
use tempfile::tempdir;

fn options() -> ClusterOptions {
    ClusterOptions::default()
        .page_size(1024)
        .create_if_missing(true)
}

fn row(key: u64) -> Vec<u8> {
    let mut bytes = key.to_be_bytes().to_vec();
    bytes.resize(32, b'w');
    bytes
}

/// Creates `app.items` with 64 rows, every other one deleted, and returns
/// without a checkpoint.
fn populate(root: &Path) -> Result<()> {
    let cluster = Cluster::open(root, options())?;
    let db = cluster.create_database("app", RoleId(10))?;
    let session = cluster.session(RoleId(10), true);
    let rel = db.create_relation(&session, CreateRelation::table("items"))?;
    db.create_index(
        &session,
        rel,
        CreateIndex {
            name: "items_pkey".into(),
            key: KeySpec { offset: 0, len: 8 },
            predicate: None,
            primary: true,
        },
    )?;
    let tx = db.begin(&session);
    let tids: Vec<_> = (0..64).map(|k| tx.insert(rel, &row(k))).collect::<Result<_>>()?;
    tx.commit()?;
    let tx = db.begin(&session);
    for tid in tids.iter().step_by(2) {
        tx.delete(rel, *tid)?;
    }
    tx.commit()?;
    Ok(())
}

fn live_keys(cluster: &Cluster) -> Result<Vec<u64>> {
    let db = cluster.database("app").expect("database");
    let heap = db.relation_by_name("items")?;
    let mut keys: Vec<u64> = heap
        .committed_rows(db.xact())?
        .into_iter()
        .map(|(_, payload)| {
            let mut key = [0u8; 8];
            key.copy_from_slice(&payload[..8]);
            u64::from_be_bytes(key)
        })
        .collect();
    keys.sort_unstable();
    Ok(keys)
}

#[test]
fn committed_writes_replay_after_crash() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    populate(dir.path())?;

    let reopened = Cluster::open(dir.path(), options())?;
    assert!(reopened.recovery_stats().records > 0);
    let expected: Vec<u64> = (0..64).filter(|k| k % 2 == 1).collect();
    assert_eq!(live_keys(&reopened)?, expected);
    Ok(())
}

#[test]
fn full_vacuum_survives_crash_before_checkpoint() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    populate(dir.path())?;
    let (pages_after, expected) = {
        let cluster = Cluster::open(dir.path(), options())?;
        let db = cluster.database("app").expect("database");
        let session = cluster.session(RoleId(10), true);
        let report = vacuum(
            &cluster,
            &db,
            &session,
            &VacuumOptions::full(),
            &VacuumConfig::default(),
        )?;
        let rel = db.relation_by_name("items")?.id();
        let entry = report.relation(rel).expect("report entry");
        assert_eq!(entry.removed, 32);
        (entry.pages_after, live_keys(&cluster)?)
        // dropped without a checkpoint
    };

    let reopened = Cluster::open(dir.path(), options())?;
    assert_eq!(live_keys(&reopened)?, expected);
    let db = reopened.database("app").expect("database");
    let heap = db.relation_by_name("items")?;
    assert_eq!(heap.file().nblocks(), pages_after);
    assert_eq!(heap.indexes()[0].tids().len(), expected.len());

    let session = reopened.session(RoleId(10), true);
    let again = vacuum(
        &reopened,
        &db,
        &session,
        &VacuumOptions::full(),
        &VacuumConfig::default(),
    )?;
    let entry = again.relation(heap.id()).expect("report entry");
    assert_eq!(entry.removed, 0);
    assert_eq!(entry.moved, 0);
    Ok(())
}

#[test]
fn history_truncation_and_watermarks_persist() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    populate(dir.path())?;
    let (oldest, watermarks) = {
        let cluster = Cluster::open(dir.path(), options())?;
        let db = cluster.database("app").expect("database");
        let session = cluster.session(RoleId(10), true);
        let report = vacuum(
            &cluster,
            &db,
            &session,
            &VacuumOptions::lazy(),
            &VacuumConfig::default(),
        )?;
        assert!(report.watermarks_advanced);
        assert!(report.history_truncated > 0);
        (
            cluster.xact().oldest_retained(),
            cluster.database_stats().get(db.id()),
        )
    };

    let reopened = Cluster::open(dir.path(), options())?;
    let db = reopened.database("app").expect("database");
    assert_eq!(reopened.xact().oldest_retained(), oldest);
    assert_eq!(reopened.database_stats().get(db.id()), watermarks);
    Ok(())
}
