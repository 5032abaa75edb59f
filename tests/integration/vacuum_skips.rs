#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use heapvac::storage::{
    Cluster, ClusterOptions, CreateIndex, CreateRelation, Database, KeySpec, RelKind,
};
use heapvac::types::{RelId, Result, RoleId, VacError};
use heapvac::vacuum::{vacuum, RelationOutcome, VacuumConfig, VacuumOptions, WarningKind};

const OWNER: RoleId = RoleId(10);

fn setup() -> Result<(Cluster, Arc<Database>, RelId)> {
    let cluster = Cluster::in_memory(
        ClusterOptions::default()
            .page_size(1024)
            .lock_timeout(Duration::from_millis(50)),
    )?;
    let db = cluster.create_database("app", OWNER)?;
    let session = cluster.session(OWNER, false);
    let rel = db.create_relation(&session, CreateRelation::table("orders"))?;
    let tx = db.begin(&session);
    for key in 0..40u64 {
        let mut row = key.to_be_bytes().to_vec();
        row.resize(32, b'o');
        let tid = tx.insert(rel, &row)?;
        if key % 2 == 0 {
            tx.delete(rel, tid)?;
        }
    }
    tx.commit()?;
    Ok((cluster, db, rel))
}

#[test]
fn stranger_cannot_vacuum_and_watermarks_hold() -> Result<()> {
    let (cluster, db, rel) = setup()?;
    let before = cluster.database_stats().get(db.id()).expect("row");
    let stranger = cluster.session(RoleId(77), false);
    let report = vacuum(
        &cluster,
        &db,
        &stranger,
        &VacuumOptions::lazy(),
        &VacuumConfig::default(),
    )?;
    let entry = report.relation(rel).expect("report entry");
    assert_eq!(entry.outcome, RelationOutcome::Skipped);
    assert_eq!(report.warnings_of(WarningKind::PermissionDenied).count(), 1);
    assert!(!report.watermarks_advanced);
    assert_eq!(report.history_truncated, 0);
    assert_eq!(cluster.database_stats().get(db.id()), Some(before));
    Ok(())
}

#[test]
fn database_owner_may_vacuum_tables_of_other_roles() -> Result<()> {
    let (cluster, db, _) = setup()?;
    let other = cluster.session(RoleId(55), false);
    let theirs = db.create_relation(&other, CreateRelation::table("theirs"))?;
    let owner = cluster.session(OWNER, false);
    let report = vacuum(
        &cluster,
        &db,
        &owner,
        &VacuumOptions::lazy().relation("theirs"),
        &VacuumConfig::default(),
    )?;
    assert_eq!(
        report.relation(theirs).expect("report entry").outcome,
        RelationOutcome::Vacuumed
    );
    Ok(())
}

#[test]
fn index_and_view_names_are_rejected_with_a_warning() -> Result<()> {
    let (cluster, db, rel) = setup()?;
    let session = cluster.session(OWNER, true);
    db.create_index(
        &session,
        rel,
        CreateIndex {
            name: "orders_pkey".into(),
            key: KeySpec { offset: 0, len: 8 },
            predicate: None,
            primary: true,
        },
    )?;
    db.create_relation(&session, CreateRelation::table("recent").kind(RelKind::View))?;
    for name in ["orders_pkey", "recent"] {
        let report = vacuum(
            &cluster,
            &db,
            &session,
            &VacuumOptions::lazy().relation(name),
            &VacuumConfig::default(),
        )?;
        assert_eq!(report.warnings_of(WarningKind::WrongKind).count(), 1, "{name}");
        assert_eq!(report.relations[0].outcome, RelationOutcome::Skipped);
    }
    Ok(())
}

#[test]
fn temporary_table_of_another_session_is_skipped() -> Result<()> {
    let (cluster, db, rel) = setup()?;
    let creator = cluster.session(OWNER, true);
    let temp = db.create_relation(&creator, CreateRelation::table("scratch").temporary(true))?;
    let other = cluster.session(OWNER, true);
    let report = vacuum(
        &cluster,
        &db,
        &other,
        &VacuumOptions::lazy(),
        &VacuumConfig::default(),
    )?;
    assert_eq!(
        report.relation(temp).expect("report entry").outcome,
        RelationOutcome::Skipped
    );
    assert_eq!(
        report.relation(rel).expect("report entry").outcome,
        RelationOutcome::Vacuumed
    );
    assert_eq!(report.warnings_of(WarningKind::OtherSessionTemp).count(), 1);
    assert!(!report.watermarks_advanced);

    let own = vacuum(
        &cluster,
        &db,
        &creator,
        &VacuumOptions::lazy().relation("scratch"),
        &VacuumConfig::default(),
    )?;
    assert_eq!(
        own.relation(temp).expect("report entry").outcome,
        RelationOutcome::Vacuumed
    );
    Ok(())
}

#[test]
fn full_vacuum_skips_relation_held_by_a_writer_but_lazy_proceeds() -> Result<()> {
    let (cluster, db, rel) = setup()?;
    let writer = cluster.session(OWNER, true);
    let open = db.begin(&writer);
    open.insert(rel, &[7u8; 32])?;

    let session = cluster.session(OWNER, true);
    let full = vacuum(
        &cluster,
        &db,
        &session,
        &VacuumOptions::full(),
        &VacuumConfig::default(),
    )?;
    assert_eq!(
        full.relation(rel).expect("report entry").outcome,
        RelationOutcome::Skipped
    );
    assert_eq!(full.warnings_of(WarningKind::LockNotAcquired).count(), 1);
    assert!(!full.watermarks_advanced);

    let lazy = vacuum(
        &cluster,
        &db,
        &session,
        &VacuumOptions::lazy(),
        &VacuumConfig::default(),
    )?;
    let entry = lazy.relation(rel).expect("report entry");
    assert_eq!(entry.outcome, RelationOutcome::Vacuumed);
    assert_eq!(entry.removed, 20);
    open.commit()?;
    Ok(())
}

#[test]
fn cancelled_session_stops_the_run() -> Result<()> {
    let (cluster, db, _) = setup()?;
    let session = cluster.session(OWNER, true);
    session.cancel_token().cancel();
    let err = vacuum(
        &cluster,
        &db,
        &session,
        &VacuumOptions::full(),
        &VacuumConfig::default(),
    )
    .expect_err("cancelled");
    assert!(matches!(err, VacError::Cancelled));
    Ok(())
}

#[test]
fn unknown_relation_name_is_an_error() -> Result<()> {
    let (cluster, db, _) = setup()?;
    let session = cluster.session(OWNER, true);
    let err = vacuum(
        &cluster,
        &db,
        &session,
        &VacuumOptions::lazy().relation("missing"),
        &VacuumConfig::default(),
    )
    .expect_err("unknown relation");
    assert!(matches!(err, VacError::NotFound(_)));
    Ok(())
}

#[test]
fn overflow_relation_is_vacuumed_with_its_table() -> Result<()> {
    let (cluster, db, _) = setup()?;
    let session = cluster.session(OWNER, true);
    let docs = db.create_relation(&session, CreateRelation::table("docs").with_toast(true))?;
    let toast = db
        .catalog()
        .get(docs)
        .and_then(|def| def.toast_relid)
        .expect("toast relation");
    let tx = db.begin(&session);
    let chunk = tx.insert(toast, &[1u8; 48])?;
    tx.delete(toast, chunk)?;
    tx.commit()?;

    let report = vacuum(
        &cluster,
        &db,
        &session,
        &VacuumOptions::full().relation("docs"),
        &VacuumConfig::default(),
    )?;
    let entry = report.relation(toast).expect("toast entry");
    assert_eq!(entry.outcome, RelationOutcome::Vacuumed);
    assert_eq!(entry.removed, 1);
    Ok(())
}
