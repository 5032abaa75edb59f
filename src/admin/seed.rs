use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::{open_cluster, open_database};
use crate::admin::{AdminError, Result};
use crate::storage::database::{CreateIndex, CreateRelation};
use crate::storage::index::KeySpec;

/// Shape of the demo table written by [`seed_demo`].
#[derive(Clone, Debug)]
pub struct SeedOptions {
    /// Table name.
    pub table: String,
    /// Rows inserted.
    pub rows: usize,
    /// Payload width of each row in bytes; the first eight hold the key.
    pub row_width: usize,
    /// Delete every n-th row after loading (0 keeps all).
    pub delete_every: usize,
    /// Update every n-th surviving row once (0 updates none).
    pub update_every: usize,
    /// Build a primary-key index on the row key.
    pub with_index: bool,
}

impl Default for SeedOptions {
    fn default() -> Self {
        Self {
            table: "demo".to_string(),
            rows: 1_000,
            row_width: 64,
            delete_every: 2,
            update_every: 5,
            with_index: true,
        }
    }
}

/// Counts of what [`seed_demo`] wrote.
#[derive(Debug, Clone, Serialize)]
pub struct SeedReport {
    /// Qualified table name.
    pub table: String,
    /// Rows inserted.
    pub inserted: usize,
    /// Rows deleted afterwards.
    pub deleted: usize,
    /// Rows updated afterwards.
    pub updated: usize,
    /// Heap pages after loading.
    pub nblocks: u32,
}

/// Populates a table with rows and leaves dead versions behind for vacuum to
/// find. Each phase (load, delete, update) commits separately.
///
/// # Errors
///
/// Returns an error if the table already exists or any write fails.
pub fn seed_demo(
    path: impl AsRef<Path>,
    opts: &AdminOpenOptions,
    seed: &SeedOptions,
) -> Result<SeedReport> {
    if seed.row_width < 8 {
        return Err(AdminError::Message(
            "row width must hold the eight-byte key".into(),
        ));
    }
    let cluster = open_cluster(path.as_ref(), opts)?;
    let db = open_database(&cluster, opts)?;
    let session = cluster.session(opts.role, opts.superuser);
    let rel = db.create_relation(&session, CreateRelation::table(&seed.table))?;
    if seed.with_index {
        db.create_index(
            &session,
            rel,
            CreateIndex {
                name: format!("{}_pkey", seed.table),
                key: KeySpec { offset: 0, len: 8 },
                predicate: None,
                primary: true,
            },
        )?;
    }

    let tx = db.begin(&session);
    let mut tids = Vec::with_capacity(seed.rows);
    for key in 0..seed.rows {
        tids.push(tx.insert(rel, &demo_row(key as u64, 0, seed.row_width))?);
    }
    tx.commit()?;

    let mut deleted = 0;
    if seed.delete_every > 0 {
        let tx = db.begin(&session);
        for tid in tids.iter().step_by(seed.delete_every) {
            tx.delete(rel, *tid)?;
            deleted += 1;
        }
        tx.commit()?;
    }

    let mut updated = 0;
    if seed.update_every > 0 {
        let tx = db.begin(&session);
        for (key, tid) in tids.iter().enumerate() {
            let survives = seed.delete_every == 0 || key % seed.delete_every != 0;
            if survives && key % seed.update_every == 1 {
                tx.update(rel, *tid, &demo_row(key as u64, 1, seed.row_width))?;
                updated += 1;
            }
        }
        tx.commit()?;
    }

    cluster.checkpoint()?;
    let heap = db
        .relation(rel)
        .ok_or_else(|| AdminError::Message(format!("table {} vanished", seed.table)))?;
    let report = SeedReport {
        table: heap.def().qualified_name(),
        inserted: seed.rows,
        deleted,
        updated,
        nblocks: heap.file().nblocks(),
    };
    info!(
        table = %report.table,
        inserted = report.inserted,
        deleted,
        updated,
        "admin.seed"
    );
    Ok(report)
}

fn demo_row(key: u64, generation: u8, width: usize) -> Vec<u8> {
    let mut row = key.to_be_bytes().to_vec();
    row.resize(width, b'a' + generation);
    row
}
