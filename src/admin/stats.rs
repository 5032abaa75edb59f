use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_cluster;
use crate::admin::Result;
use crate::storage::catalog::{RelKind, RelStats};
use crate::storage::database::{RecoveryStats, WAL_FILE};
use crate::storage::fsm::FsmStatistics;

/// Statistics for one cluster, as found on disk before recovery.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub cluster: ClusterSection,
    pub databases: Vec<DatabaseSection>,
    pub relations: Vec<RelationSection>,
    pub fsm: FsmStatistics,
    pub wal: WalStatsSection,
}

/// Cluster-wide counters.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSection {
    pub root: String,
    pub page_size: usize,
    pub next_xid: u32,
    pub oldest_retained_xid: u32,
    pub recovery: RecoveryStats,
}

/// One database row and its vacuum watermarks.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSection {
    pub id: u32,
    pub name: String,
    pub owner: u32,
    pub allow_conn: bool,
    pub is_template: bool,
    pub vacuum_xid: Option<u32>,
    pub frozen_xid: Option<u32>,
}

/// One relation's size and vacuum-maintained counters.
#[derive(Debug, Clone, Serialize)]
pub struct RelationSection {
    pub database: String,
    pub relation: String,
    pub id: u32,
    pub kind: RelKind,
    pub nblocks: u32,
    pub indexes: usize,
    pub stats: RelStats,
}

/// Log file as found before the cluster was opened.
#[derive(Debug, Clone, Serialize)]
pub struct WalStatsSection {
    pub path: String,
    pub exists: bool,
    pub size_bytes: u64,
}

/// Collects catalog, watermark and file statistics for the cluster at `path`.
///
/// # Errors
///
/// Returns an error if the cluster cannot be opened.
pub fn stats(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<StatsReport> {
    let path = path.as_ref();
    let wal_path = path.join(WAL_FILE);
    let wal_exists = wal_path.exists();
    let wal_size = fs::metadata(&wal_path).map(|m| m.len()).unwrap_or(0);
    let cluster = open_cluster(path, opts)?;
    let watermarks = cluster.database_stats().all();

    let mut databases = Vec::new();
    let mut relations = Vec::new();
    for db in cluster.databases() {
        let def = db.def();
        let marks = watermarks.get(&def.id);
        databases.push(DatabaseSection {
            id: def.id.0,
            name: def.name.clone(),
            owner: def.owner.0,
            allow_conn: def.allow_conn,
            is_template: def.is_template,
            vacuum_xid: marks.map(|m| m.vacuum_xid.0),
            frozen_xid: marks.map(|m| m.frozen_xid.0),
        });
        for rel in db.catalog().relations() {
            let nblocks = db
                .relation(rel.id)
                .map(|heap| heap.file().nblocks())
                .unwrap_or(0);
            relations.push(RelationSection {
                database: def.name.clone(),
                relation: rel.qualified_name(),
                id: rel.id.0,
                kind: rel.kind,
                nblocks,
                indexes: rel.indexes.len(),
                stats: db.catalog().relstats().get(rel.id),
            });
        }
    }

    Ok(StatsReport {
        cluster: ClusterSection {
            root: path.display().to_string(),
            page_size: cluster.options().page_size,
            next_xid: cluster.xact().next_xid().0,
            oldest_retained_xid: cluster.xact().oldest_retained().0,
            recovery: cluster.recovery_stats(),
        },
        databases,
        relations,
        fsm: cluster.fsm().statistics(),
        wal: WalStatsSection {
            path: wal_path.display().to_string(),
            exists: wal_exists,
            size_bytes: wal_size,
        },
    })
}
