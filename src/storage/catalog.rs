#![forbid(unsafe_code)]

//! Relation and database catalogs.
//!
//! Definitions (names, owners, kinds, indexes) change only through explicit
//! create and drop calls. Counters that vacuum maintains live in separate
//! side tables that are overwritten in place: [`RelStatsTable`] and
//! [`DatabaseStatsTable`]. Neither exposes a way to change a definition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::storage::index::IndexDef;
use crate::types::{BlockNumber, DbId, RelId, Result, RoleId, SessionId, VacError, Xid};

/// Relation flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelKind {
    /// Regular table.
    Ordinary,
    /// Overflow storage owned by an ordinary table.
    Toast,
    /// Index relation.
    Index,
    /// View; holds no heap.
    View,
}

/// Catalog entry for one relation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    /// Relation id.
    pub id: RelId,
    /// Unqualified name.
    pub name: String,
    /// Namespace the name lives in.
    pub namespace: String,
    /// Relation kind.
    pub kind: RelKind,
    /// Owning role.
    pub owner: RoleId,
    /// Shared across every database of the cluster.
    #[serde(default)]
    pub is_shared: bool,
    /// Temporary relation of this session.
    #[serde(default)]
    pub temp_session: Option<SessionId>,
    /// Overflow relation, if any.
    #[serde(default)]
    pub toast_relid: Option<RelId>,
    /// Indexes on the relation.
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl RelationDef {
    /// `namespace.name`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

/// Catalog entry for one database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDef {
    /// Database id.
    pub id: DbId,
    /// Database name.
    pub name: String,
    /// Owning role.
    pub owner: RoleId,
    /// Accepts connections. Databases that do not are frozen templates and
    /// are ignored when computing the cluster watermark.
    pub allow_conn: bool,
    /// Template database.
    pub is_template: bool,
}

/// Per-relation counters maintained by vacuum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RelStats {
    /// Pages in the heap.
    pub pages: BlockNumber,
    /// Live row versions.
    pub tuples: u64,
    /// Relation has at least one index.
    pub has_index: bool,
    /// Relation has a primary key.
    pub has_pkey: bool,
}

/// Per-database watermarks maintained by vacuum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStats {
    /// Every status older than this is known; oldest retained transaction id.
    pub vacuum_xid: Xid,
    /// Every creator id older than this has been frozen.
    pub frozen_xid: Xid,
}

/// In-place side table of [`RelStats`].
///
/// Each row has its own mutex so overwrites of one relation serialize
/// without touching others. Every overwrite bumps the invalidation epoch
/// readers use to drop cached copies.
#[derive(Default)]
pub struct RelStatsTable {
    rows: RwLock<FxHashMap<RelId, Arc<Mutex<RelStats>>>>,
    epoch: AtomicU64,
}

impl RelStatsTable {
    fn row(&self, rel: RelId) -> Arc<Mutex<RelStats>> {
        if let Some(row) = self.rows.read().get(&rel) {
            return row.clone();
        }
        self.rows.write().entry(rel).or_default().clone()
    }

    /// Current counters of `rel`.
    pub fn get(&self, rel: RelId) -> RelStats {
        self.rows
            .read()
            .get(&rel)
            .map(|row| *row.lock())
            .unwrap_or_default()
    }

    /// Overwrites the counters of `rel` without versioning and signals
    /// invalidation.
    pub fn overwrite_in_place(&self, rel: RelId, update: impl FnOnce(&mut RelStats)) -> RelStats {
        let row = self.row(rel);
        let mut guard = row.lock();
        update(&mut guard);
        let result = *guard;
        drop(guard);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(rel = rel.0, epoch, "catalog.relstats_overwritten");
        result
    }

    /// Invalidation epoch; increases on every overwrite.
    pub fn invalidation_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn forget(&self, rel: RelId) {
        self.rows.write().remove(&rel);
    }

    fn export(&self) -> BTreeMap<u32, RelStats> {
        self.rows
            .read()
            .iter()
            .map(|(rel, row)| (rel.0, *row.lock()))
            .collect()
    }

    fn import(rows: BTreeMap<u32, RelStats>) -> Self {
        let table = Self::default();
        {
            let mut map = table.rows.write();
            for (rel, stats) in rows {
                map.insert(RelId(rel), Arc::new(Mutex::new(stats)));
            }
        }
        table
    }
}

/// In-place side table of [`DatabaseStats`].
pub struct DatabaseStatsTable {
    rows: Mutex<BTreeMap<DbId, DatabaseStats>>,
}

impl DatabaseStatsTable {
    pub(crate) fn new(rows: BTreeMap<DbId, DatabaseStats>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    /// Watermarks of `db`.
    pub fn get(&self, db: DbId) -> Option<DatabaseStats> {
        self.rows.lock().get(&db).copied()
    }

    /// Watermarks of every database.
    pub fn all(&self) -> BTreeMap<DbId, DatabaseStats> {
        self.rows.lock().clone()
    }

    /// Overwrites the watermarks of `db` in place.
    pub fn overwrite_in_place(&self, db: DbId, stats: DatabaseStats) {
        self.rows.lock().insert(db, stats);
    }
}

/// Name-to-id lookup used by callers that name relations.
pub trait RelationResolver {
    /// Resolves `name`, optionally `namespace.name`, to a relation id.
    fn resolve_relation(&self, name: &str) -> Result<RelId>;
}

/// Ownership checks gating maintenance commands.
pub trait OwnershipCheck {
    /// Returns true if `role` owns relation `rel`.
    fn owns_relation(&self, role: RoleId, rel: RelId) -> bool;
}

#[derive(Default, Serialize, Deserialize)]
struct CatalogFile {
    relations: Vec<RelationDef>,
    #[serde(default)]
    relstats: BTreeMap<u32, RelStats>,
}

/// Relation catalog of one database.
pub struct Catalog {
    relations: RwLock<BTreeMap<RelId, RelationDef>>,
    relstats: RelStatsTable,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            relations: RwLock::new(BTreeMap::new()),
            relstats: RelStatsTable::default(),
        }
    }
}

impl Catalog {
    /// Parses a persisted catalog.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let file: CatalogFile = serde_json::from_slice(bytes)?;
        Ok(Self {
            relations: RwLock::new(file.relations.into_iter().map(|r| (r.id, r)).collect()),
            relstats: RelStatsTable::import(file.relstats),
        })
    }

    /// Serializes definitions and counters.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let file = CatalogFile {
            relations: self.relations.read().values().cloned().collect(),
            relstats: self.relstats.export(),
        };
        Ok(serde_json::to_vec_pretty(&file)?)
    }

    /// Adds a definition. Names are unique per namespace.
    pub fn insert(&self, def: RelationDef) -> Result<()> {
        let mut relations = self.relations.write();
        if relations
            .values()
            .any(|r| r.namespace == def.namespace && r.name == def.name)
        {
            return Err(VacError::InvalidOwned(format!(
                "relation {} already exists",
                def.qualified_name()
            )));
        }
        relations.insert(def.id, def);
        Ok(())
    }

    /// Adds an index definition to `rel`.
    pub fn add_index(&self, rel: RelId, index: IndexDef) -> Result<()> {
        let mut relations = self.relations.write();
        let def = relations
            .get_mut(&rel)
            .ok_or_else(|| VacError::NotFound(format!("relation {rel}")))?;
        def.indexes.push(index);
        Ok(())
    }

    /// Removes a definition and its counters.
    pub fn remove(&self, rel: RelId) -> Option<RelationDef> {
        self.relstats.forget(rel);
        self.relations.write().remove(&rel)
    }

    /// Definition of `rel`, if it still exists.
    pub fn get(&self, rel: RelId) -> Option<RelationDef> {
        self.relations.read().get(&rel).cloned()
    }

    /// Every definition, by id.
    pub fn relations(&self) -> Vec<RelationDef> {
        self.relations.read().values().cloned().collect()
    }

    /// Ids of relations of `kind`, by id.
    pub fn relation_ids(&self, kind: RelKind) -> Vec<RelId> {
        self.relations
            .read()
            .values()
            .filter(|r| r.kind == kind)
            .map(|r| r.id)
            .collect()
    }

    /// In-place counters.
    pub fn relstats(&self) -> &RelStatsTable {
        &self.relstats
    }
}

impl RelationResolver for Catalog {
    fn resolve_relation(&self, name: &str) -> Result<RelId> {
        let (namespace, name) = match name.split_once('.') {
            Some((ns, rel)) => (Some(ns), rel),
            None => (None, name),
        };
        let relations = self.relations.read();
        let mut found = relations.values().filter(|r| {
            r.name == name && namespace.map_or(true, |ns| r.namespace == ns)
        });
        match (found.next(), found.next()) {
            (Some(def), None) => Ok(def.id),
            (Some(_), Some(_)) => Err(VacError::InvalidOwned(format!(
                "relation name {name} is ambiguous"
            ))),
            (None, _) => Err(VacError::NotFound(format!("relation {name}"))),
        }
    }
}

impl OwnershipCheck for Catalog {
    fn owns_relation(&self, role: RoleId, rel: RelId) -> bool {
        self.relations
            .read()
            .get(&rel)
            .is_some_and(|def| def.owner == role)
    }
}
