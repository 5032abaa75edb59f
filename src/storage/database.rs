#![forbid(unsafe_code)]

//! Cluster, databases, sessions and transactions.
//!
//! A cluster directory holds:
//!
//! ```text
//! pg_database.json   database definitions, watermarks, id counter
//! clog.json          transaction status history
//! wal.log            write-ahead log since the last checkpoint
//! <db>/catalog.json  relation catalog and counters
//! <db>/rel_<id>.heap heap page files
//! ```
//!
//! Opening a cluster replays the log over the page files, rebuilds indexes
//! from the heaps and checkpoints.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::primitives::concurrency::{CancelToken, LockManager, LockMode, LockScope};
use crate::primitives::io::{FileIo, MemFileIo, StdFileIo};
use crate::primitives::wal::{Wal, WalRecord};
use crate::storage::catalog::{
    Catalog, DatabaseDef, DatabaseStats, DatabaseStatsTable, RelKind, RelationDef,
    RelationResolver,
};
use crate::storage::fsm::FreeSpaceMap;
use crate::storage::heapam::{HeapContext, HeapRelation};
use crate::storage::index::{IndexDef, IndexPredicate, KeySpec, OrderedIndex};
use crate::storage::options::ClusterOptions;
use crate::storage::page::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::storage::relation::RelationFile;
use crate::storage::tuple::TupleHeader;
use crate::storage::xact::{TransactionManager, XactHistory};
use crate::types::{
    DbId, ItemPointer, RelId, Result, RoleId, SessionId, VacError, Xid,
};

/// Cluster catalog file inside the root directory.
pub const CLUSTER_FILE: &str = "pg_database.json";
const CLOG_FILE: &str = "clog.json";
/// Write-ahead log file inside the root directory.
pub const WAL_FILE: &str = "wal.log";
const CATALOG_FILE: &str = "catalog.json";
const FIRST_OID: u32 = 16_384;

/// A connected client: identity plus a cancellation token.
#[derive(Clone, Debug)]
pub struct Session {
    id: SessionId,
    role: RoleId,
    superuser: bool,
    cancel: CancelToken,
}

impl Session {
    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Role the session runs as.
    pub fn role(&self) -> RoleId {
        self.role
    }

    /// True for a superuser session.
    pub fn is_superuser(&self) -> bool {
        self.superuser
    }

    /// Token that cancels work running on this session.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Services shared by every database of a cluster.
pub(crate) struct Shared {
    pub(crate) options: ClusterOptions,
    pub(crate) xact: Arc<TransactionManager>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) wal: Arc<Wal>,
    pub(crate) fsm: Arc<FreeSpaceMap>,
    next_oid: AtomicU32,
    gate: RwLock<()>,
}

impl Shared {
    fn heap_context(&self) -> HeapContext<'_> {
        HeapContext {
            wal: &self.wal,
            fsm: &self.fsm,
            xact: &self.xact,
        }
    }

    fn allocate_oid(&self) -> u32 {
        self.next_oid.fetch_add(1, Ordering::AcqRel)
    }
}

/// Description of a relation to create.
#[derive(Clone, Debug)]
pub struct CreateRelation {
    /// Unqualified name.
    pub name: String,
    /// Namespace; `public` when empty.
    pub namespace: String,
    /// Relation kind. Only ordinary relations get a heap and overflow storage.
    pub kind: RelKind,
    /// Shared across databases.
    pub shared: bool,
    /// Temporary relation of the creating session.
    pub temporary: bool,
    /// Create an overflow relation alongside.
    pub with_toast: bool,
}

impl CreateRelation {
    /// Plain ordinary relation named `name` in `public`.
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "public".into(),
            kind: RelKind::Ordinary,
            shared: false,
            temporary: false,
            with_toast: false,
        }
    }

    /// Sets the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the relation kind.
    pub fn kind(mut self, kind: RelKind) -> Self {
        self.kind = kind;
        self
    }

    /// Marks the relation shared.
    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    /// Marks the relation temporary.
    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    /// Requests an overflow relation.
    pub fn with_toast(mut self, with_toast: bool) -> Self {
        self.with_toast = with_toast;
        self
    }
}

/// Index to create.
#[derive(Clone, Debug)]
pub struct CreateIndex {
    /// Index name.
    pub name: String,
    /// Key bytes.
    pub key: KeySpec,
    /// Partial-index filter.
    pub predicate: Option<IndexPredicate>,
    /// Primary key.
    pub primary: bool,
}

/// One database: its catalog and open heaps.
pub struct Database {
    def: RwLock<DatabaseDef>,
    dir: Option<PathBuf>,
    catalog: Catalog,
    relations: RwLock<FxHashMap<RelId, Arc<HeapRelation>>>,
    shared: Arc<Shared>,
}

impl Database {
    fn open(def: DatabaseDef, dir: Option<PathBuf>, shared: Arc<Shared>) -> Result<Self> {
        let catalog = match &dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let path = dir.join(CATALOG_FILE);
                if path.exists() {
                    Catalog::from_json(&fs::read(&path)?)?
                } else {
                    Catalog::default()
                }
            }
            None => Catalog::default(),
        };
        let db = Self {
            def: RwLock::new(def),
            dir,
            catalog,
            relations: RwLock::new(FxHashMap::default()),
            shared,
        };
        for def in db.catalog.relations() {
            if has_heap(def.kind) {
                db.open_heap(def)?;
            }
        }
        Ok(db)
    }

    fn open_heap(&self, def: RelationDef) -> Result<Arc<HeapRelation>> {
        let io: Arc<dyn FileIo> = match &self.dir {
            Some(dir) => Arc::new(StdFileIo::open(dir.join(format!("rel_{}.heap", def.id.0)))?),
            None => Arc::new(MemFileIo::new()),
        };
        let file = RelationFile::open(def.id, io, self.shared.options.page_size)?;
        let indexes = def.indexes.clone();
        let heap = Arc::new(HeapRelation::new(def, Arc::new(file)));
        for index in indexes {
            heap.attach_index(Arc::new(OrderedIndex::new(index)));
        }
        self.relations.write().insert(heap.id(), heap.clone());
        Ok(heap)
    }

    /// Database id.
    pub fn id(&self) -> DbId {
        self.def.read().id
    }

    /// Database name.
    pub fn name(&self) -> String {
        self.def.read().name.clone()
    }

    /// Copy of the database definition.
    pub fn def(&self) -> DatabaseDef {
        self.def.read().clone()
    }

    /// Relation catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Open heap of `rel`, if it exists and has one.
    pub fn relation(&self, rel: RelId) -> Option<Arc<HeapRelation>> {
        self.relations.read().get(&rel).cloned()
    }

    /// Open heap named `name` (optionally `namespace.name`).
    pub fn relation_by_name(&self, name: &str) -> Result<Arc<HeapRelation>> {
        let rel = self.catalog.resolve_relation(name)?;
        self.relation(rel)
            .ok_or_else(|| VacError::InvalidOwned(format!("relation {name} has no heap")))
    }

    /// Heaps of every open relation.
    pub fn heaps(&self) -> Vec<Arc<HeapRelation>> {
        let mut heaps: Vec<_> = self.relations.read().values().cloned().collect();
        heaps.sort_by_key(|heap| heap.id());
        heaps
    }

    /// Shared services for heap writes.
    pub fn heap_context(&self) -> HeapContext<'_> {
        self.shared.heap_context()
    }

    /// Transaction manager of the cluster.
    pub fn xact(&self) -> &TransactionManager {
        &self.shared.xact
    }

    /// Relation lock table of the cluster.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.shared.locks
    }

    /// Write-ahead log of the cluster.
    pub fn wal(&self) -> &Wal {
        &self.shared.wal
    }

    /// Free-space directory of the cluster.
    pub fn fsm(&self) -> &FreeSpaceMap {
        &self.shared.fsm
    }

    /// Cluster options.
    pub fn options(&self) -> &ClusterOptions {
        &self.shared.options
    }

    /// Shared hold that keeps a checkpoint from running mid-write.
    pub fn write_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.shared.gate.read()
    }

    /// Creates a relation owned by the session's role.
    pub fn create_relation(&self, session: &Session, spec: CreateRelation) -> Result<RelId> {
        let namespace = if spec.namespace.is_empty() {
            "public".to_string()
        } else {
            spec.namespace.clone()
        };
        let id = RelId(self.shared.allocate_oid());
        let temp_session = spec.temporary.then_some(session.id());
        let toast_relid = if spec.with_toast && spec.kind == RelKind::Ordinary {
            let toast = RelationDef {
                id: RelId(self.shared.allocate_oid()),
                name: format!("toast_{}", id.0),
                namespace: "toast".into(),
                kind: RelKind::Toast,
                owner: session.role(),
                is_shared: spec.shared,
                temp_session,
                toast_relid: None,
                indexes: Vec::new(),
            };
            let toast_id = toast.id;
            self.catalog.insert(toast.clone())?;
            self.open_heap(toast)?;
            Some(toast_id)
        } else {
            None
        };
        let def = RelationDef {
            id,
            name: spec.name,
            namespace,
            kind: spec.kind,
            owner: session.role(),
            is_shared: spec.shared,
            temp_session,
            toast_relid,
            indexes: Vec::new(),
        };
        self.catalog.insert(def.clone())?;
        if has_heap(def.kind) {
            self.open_heap(def)?;
        }
        self.persist_catalog()?;
        debug!(db = self.id().0, rel = id.0, "database.relation_created");
        Ok(id)
    }

    /// Creates an index on `rel` and fills it from the heap.
    pub fn create_index(&self, session: &Session, rel: RelId, spec: CreateIndex) -> Result<RelId> {
        let heap = self
            .relation(rel)
            .ok_or_else(|| VacError::NotFound(format!("relation {rel}")))?;
        let table = heap.def();
        let index_id = RelId(self.shared.allocate_oid());
        let def = IndexDef {
            id: index_id,
            name: spec.name.clone(),
            key: spec.key,
            predicate: spec.predicate,
            primary: spec.primary,
        };
        self.catalog.insert(RelationDef {
            id: index_id,
            name: spec.name,
            namespace: table.namespace.clone(),
            kind: RelKind::Index,
            owner: session.role(),
            is_shared: table.is_shared,
            temp_session: table.temp_session,
            toast_relid: None,
            indexes: Vec::new(),
        })?;
        self.catalog.add_index(rel, def.clone())?;
        if let Some(updated) = self.catalog.get(rel) {
            heap.set_def(updated);
        }
        let index = Arc::new(OrderedIndex::new(def));
        heap.attach_index(index.clone());
        {
            let _gate = self.write_gate();
            heap.fill_index(index.as_ref())?;
        }
        self.persist_catalog()?;
        Ok(index_id)
    }

    /// Drops `rel` and its overflow relation.
    pub fn drop_relation(&self, session: &Session, rel: RelId) -> Result<()> {
        let def = self
            .catalog
            .get(rel)
            .ok_or_else(|| VacError::NotFound(format!("relation {rel}")))?;
        let locks = self.locks();
        locks.acquire(rel, LockMode::AccessExclusive, session.id(), LockScope::Session)?;
        let result = self.drop_locked(&def);
        locks.release(rel, LockMode::AccessExclusive, session.id(), LockScope::Session);
        result?;
        if let Some(toast) = def.toast_relid {
            if let Some(toast_def) = self.catalog.get(toast) {
                self.drop_locked(&toast_def)?;
            }
        }
        self.persist_catalog()
    }

    fn drop_locked(&self, def: &RelationDef) -> Result<()> {
        for index in &def.indexes {
            self.catalog.remove(index.id);
        }
        self.catalog.remove(def.id);
        self.relations.write().remove(&def.id);
        self.fsm().forget_relation(def.id);
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("rel_{}.heap", def.id.0));
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Starts a transaction.
    pub fn begin<'a>(&'a self, session: &'a Session) -> Transaction<'a> {
        let xid = self.shared.xact.begin(session.id());
        Transaction::new(self, session, xid)
    }

    /// Starts a lazy-vacuum transaction, ignored by other vacuums' watermark.
    pub fn begin_lazy_vacuum<'a>(&'a self, session: &'a Session) -> Transaction<'a> {
        let xid = self.shared.xact.begin_lazy_vacuum(session.id());
        Transaction::new(self, session, xid)
    }

    /// Writes the catalog file.
    pub fn persist_catalog(&self) -> Result<()> {
        if let Some(dir) = &self.dir {
            write_atomic(&dir.join(CATALOG_FILE), &self.catalog.to_json()?)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("relations", &self.relations.read().len())
            .finish()
    }
}

fn has_heap(kind: RelKind) -> bool {
    matches!(kind, RelKind::Ordinary | RelKind::Toast)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Unit of work. Dropping it without committing aborts it.
pub struct Transaction<'a> {
    db: &'a Database,
    session: &'a Session,
    xid: Xid,
    finished: bool,
}

impl<'a> Transaction<'a> {
    fn new(db: &'a Database, session: &'a Session, xid: Xid) -> Self {
        Self {
            db,
            session,
            xid,
            finished: false,
        }
    }

    /// Transaction id.
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// Session running the transaction.
    pub fn session(&self) -> &'a Session {
        self.session
    }

    /// Database the transaction runs in.
    pub fn database(&self) -> &'a Database {
        self.db
    }

    /// Acquires a relation lock held until the transaction ends.
    pub fn lock_relation(&self, rel: RelId, mode: LockMode) -> Result<()> {
        self.db
            .locks()
            .acquire(rel, mode, self.session.id(), LockScope::Transaction(self.xid))
    }

    /// Acquires a relation lock only if it is free right now.
    pub fn try_lock_relation(&self, rel: RelId, mode: LockMode) -> bool {
        self.db
            .locks()
            .try_acquire(rel, mode, self.session.id(), LockScope::Transaction(self.xid))
    }

    fn writable(&self, rel: RelId) -> Result<Arc<HeapRelation>> {
        let heap = self
            .db
            .relation(rel)
            .ok_or_else(|| VacError::NotFound(format!("relation {rel}")))?;
        self.lock_relation(rel, LockMode::RowExclusive)?;
        Ok(heap)
    }

    /// Inserts a row.
    pub fn insert(&self, rel: RelId, payload: &[u8]) -> Result<ItemPointer> {
        let heap = self.writable(rel)?;
        let _gate = self.db.write_gate();
        heap.insert(self.db.heap_context(), self.xid, payload)
    }

    /// Replaces the row at `tid`; returns the new version's location.
    pub fn update(&self, rel: RelId, tid: ItemPointer, payload: &[u8]) -> Result<ItemPointer> {
        let heap = self.writable(rel)?;
        let _gate = self.db.write_gate();
        heap.update(self.db.heap_context(), self.xid, tid, payload)
    }

    /// Deletes the row at `tid`.
    pub fn delete(&self, rel: RelId, tid: ItemPointer) -> Result<()> {
        let heap = self.writable(rel)?;
        let _gate = self.db.write_gate();
        heap.delete(self.db.heap_context(), self.xid, tid)
    }

    /// Row-locks the version at `tid`.
    pub fn lock_row(&self, rel: RelId, tid: ItemPointer) -> Result<()> {
        let heap = self.writable(rel)?;
        let _gate = self.db.write_gate();
        heap.lock_tuple(self.db.heap_context(), self.xid, tid)
    }

    /// Durably records the commit while the transaction keeps running and
    /// keeps its locks. Later aborts leave it committed.
    pub fn record_commit(&self) -> Result<()> {
        let wal = self.db.wal();
        wal.append(WalRecord::Commit { xid: self.xid })?;
        wal.flush()?;
        self.db.xact().record_commit(self.xid);
        Ok(())
    }

    /// Commits and releases transaction locks.
    pub fn commit(mut self) -> Result<()> {
        let wal = self.db.wal();
        wal.append(WalRecord::Commit { xid: self.xid })?;
        wal.flush()?;
        self.db.xact().commit(self.xid);
        self.finish();
        Ok(())
    }

    /// Aborts and releases transaction locks.
    pub fn abort(mut self) {
        self.abort_inner();
    }

    fn abort_inner(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.db.wal().append(WalRecord::Abort { xid: self.xid }) {
            warn!(xid = self.xid.0, error = %err, "xact.abort_log_failed");
        }
        self.db.xact().abort(self.xid);
        self.finish();
    }

    fn finish(&mut self) {
        self.finished = true;
        self.db.locks().release_transaction(self.xid);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.abort_inner();
    }
}

#[derive(Default, Serialize, Deserialize)]
struct ClusterFile {
    databases: Vec<(DatabaseDef, DatabaseStats)>,
    next_oid: u32,
    /// Page size the relation files were created with; wins over options.
    #[serde(default)]
    page_size: usize,
}

/// Counters reported by a checkpoint.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CheckpointStats {
    /// Dirty pages written back.
    pub pages_written: usize,
    /// Databases whose catalogs were persisted.
    pub databases: usize,
}

/// Counters reported by crash recovery.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct RecoveryStats {
    /// Log records read.
    pub records: usize,
    /// Page images installed.
    pub pages_restored: usize,
    /// Truncations replayed.
    pub truncations: usize,
    /// Transaction outcomes replayed.
    pub outcomes: usize,
}

/// A set of databases sharing one log, lock table and transaction manager.
pub struct Cluster {
    root: Option<PathBuf>,
    shared: Arc<Shared>,
    databases: RwLock<BTreeMap<DbId, Arc<Database>>>,
    db_stats: DatabaseStatsTable,
    next_session: AtomicU32,
    checkpoint_lock: Mutex<()>,
    recovery: RecoveryStats,
}

impl Cluster {
    /// Volatile cluster kept entirely in memory.
    pub fn in_memory(options: ClusterOptions) -> Result<Self> {
        validate(&options)?;
        let wal = Wal::open(Arc::new(MemFileIo::new()))?;
        let history = XactHistory::starting_at(Xid(options.first_xid));
        Ok(Self::assemble(None, options, wal, history, ClusterFile::default()))
    }

    /// Opens (or creates, when allowed) the cluster in `root`, replaying the
    /// log left by a crash.
    pub fn open(root: impl AsRef<Path>, mut options: ClusterOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let cluster_path = root.join(CLUSTER_FILE);
        if !cluster_path.exists() {
            if !options.create_if_missing {
                return Err(VacError::NotFound(format!(
                    "cluster at {}",
                    root.display()
                )));
            }
            fs::create_dir_all(&root)?;
        }
        let file: ClusterFile = if cluster_path.exists() {
            serde_json::from_slice(&fs::read(&cluster_path)?)?
        } else {
            ClusterFile::default()
        };
        if file.page_size != 0 {
            options.page_size = file.page_size;
        }
        validate(&options)?;
        let clog_path = root.join(CLOG_FILE);
        let history = if clog_path.exists() {
            serde_json::from_slice(&fs::read(&clog_path)?)?
        } else {
            XactHistory::starting_at(Xid(options.first_xid))
        };
        let wal = Wal::open(Arc::new(StdFileIo::open(root.join(WAL_FILE))?))?;
        let mut cluster = Self::assemble(Some(root), options, wal, history, ClusterFile::default());
        for (def, stats) in file.databases {
            cluster.attach_database(def, stats)?;
        }
        if file.next_oid > 0 {
            cluster.shared.next_oid.store(file.next_oid, Ordering::Release);
        }
        cluster.recovery = cluster.redo()?;
        cluster.rebuild_after_open()?;
        cluster.checkpoint()?;
        Ok(cluster)
    }

    fn assemble(
        root: Option<PathBuf>,
        options: ClusterOptions,
        wal: Wal,
        history: XactHistory,
        file: ClusterFile,
    ) -> Self {
        let shared = Arc::new(Shared {
            xact: Arc::new(TransactionManager::new(history)),
            locks: Arc::new(LockManager::new(options.lock_timeout)),
            wal: Arc::new(wal),
            fsm: Arc::new(FreeSpaceMap::new(options.max_fsm_pages, options.page_size)),
            next_oid: AtomicU32::new(file.next_oid.max(FIRST_OID)),
            gate: RwLock::new(()),
            options,
        });
        Self {
            root,
            shared,
            databases: RwLock::new(BTreeMap::new()),
            db_stats: DatabaseStatsTable::new(BTreeMap::new()),
            next_session: AtomicU32::new(1),
            checkpoint_lock: Mutex::new(()),
            recovery: RecoveryStats::default(),
        }
    }

    fn attach_database(&self, def: DatabaseDef, stats: DatabaseStats) -> Result<Arc<Database>> {
        let dir = self.root.as_ref().map(|root| root.join(def.id.0.to_string()));
        let id = def.id;
        let db = Arc::new(Database::open(def, dir, self.shared.clone())?);
        self.db_stats.overwrite_in_place(id, stats);
        self.databases.write().insert(id, db.clone());
        Ok(db)
    }

    fn find_heap(&self, rel: RelId) -> Option<Arc<HeapRelation>> {
        self.databases
            .read()
            .values()
            .find_map(|db| db.relation(rel))
    }

    fn redo(&self) -> Result<RecoveryStats> {
        let records = self.shared.wal.records()?;
        let mut stats = RecoveryStats {
            records: records.len(),
            ..RecoveryStats::default()
        };
        for (lsn, record) in records {
            match record {
                WalRecord::HeapWrite { rel, page } | WalRecord::Clean { rel, page, .. } => {
                    if let Some(heap) = self.find_heap(rel) {
                        if heap.file().redo_page_image(page.block, lsn, &page.bytes)? {
                            stats.pages_restored += 1;
                        }
                    }
                }
                WalRecord::Move { rel, pages, .. } => {
                    if let Some(heap) = self.find_heap(rel) {
                        for page in pages {
                            if heap.file().redo_page_image(page.block, lsn, &page.bytes)? {
                                stats.pages_restored += 1;
                            }
                        }
                    }
                }
                WalRecord::Truncate { rel, nblocks } => {
                    if let Some(heap) = self.find_heap(rel) {
                        if heap.file().nblocks() > nblocks {
                            heap.file().truncate(nblocks)?;
                            stats.truncations += 1;
                        }
                    }
                }
                WalRecord::Commit { xid } => {
                    self.shared.xact.redo_outcome(xid, true);
                    stats.outcomes += 1;
                }
                WalRecord::Abort { xid } => {
                    self.shared.xact.redo_outcome(xid, false);
                    stats.outcomes += 1;
                }
                WalRecord::ClogTruncate { oldest } => {
                    self.shared.xact.truncate_history(oldest);
                }
            }
        }
        if stats.records > 0 {
            info!(
                records = stats.records,
                pages = stats.pages_restored,
                truncations = stats.truncations,
                "cluster.recovery_complete"
            );
        }
        Ok(stats)
    }

    fn rebuild_after_open(&self) -> Result<()> {
        for db in self.databases() {
            for heap in db.heaps() {
                let file = heap.file();
                for block in 0..file.nblocks() {
                    let frame = file.buffer(block)?;
                    let page = frame.read();
                    for slot in page.slot_numbers() {
                        if let Some(bytes) = page.item(slot) {
                            let header = TupleHeader::decode(bytes)?;
                            self.shared.xact.advance_past(header.xmin);
                            self.shared.xact.advance_past(header.xmax);
                            self.shared.xact.advance_past(header.xvac);
                        }
                    }
                }
                heap.rebuild_indexes()?;
            }
        }
        Ok(())
    }

    /// What the last open had to replay.
    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery
    }

    /// Creates a database owned by `owner`.
    pub fn create_database(&self, name: &str, owner: RoleId) -> Result<Arc<Database>> {
        if self.database(name).is_some() {
            return Err(VacError::InvalidOwned(format!(
                "database {name} already exists"
            )));
        }
        let def = DatabaseDef {
            id: DbId(self.shared.allocate_oid()),
            name: name.to_string(),
            owner,
            allow_conn: true,
            is_template: false,
        };
        let horizon = self.shared.xact.oldest_retained();
        let db = self.attach_database(
            def,
            DatabaseStats {
                vacuum_xid: horizon,
                frozen_xid: horizon,
            },
        )?;
        self.persist_cluster_file()?;
        Ok(db)
    }

    /// Marks `db` as a template that accepts no connections.
    pub fn set_template(&self, db: DbId, template: bool) -> Result<()> {
        let database = self
            .databases
            .read()
            .get(&db)
            .cloned()
            .ok_or_else(|| VacError::NotFound(format!("database {}", db.0)))?;
        {
            let mut def = database.def.write();
            def.is_template = template;
            def.allow_conn = !template;
        }
        self.persist_cluster_file()
    }

    /// Database named `name`.
    pub fn database(&self, name: &str) -> Option<Arc<Database>> {
        self.databases
            .read()
            .values()
            .find(|db| db.name() == name)
            .cloned()
    }

    /// Every database, by id.
    pub fn databases(&self) -> Vec<Arc<Database>> {
        self.databases.read().values().cloned().collect()
    }

    /// In-place watermark table.
    pub fn database_stats(&self) -> &DatabaseStatsTable {
        &self.db_stats
    }

    /// Opens a session for `role`.
    pub fn session(&self, role: RoleId, superuser: bool) -> Session {
        Session {
            id: SessionId(self.next_session.fetch_add(1, Ordering::AcqRel)),
            role,
            superuser,
            cancel: CancelToken::new(),
        }
    }

    /// Transaction manager.
    pub fn xact(&self) -> &TransactionManager {
        &self.shared.xact
    }

    /// Write-ahead log.
    pub fn wal(&self) -> &Wal {
        &self.shared.wal
    }

    /// Free-space directory.
    pub fn fsm(&self) -> &FreeSpaceMap {
        &self.shared.fsm
    }

    /// Cluster options.
    pub fn options(&self) -> &ClusterOptions {
        &self.shared.options
    }

    /// Directory of an on-disk cluster.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub(crate) fn persist_cluster_file(&self) -> Result<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        let stats = self.db_stats.all();
        let file = ClusterFile {
            databases: self
                .databases()
                .iter()
                .filter_map(|db| stats.get(&db.id()).map(|s| (db.def(), *s)))
                .collect(),
            next_oid: self.shared.next_oid.load(Ordering::Acquire),
            page_size: self.shared.options.page_size,
        };
        write_atomic(&root.join(CLUSTER_FILE), &serde_json::to_vec_pretty(&file)?)
    }

    /// Flushes the log, writes back every dirty page, persists catalogs and
    /// status history, then empties the log.
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        let _serial = self.checkpoint_lock.lock();
        let _gate = self.shared.gate.write();
        self.shared.wal.flush()?;
        let mut stats = CheckpointStats::default();
        for db in self.databases() {
            for heap in db.heaps() {
                stats.pages_written += heap.file().flush()?;
            }
            db.persist_catalog()?;
            stats.databases += 1;
        }
        if let Some(root) = &self.root {
            self.persist_cluster_file()?;
            let history = self.shared.xact.snapshot();
            write_atomic(&root.join(CLOG_FILE), &serde_json::to_vec_pretty(&history)?)?;
            self.shared.wal.reset()?;
        }
        debug!(pages = stats.pages_written, "cluster.checkpoint");
        Ok(stats)
    }
}

fn validate(options: &ClusterOptions) -> Result<()> {
    let size = options.page_size;
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) || !size.is_power_of_two() {
        return Err(VacError::InvalidOwned(format!(
            "page size {size} must be a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}"
        )));
    }
    Ok(())
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("root", &self.root)
            .field("databases", &self.databases.read().len())
            .finish()
    }
}
