//! Heap storage: pages, relation files, transactions, catalogs and indexes.
//!
//! Everything the vacuum engine reads or rewrites lives here. Regular
//! versioned writes go through [`heapam`]; vacuum manipulates pages directly
//! under the relation locks it holds.

/// Relation and database catalogs plus the in-place counter tables.
pub mod catalog;

/// Clusters, databases, sessions and transactions.
pub mod database;

/// Shared free-space directory.
pub mod fsm;

/// Regular heap writes.
pub mod heapam;

/// Secondary index access methods.
pub mod index;

/// Cluster configuration.
pub mod options;

/// Slotted heap pages.
pub mod page;

/// Relation page files and cached page frames.
pub mod relation;

/// Row version headers.
pub mod tuple;

/// Transaction ids, statuses and the running set.
pub mod xact;

pub use catalog::{
    Catalog, DatabaseDef, DatabaseStats, OwnershipCheck, RelKind, RelStats, RelationDef,
    RelationResolver,
};
pub use database::{
    CheckpointStats, Cluster, CreateIndex, CreateRelation, Database, RecoveryStats, Session,
    Transaction,
};
pub use fsm::{FreeSpaceEntry, FreeSpaceMap, FsmStatistics};
pub use heapam::{HeapContext, HeapRelation};
pub use index::{
    IndexAccessMethod, IndexBulkDeleteResult, IndexDef, IndexPredicate, KeySpec, OrderedIndex,
};
pub use options::ClusterOptions;
pub use page::{HeapPage, ItemId};
pub use relation::{Buffer, PageFrame, RelationFile, UsageSnapshot};
pub use tuple::{InfoMask, TupleHeader};
pub use xact::{TransactionManager, XactHistory, XactStatus};
