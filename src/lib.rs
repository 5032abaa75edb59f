//! Heap vacuum engine for an MVCC row store.
//!
//! A [`storage::database::Cluster`] holds databases of slotted-page heap
//! relations with btree indexes, a shared write-ahead log and transaction
//! status history. [`vacuum`] reclaims the space of row versions no
//! transaction can see, either in place (lazy) or by compacting the heap
//! under an exclusive lock (full), and maintains the statistics and
//! watermarks that let history be truncated safely.

#![warn(missing_docs)]

pub mod admin;
pub mod primitives;
pub mod storage;
pub mod types;
pub mod vacuum;
