#![forbid(unsafe_code)]

//! Low-level building blocks: file access, logging and locking.

pub mod concurrency;
pub mod io;
pub mod wal;
