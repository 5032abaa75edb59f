use std::time::Duration;

use crate::storage::page::DEFAULT_PAGE_SIZE;

/// Configuration options supplied when opening a [`super::Cluster`].
#[derive(Clone, Debug)]
pub struct ClusterOptions {
    /// Heap page size in bytes.
    pub page_size: usize,
    /// Whether to create the cluster directory if it doesn't exist.
    pub create_if_missing: bool,
    /// How long a blocking relation lock request waits before giving up.
    pub lock_timeout: Duration,
    /// Capacity of the shared free-space directory, in page entries.
    pub max_fsm_pages: usize,
    /// First transaction id handed out by a freshly created cluster.
    pub first_xid: u32,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            create_if_missing: false,
            lock_timeout: Duration::from_secs(5),
            max_fsm_pages: 20_000,
            first_xid: 3,
        }
    }
}

impl ClusterOptions {
    /// Sets the heap page size.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Creates the cluster directory when missing.
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Sets the relation lock wait timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the free-space directory capacity.
    pub fn max_fsm_pages(mut self, pages: usize) -> Self {
        self.max_fsm_pages = pages;
        self
    }

    /// Sets the first transaction id of a new cluster. Useful for exercising
    /// wraparound behaviour without burning billions of ids.
    pub fn first_xid(mut self, xid: u32) -> Self {
        self.first_xid = xid;
        self
    }
}
