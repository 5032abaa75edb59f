#![forbid(unsafe_code)]

//! Index synchronization: bulk delete of reaped heap locations, statistics
//! scans and the index/heap count check.

use tracing::debug;

use crate::storage::index::{IndexAccessMethod, IndexBulkDeleteResult};
use crate::types::{BlockNumber, ItemPointer, Result};
use crate::vacuum::report::{Diagnostics, IndexReport, RelationReport, WarningKind};
use crate::vacuum::RelationPass;

/// Removes every entry of `index` whose heap location satisfies `reaped`.
pub(crate) fn bulk_delete(
    index: &dyn IndexAccessMethod,
    reaped: &dyn Fn(ItemPointer) -> bool,
) -> Result<IndexBulkDeleteResult> {
    let result = index.bulk_delete(reaped)?;
    debug!(
        index = index.def().id.0,
        removed = result.tuples_removed,
        remaining = result.num_index_tuples,
        "vacuum.index.bulk_delete"
    );
    Ok(result)
}

/// Bulk delete followed by cleanup, then the count check against
/// `expected` heap versions.
pub(crate) fn vacuum_index(
    pass: &RelationPass<'_>,
    index: &dyn IndexAccessMethod,
    reaped: &dyn Fn(ItemPointer) -> bool,
    expected: u64,
    diag: &mut Diagnostics,
    report: &mut RelationReport,
) -> Result<IndexBulkDeleteResult> {
    let prior = bulk_delete(index, reaped)?;
    cleanup_index(pass, index, Some(prior), Some(expected), diag, report)
}

/// Read-only statistics scan used when nothing was reaped.
pub(crate) fn scan_index(
    pass: &RelationPass<'_>,
    index: &dyn IndexAccessMethod,
    expected: Option<u64>,
    diag: &mut Diagnostics,
    report: &mut RelationReport,
) -> Result<IndexBulkDeleteResult> {
    cleanup_index(pass, index, None, expected, diag, report)
}

/// Post-vacuum cleanup. Records the index's statistics and, when `expected`
/// is given, warns about a count that disagrees with the heap. Partial
/// indexes are never checked.
pub(crate) fn cleanup_index(
    pass: &RelationPass<'_>,
    index: &dyn IndexAccessMethod,
    prior: Option<IndexBulkDeleteResult>,
    expected: Option<u64>,
    diag: &mut Diagnostics,
    report: &mut RelationReport,
) -> Result<IndexBulkDeleteResult> {
    let stats = index.vacuum_cleanup(prior)?;
    let def = index.def();
    pass.db()
        .catalog()
        .relstats()
        .overwrite_in_place(def.id, |row| {
            row.pages = BlockNumber::try_from(stats.num_pages).unwrap_or(BlockNumber::MAX);
            row.tuples = stats.num_index_tuples;
            row.has_index = false;
        });
    diag.detail(
        pass.relname,
        &format!(
            "index \"{}\" now contains {} row versions in {} pages; \
             {} index row versions were removed; \
             {} index pages have been deleted, {} are currently reusable",
            def.name,
            stats.num_index_tuples,
            stats.num_pages,
            stats.tuples_removed,
            stats.pages_deleted,
            stats.pages_free,
        ),
    );
    if let Some(expected) = expected.filter(|_| !index.is_partial()) {
        if stats.num_index_tuples != expected {
            diag.warn(
                WarningKind::IndexCountMismatch,
                Some(pass.relname),
                format!(
                    "index \"{}\" contains {} row versions, but table contains {} row versions; \
                     rebuild the index",
                    def.name, stats.num_index_tuples, expected
                ),
            );
        }
    }
    report.record_index(IndexReport {
        name: def.name.clone(),
        index: def.id,
        result: stats,
    });
    Ok(stats)
}
