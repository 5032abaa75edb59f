#![forbid(unsafe_code)]

//! Full vacuum of one relation under its exclusive lock: scan, index
//! cleanup, compaction (or in-place reaping), free-space publishing and
//! statistics.

use tracing::info;

use crate::types::Result;
use crate::vacuum::fsm::publish_target_pages;
use crate::vacuum::index::{scan_index, vacuum_index};
use crate::vacuum::pagelist::ReapedSet;
use crate::vacuum::repair::{repair_frag, vacuum_heap};
use crate::vacuum::report::{Diagnostics, RelationReport};
use crate::vacuum::scan::scan_heap;
use crate::vacuum::stats::update_relstats;
use crate::vacuum::RelationPass;

pub(crate) fn full_vacuum_rel(
    pass: &RelationPass<'_>,
    diag: &mut Diagnostics,
    report: &mut RelationReport,
) -> Result<()> {
    let mut scan = scan_heap(pass, diag)?;
    report.pages_before = scan.nblocks;
    report.removed = scan.tups_vacuumed;
    report.kept = scan.num_tuples;
    report.recently_dead = scan.nkeep;
    report.unused = scan.nunused;
    report.frozen = scan.frozen;
    report.empty_pages = scan.empty_pages;
    report.shrinkable = scan.shrinkable;

    let indexes = pass.heap.indexes();
    if !scan.pages.reapable.is_empty() {
        let reaped = ReapedSet::from_pages(scan.pages.reapable_pages());
        for index in &indexes {
            vacuum_index(
                pass,
                index.as_ref(),
                &|tid| reaped.contains(tid),
                scan.num_tuples,
                diag,
                report,
            )?;
        }
    } else {
        for index in &indexes {
            scan_index(pass, index.as_ref(), Some(scan.num_tuples), diag, report)?;
        }
    }

    let rel_pages = if !scan.pages.targets.is_empty() {
        let compaction = repair_frag(pass, &mut scan, diag, report)?;
        report.moved = compaction.moved;
        compaction.new_nblocks
    } else if !scan.pages.reapable.is_empty() {
        vacuum_heap(pass, &scan, diag)?
    } else {
        pass.wal().flush()?;
        pass.file().flush()?;
        scan.nblocks
    };
    report.pages_after = rel_pages;

    publish_target_pages(pass, scan.pages.target_pages(), rel_pages);
    update_relstats(pass, rel_pages, scan.num_tuples, !indexes.is_empty());

    info!(
        rel = pass.rel().0,
        pages_before = report.pages_before,
        pages_after = rel_pages,
        removed = report.removed,
        moved = report.moved,
        "vacuum.rel.full"
    );
    Ok(())
}
