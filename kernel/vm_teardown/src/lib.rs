//! Tearing down mapped virtual address ranges, and whole address spaces.
//!
//! Deleting a range walks its leaf page tables in order, skipping over
//! absent tables entirely, and deletes every non-empty entry with
//! [`delete_one_mapping()`]. Leaf tables that become empty are reclaimed
//! right away, along with any ancestors they leave empty.
//!
//! Everything here runs under the working-set lock, with the coarse
//! page-ownership lock held for the duration of each leaf table.
//! The coarse lock is still dropped now and then: around every clone-record
//! update, and after every [`TEARDOWN_LOCK_BATCH`] deletions, so a huge
//! teardown doesn't starve everyone else. Deferred TLB invalidations
//! are always issued before the coarse lock is dropped.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
mod test;

mod delete;
mod range;

pub use delete::{delete_one_mapping, DeleteOutcome};
pub use range::{IndirectionTable, RangeDescriptor, Subrange};

use core::cmp::min;
use kernel_config::working_set::TEARDOWN_LOCK_BATCH;
use memory_structs::{Page, PageRange, VirtualAddress};
use page_table::Walk;
use range::SharedCursor;
use tlb_shootdown::FlushList;
use working_set::{MemoryServices, WorkingSet, WorkingSetContext, WorkingSetError};

/// What a teardown released.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeardownSummary {
    /// Leaf entries that were deleted.
    pub entries_deleted: usize,
    /// Page tables reclaimed because they became empty.
    pub tables_reclaimed: usize,
    /// Times the coarse lock was dropped and taken again.
    pub lock_reacquisitions: usize,
}

/// Deletes every mapping from `start` to `end` (both inclusive) in the working set `ws`.
///
/// `range` describes what backs the addresses, if known, and must then cover them all.
/// For a shared range, each valid page is checked against the prototype entry
/// the range maps it from.
/// Empty entries are skipped, so deleting the same range twice does nothing the second time.
pub fn delete_range(
    ws: &mut WorkingSet,
    start: VirtualAddress,
    end: VirtualAddress,
    range: Option<&RangeDescriptor>,
    services: &MemoryServices,
) -> Result<TeardownSummary, WorkingSetError> {
    if start > end || !ws.layout().is_user_address(end) {
        return Err(WorkingSetError::InvalidAddress);
    }
    let pages = PageRange::new(Page::containing_address(start), Page::containing_address(end));
    if let Some(r) = range {
        if !r.pages().contains(&pages.start()) || !r.pages().contains(&pages.end()) {
            warn!("delete_range(): {:?} is not within {:?}", pages, r.pages());
            return Err(WorkingSetError::InvalidAddress);
        }
    }
    let summary = delete_pages(ws, pages, range, false, services);
    debug!("delete_range(): {:?} of {:?}: {:?}", pages, ws.space(), summary);
    Ok(summary)
}

/// Tears down the whole address space behind `context`:
/// every user mapping, every page table, and the working set itself.
///
/// Taking the context by value guarantees that no one else can still be using
/// the address space, which lets its working-set entries be removed in bulk.
pub fn delete_address_space(context: WorkingSetContext, services: &MemoryServices) -> TeardownSummary {
    let mut ws = context.into_inner();
    let space = ws.space();
    let user = PageRange::new(
        Page::containing_address(VirtualAddress::zero()),
        Page::containing_address(ws.layout().user_last_address()),
    );
    let summary = delete_pages(&mut ws, user, None, true, services);
    let mut pages = services.ownership.lock();
    ws.destroy(&mut pages, services);
    info!("delete_address_space(): destroyed {:?}: {:?}", space, summary);
    summary
}

fn delete_pages(
    ws: &mut WorkingSet,
    pages_to_delete: PageRange,
    range: Option<&RangeDescriptor>,
    whole_space: bool,
    services: &MemoryServices,
) -> TeardownSummary {
    let store = services.backing_store;
    let invalidator = services.invalidator;
    let range = range.filter(|r| r.is_shared());
    let mut flush = FlushList::new(ws.config().flush_list_capacity, ws.config().broadcast_invalidations);
    let mut summary = TeardownSummary::default();
    let last = pages_to_delete.end();
    let mut pages = services.ownership.lock();

    let mut next = Some(pages_to_delete.start().start_address());
    while let Some(vaddr) = next {
        if Page::containing_address(vaddr) > last {
            break;
        }
        let mut leaf = match ws.page_table().walk(vaddr) {
            Walk::Leaf(leaf) => leaf,
            Walk::Absent { resume_at, .. } => {
                next = resume_at;
                continue;
            }
        };
        next = vaddr.next_region_at_level(1);
        let chunk_end = match next {
            Some(n) => min(last, Page::containing_address(n) - 1),
            None => last,
        };
        let chunk = PageRange::new(Page::containing_address(vaddr), chunk_end);

        if whole_space {
            flush.flush(invalidator);
            pages.release();
            ws.remove_range_without_descriptors(&chunk);
            pages.reacquire();
        }

        let mut cursor = SharedCursor::at(range, chunk.start());
        let mut since_reacquire = 0;
        for page in chunk {
            let hint = cursor.next_entry();
            let index = page.level_index(0);
            let table = ws.page_table_mut().table_mut(leaf);
            if table.entry(index).is_unused() {
                continue;
            }
            table.decrement_occupancy();
            let outcome = delete_one_mapping(
                ws, page.start_address(), leaf, whole_space, hint, Some(&mut flush), &mut pages, services,
            );
            summary.entries_deleted += 1;
            since_reacquire += 1;

            let mut revalidate = outcome == DeleteOutcome::CompletedWithReacquire;
            if since_reacquire >= TEARDOWN_LOCK_BATCH {
                flush.flush(invalidator);
                pages.release();
                pages.reacquire();
                revalidate = true;
            }
            if revalidate {
                since_reacquire = 0;
                leaf = match ws.page_table().leaf_for(page.start_address()) {
                    Some(l) => l,
                    None => {
                        error!("delete_pages(): the leaf table for {:?} of {:?} vanished", page, ws.space());
                        panic!("BUG: a leaf page table was freed while its entries were being deleted");
                    }
                };
            }
        }

        flush.flush(invalidator);
        if ws.page_table().table(leaf).occupancy() == 0 {
            summary.tables_reclaimed += ws.page_table_mut().reclaim_empty(leaf, &mut pages, store).len();
        }
    }

    flush.flush(invalidator);
    summary.lock_reacquisitions = pages.reacquisitions();
    summary
}
