//! Deleting a single leaf entry, whatever state it's in.

use memory_structs::{Page, VirtualAddress};
use page_ownership::{CoarseLock, PageOwner};
use page_table::TableId;
use page_table_entry::{CloneId, PageTableEntry, PrototypeRef, SharedIndirection};
use tlb_shootdown::FlushList;
use working_set::{MemoryServices, WorkingSet};

/// What happened to the coarse lock while deleting one mapping.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Completed,
    /// The coarse lock was released and reacquired,
    /// so anything resolved under it before the call must be re-validated.
    CompletedWithReacquire,
}

/// Deletes the leaf entry mapping `vaddr` in table `leaf`, releasing whatever it refers to,
/// and leaves the entry empty.
///
/// The caller has already dropped the leaf table's occupancy for this entry;
/// the entry itself must not be empty.
///
/// * `whole_space`: the entire address space is being torn down, so unlocked
///   working-set entries were already removed in bulk.
/// * `shared_hint`: the prototype entry the caller expects a valid shared page to come from.
/// * `flush`: a list to batch the invalidation into. Without one, it's issued right away.
///
/// `pages` must be held on entry, and is held on return.
#[allow(clippy::too_many_arguments)]
pub fn delete_one_mapping(
    ws: &mut WorkingSet,
    vaddr: VirtualAddress,
    leaf: TableId,
    whole_space: bool,
    shared_hint: Option<PrototypeRef>,
    mut flush: Option<&mut FlushList>,
    pages: &mut CoarseLock<'_>,
    services: &MemoryServices,
) -> DeleteOutcome {
    let page = Page::containing_address(vaddr);
    let store = services.backing_store;
    let space = ws.space();
    let all_cores = ws.config().broadcast_invalidations;
    let table = ws.page_table_mut().table_mut(leaf);
    let container = table.frame();
    let previous = table.entry_mut(vaddr.level_index(0)).zero();

    match previous {
        PageTableEntry::Empty => {
            error!("delete_one_mapping(): {:?} in {:?} is already empty", vaddr, space);
            panic!("BUG: deleted a page table entry that was not in use");
        }

        PageTableEntry::Valid { frame, flags } => {
            if !whole_space || ws.locked_user_pages() != 0 {
                let removed = ws.remove_page(page, frame, pages);
                if removed.is_none() && !whole_space {
                    warn!("delete_one_mapping(): valid {:?} of {:?} was not in the working set", page, space);
                }
            }
            let desc = pages.get_mut(frame);
            if whole_space && desc.wsle.map_or(false, |w| w.space == space) {
                desc.wsle = None;
            }
            if flags.is_dirty() {
                desc.modified = true;
            }
            let owner = desc.owner;
            match flush.as_deref_mut() {
                Some(list) => list.push(vaddr),
                None => services.invalidator.flush_one(vaddr, all_cores),
            }
            pages.decrement_share(container, store);

            match owner {
                PageOwner::Private { .. } => {
                    pages.mark_deleted(frame);
                    pages.decrement_share(frame, store);
                    ws.decrement_private_pages();
                }
                PageOwner::Prototype(proto) => {
                    if shared_hint.map_or(false, |hint| hint != proto) {
                        error!("delete_one_mapping(): {:?} maps {:?} of {:?}, expected {:?}", vaddr, frame, proto, shared_hint);
                        panic!("BUG: a shared mapping doesn't match the prototype entry of its range");
                    }
                    pages.decrement_share(frame, store);
                }
                PageOwner::Clone(id) => {
                    pages.decrement_share(frame, store);
                    return release_clone_reference(id, flush, pages, services);
                }
                other => {
                    error!("delete_one_mapping(): {:?} maps {:?} owned by {:?}", vaddr, frame, other);
                    panic!("BUG: a user mapping points at a page that isn't a user page");
                }
            }
        }

        PageTableEntry::Transition { frame, .. } => {
            match pages.get(frame).owner {
                PageOwner::Private { space: s, page: p } if s == space && p == page => {}
                other => {
                    error!("delete_one_mapping(): transition {:?} at {:?} of {:?} is owned by {:?}", frame, vaddr, space, other);
                    panic!("BUG: a transition entry's page doesn't point back at it");
                }
            }
            pages.mark_deleted(frame);
            pages.decrement_share(container, store);
            if pages.get(frame).reference_count() == 0 {
                pages.reclaim_unreferenced(frame, store);
            }
            ws.decrement_private_pages();
        }

        PageTableEntry::BackingStore(location) => {
            if store.release_block(location) {
                ws.decrement_private_pages();
            }
        }

        PageTableEntry::Shared { indirection, .. } => {
            if let SharedIndirection::Clone(id) = indirection {
                return release_clone_reference(id, flush, pages, services);
            }
        }
    }
    DeleteOutcome::Completed
}

/// Drops one reference to clone record `id`, disposing of the record
/// and its page once the last reference is gone.
///
/// The clone-record lock ranks above the coarse lock,
/// so the coarse lock is released around taking it.
fn release_clone_reference(
    id: CloneId,
    flush: Option<&mut FlushList>,
    pages: &mut CoarseLock<'_>,
    services: &MemoryServices,
) -> DeleteOutcome {
    let store = services.backing_store;
    if let Some(list) = flush {
        list.flush(services.invalidator);
    }
    pages.release();
    let disposed = services.clones.lock().decrement(id);
    pages.reacquire();

    if let Some(record) = disposed {
        trace!("delete_one_mapping(): disposing of {:?}", id);
        if let Some(frame) = record.frame {
            if !pages.get(frame).is_deleted() {
                pages.mark_deleted(frame);
            }
            if pages.get(frame).reference_count() == 0 {
                pages.reclaim_unreferenced(frame, store);
            }
        }
        store.release_block(record.backing);
    }
    DeleteOutcome::CompletedWithReacquire
}
