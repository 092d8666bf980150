//! Tests for range deletion and address-space teardown.

extern crate std;

use super::*;
use alloc::vec;
use backing_store::PagingFile;
use memory_structs::{Frame, PhysicalAddress};
use page_ownership::{CloneRecords, PageDescriptorTable, PageList, PageOwner, PageOwnership};
use page_table_entry::{BackingStoreLocation, PageTableEntry, PrototypeRef};
use pte_flags::PteFlags;
use tlb_shootdown::TlbInvalidator;
use working_set::WorkingSetConfig;
use self::std::{sync::Mutex, thread, vec::Vec};

#[derive(Default)]
struct RecordingInvalidator {
    ones: Mutex<Vec<VirtualAddress>>,
    batches: Mutex<Vec<Vec<VirtualAddress>>>,
    alls: Mutex<usize>,
}

impl TlbInvalidator for RecordingInvalidator {
    fn flush_one(&self, vaddr: VirtualAddress, _all_cores: bool) {
        self.ones.lock().unwrap().push(vaddr);
    }
    fn flush_batch(&self, vaddrs: &[VirtualAddress], _all_cores: bool) {
        self.batches.lock().unwrap().push(vaddrs.to_vec());
    }
    fn flush_all(&self, _all_cores: bool) {
        *self.alls.lock().unwrap() += 1;
    }
}

struct Env {
    ownership: PageOwnership,
    clones: CloneRecords,
    store: PagingFile,
    invalidator: RecordingInvalidator,
}

impl Env {
    fn new() -> Env {
        let first = Frame::containing_address(PhysicalAddress::new_canonical(0x40_0000));
        Env {
            ownership: PageOwnership::new(PageDescriptorTable::new(first, 128)),
            clones: CloneRecords::new(),
            store: PagingFile::new(8),
            invalidator: RecordingInvalidator::default(),
        }
    }

    fn services(&self) -> MemoryServices<'_> {
        MemoryServices {
            ownership: &self.ownership,
            clones: &self.clones,
            backing_store: &self.store,
            invalidator: &self.invalidator,
        }
    }

    fn working_set(&self) -> WorkingSet {
        self.working_set_with(config())
    }

    fn working_set_with(&self, config: WorkingSetConfig) -> WorkingSet {
        let id = self.ownership.new_address_space_id();
        let mut pages = self.ownership.lock();
        WorkingSet::new(id, config, &mut pages, &self.services()).unwrap()
    }

    fn free_count(&self) -> usize {
        self.ownership.lock().free_count()
    }

    fn list_of(&self, frame: Frame) -> PageList {
        self.ownership.lock().get(frame).list()
    }

    /// Allocates a page for `owner` that no one maps yet.
    fn unmapped_page(&self, owner: PageOwner) -> Frame {
        let mut pages = self.ownership.lock();
        let frame = pages.allocate_page(owner).unwrap();
        pages.decrement_share(frame, &self.store);
        frame
    }

    /// Installs a non-resident entry at `vaddr`.
    fn install(&self, ws: &mut WorkingSet, vaddr: VirtualAddress, entry: PageTableEntry) {
        let mut pages = self.ownership.lock();
        ws.page_table_mut().ensure_path(vaddr, &mut pages, &self.store).unwrap();
        ws.page_table_mut().install(vaddr, entry, &mut pages).unwrap();
    }
}

/// Two levels, so one leaf table covers 512 pages.
fn config() -> WorkingSetConfig {
    WorkingSetConfig::default().with_hierarchy_depth(2)
}

fn va(n: usize) -> VirtualAddress {
    VirtualAddress::new_canonical(n * 0x1000)
}

fn page(n: usize) -> Page {
    Page::containing_address(va(n))
}

fn rw() -> PteFlags {
    PteFlags::new().writable(true)
}

fn assert_consistent(env: &Env, ws: &WorkingSet) {
    let pages = env.ownership.lock();
    assert_eq!(ws.check_invariants(&pages), Ok(()));
}

fn one_page_shared_range(n: usize, table: usize) -> RangeDescriptor {
    RangeDescriptor::shared(PageRange::new(page(n), page(n)), vec![Subrange {
        start: page(n),
        page_count: 1,
        table: IndirectionTable { id: table, len: 1 },
        first_index: 0,
    }])
}

#[test]
fn deleting_a_private_range_reclaims_its_leaf_table() {
    let env = Env::new();
    let s = env.services();
    let mut ws = env.working_set();
    let before = env.free_count();
    let first = ws.map_private_page(va(1), rw(), &s).unwrap();
    let third = ws.map_private_page(va(3), rw(), &s).unwrap();
    assert_eq!(ws.page_table().leaf_for(va(1)).map(|l| ws.page_table().table(l).occupancy()), Some(2));

    let summary = delete_range(&mut ws, va(1), va(3), None, &s).unwrap();
    assert_eq!(summary.entries_deleted, 2);
    assert_eq!(summary.tables_reclaimed, 1);
    assert_eq!(ws.page_table().leaf_for(va(1)), None);
    assert_eq!(env.list_of(first), PageList::Free);
    assert_eq!(env.list_of(third), PageList::Free);
    assert_eq!(env.free_count(), before);
    assert_eq!(ws.size(), ws.list().first_dynamic());
    assert_eq!(ws.stats().private_pages, 0);
    assert_consistent(&env, &ws);

    // nothing is left to delete the second time around
    let again = delete_range(&mut ws, va(1), va(3), None, &s).unwrap();
    assert_eq!(again, TeardownSummary::default());
    assert_eq!(env.free_count(), before);
}

#[test]
fn deleting_part_of_a_leaf_keeps_the_rest() {
    let env = Env::new();
    let s = env.services();
    let mut ws = env.working_set();
    ws.map_private_page(va(1), rw(), &s).unwrap();
    let kept = ws.map_private_page(va(2), rw(), &s).unwrap();

    let summary = delete_range(&mut ws, va(1), va(1), None, &s).unwrap();
    assert_eq!(summary.entries_deleted, 1);
    assert_eq!(summary.tables_reclaimed, 0);
    assert_eq!(ws.page_table().entry(va(1)), Some(&PageTableEntry::Empty));
    assert_eq!(ws.page_table().entry(va(2)).and_then(|e| e.pointed_frame()), Some(kept));
    assert_eq!(ws.stats().private_pages, 1);
    assert_consistent(&env, &ws);
}

#[test]
fn invalid_ranges_are_rejected() {
    let env = Env::new();
    let s = env.services();
    let mut ws = env.working_set();
    assert_eq!(delete_range(&mut ws, va(3), va(1), None, &s), Err(WorkingSetError::InvalidAddress));
    let list_page = ws.layout().wsl_page(0).start_address();
    assert_eq!(delete_range(&mut ws, va(0), list_page, None, &s), Err(WorkingSetError::InvalidAddress));
}

#[test]
fn shared_page_is_freed_with_its_last_mapping() {
    let env = Env::new();
    let s = env.services();
    let mut a = env.working_set();
    let mut b = env.working_set();
    let frame = env.unmapped_page(PageOwner::Prototype(PrototypeRef { table: 7, index: 0 }));
    a.map_shared_page(va(5), frame, rw(), &s).unwrap();
    b.map_shared_page(va(5), frame, rw(), &s).unwrap();
    assert_eq!(env.ownership.lock().get(frame).share_count(), 2);
    // the section behind the prototype table is going away
    env.ownership.lock().mark_deleted(frame);

    let range = one_page_shared_range(5, 7);
    delete_range(&mut a, va(5), va(5), Some(&range), &s).unwrap();
    assert_eq!(env.ownership.lock().get(frame).share_count(), 1);
    assert_eq!(env.list_of(frame), PageList::Active);
    assert_consistent(&env, &b);

    delete_range(&mut b, va(5), va(5), Some(&range), &s).unwrap();
    assert_eq!(env.list_of(frame), PageList::Free);
    assert_consistent(&env, &a);
    assert_consistent(&env, &b);
}

#[test]
#[should_panic(expected = "BUG")]
fn shared_page_from_the_wrong_prototype_entry_panics() {
    let env = Env::new();
    let s = env.services();
    let mut ws = env.working_set();
    let frame = env.unmapped_page(PageOwner::Prototype(PrototypeRef { table: 7, index: 0 }));
    ws.map_shared_page(va(5), frame, rw(), &s).unwrap();
    let _ = delete_range(&mut ws, va(5), va(5), Some(&one_page_shared_range(5, 8)), &s);
}

#[test]
fn clone_records_are_disposed_of_with_their_last_reference() {
    let env = Env::new();
    let s = env.services();
    let mut a = env.working_set();
    let mut b = env.working_set();
    let backing = env.store.reserve_block().unwrap();
    let id = env.clones.lock().create(0, None, backing);
    let frame = env.unmapped_page(PageOwner::Clone(id));
    if let Some(record) = env.clones.lock().get_mut(id) {
        record.frame = Some(frame);
    }
    a.map_clone_page(va(2), id, rw(), &s).unwrap();
    b.map_clone_page(va(2), id, rw(), &s).unwrap();
    assert_eq!(env.clones.lock().get(id).map(|r| r.references), Some(2));

    // dropping a record reference takes the clone-record lock, so the coarse lock is dropped around it
    let summary = delete_range(&mut a, va(2), va(2), None, &s).unwrap();
    assert_eq!(summary.lock_reacquisitions, 1);
    assert_eq!(env.clones.lock().get(id).map(|r| r.references), Some(1));
    assert_eq!(env.list_of(frame), PageList::Active);

    delete_range(&mut b, va(2), va(2), None, &s).unwrap();
    assert!(env.clones.lock().get(id).is_none());
    assert_eq!(env.list_of(frame), PageList::Free);
    assert_eq!(env.store.reserved_count(), 0);
    assert_consistent(&env, &b);
}

#[test]
fn evicted_clone_page_still_drops_its_record_reference() {
    let env = Env::new();
    let s = env.services();
    let mut ws = env.working_set();
    let id = env.clones.lock().create(0, None, BackingStoreLocation::NoBlock);
    let frame = env.unmapped_page(PageOwner::Clone(id));
    if let Some(record) = env.clones.lock().get_mut(id) {
        record.frame = Some(frame);
    }
    ws.map_clone_page(va(2), id, rw(), &s).unwrap();
    ws.trim(0, &s);
    assert!(matches!(ws.page_table().entry(va(2)), Some(PageTableEntry::Shared { .. })));

    let summary = delete_range(&mut ws, va(2), va(2), None, &s).unwrap();
    assert_eq!(summary.entries_deleted, 1);
    assert_eq!(summary.lock_reacquisitions, 1);
    assert!(env.clones.lock().get(id).is_none());
    assert_eq!(env.list_of(frame), PageList::Free);
}

#[test]
fn backing_store_blocks_are_released() {
    let env = Env::new();
    let s = env.services();
    let mut ws = env.working_set();
    let block = env.store.reserve_block().unwrap();
    env.install(&mut ws, va(9), PageTableEntry::BackingStore(block));
    env.install(&mut ws, va(10), PageTableEntry::BackingStore(BackingStoreLocation::NoBlock));
    assert_eq!(env.store.reserved_count(), 1);

    let summary = delete_range(&mut ws, va(0), va(20), None, &s).unwrap();
    assert_eq!(summary.entries_deleted, 2);
    assert_eq!(summary.tables_reclaimed, 1);
    assert_eq!(env.store.reserved_count(), 0);
}

#[test]
fn transition_pages_are_reclaimed() {
    let env = Env::new();
    let s = env.services();
    let mut ws = env.working_set();
    let frames: Vec<Frame> = (0..3).map(|n| ws.map_private_page(va(n), rw(), &s).unwrap()).collect();
    ws.trim(0, &s);
    assert!(ws.page_table().entry(va(0)).map_or(false, |e| e.is_transition()));
    assert_eq!(env.ownership.lock().standby_count(), 3);

    let summary = delete_range(&mut ws, va(0), va(2), None, &s).unwrap();
    assert_eq!(summary.entries_deleted, 3);
    assert_eq!(env.ownership.lock().standby_count(), 0);
    for frame in frames {
        assert_eq!(env.list_of(frame), PageList::Free);
    }
    assert_eq!(ws.stats().private_pages, 0);
    assert_eq!(ws.page_table().leaf_for(va(0)), None);
}

#[test]
fn pinned_transition_page_is_freed_when_unpinned() {
    let env = Env::new();
    let s = env.services();
    let mut ws = env.working_set();
    let frame = ws.map_private_page(va(4), rw(), &s).unwrap();
    env.ownership.lock().pin(frame);
    // pinned pages can't be trimmed, so invalidate the mapping by hand
    {
        let mut pages = env.ownership.lock();
        ws.remove_page(page(4), frame, &mut pages).unwrap();
        ws.page_table_mut().entry_mut(va(4)).unwrap().set_transition();
        pages.decrement_share(frame, &env.store);
    }

    delete_range(&mut ws, va(4), va(4), None, &s).unwrap();
    assert_eq!(env.list_of(frame), PageList::Active);
    env.ownership.lock().unpin(frame, &env.store);
    assert_eq!(env.list_of(frame), PageList::Free);
}

#[test]
#[should_panic(expected = "BUG")]
fn transition_page_owned_elsewhere_panics() {
    let env = Env::new();
    let s = env.services();
    let mut ws = env.working_set();
    let frame = ws.map_private_page(va(4), rw(), &s).unwrap();
    ws.trim(0, &s);
    let space = ws.space();
    env.ownership.lock().get_mut(frame).owner = PageOwner::Private { space, page: page(9) };
    let _ = delete_range(&mut ws, va(4), va(4), None, &s);
}

#[test]
fn long_runs_flush_in_batches_and_drop_the_coarse_lock() {
    let env = Env::new();
    let s = env.services();
    let mut ws = env.working_set();
    for n in 0..40 {
        ws.map_private_page(va(n), rw(), &s).unwrap();
    }
    env.invalidator.batches.lock().unwrap().clear();

    let summary = delete_range(&mut ws, va(0), va(39), None, &s).unwrap();
    assert_eq!(summary.entries_deleted, 40);
    assert_eq!(summary.lock_reacquisitions, 40 / TEARDOWN_LOCK_BATCH);
    let batches: Vec<usize> = env.invalidator.batches.lock().unwrap().iter().map(|b| b.len()).collect();
    assert_eq!(batches, [16, 16, 8]);
    assert_eq!(ws.stats().private_pages, 0);
    assert_consistent(&env, &ws);
}

#[test]
fn ranges_spanning_leaf_tables_skip_absent_ones() {
    let env = Env::new();
    let s = env.services();
    let mut ws = env.working_set();
    ws.map_private_page(va(511), rw(), &s).unwrap();
    ws.map_private_page(va(512), rw(), &s).unwrap();
    ws.map_private_page(va(5 * 512), rw(), &s).unwrap();
    let before_tables = ws.page_table().table_count();

    let summary = delete_range(&mut ws, va(0), va(6 * 512), None, &s).unwrap();
    assert_eq!(summary.entries_deleted, 3);
    assert_eq!(summary.tables_reclaimed, 3);
    assert_eq!(ws.page_table().table_count(), before_tables - 3);
    assert_consistent(&env, &ws);
}

#[test]
fn address_space_teardown_returns_every_page() {
    let env = Env::new();
    let s = env.services();
    let before = env.free_count();
    let proto = env.unmapped_page(PageOwner::Prototype(PrototypeRef { table: 3, index: 1 }));
    let block = env.store.reserve_block().unwrap();

    let context = WorkingSetContext::new(config(), &s).unwrap();
    {
        let mut ws = context.lock();
        ws.map_private_page(va(0), rw(), &s).unwrap();
        ws.map_private_page(va(1), rw(), &s).unwrap();
        ws.lock_page(va(1), &s).unwrap();
        ws.map_shared_page(va(3), proto, rw(), &s).unwrap();
        ws.map_private_page(va(600), rw(), &s).unwrap();
        env.install(&mut ws, va(700), PageTableEntry::BackingStore(block));
    }
    env.ownership.lock().mark_deleted(proto);

    let summary = delete_address_space(context, &s);
    assert_eq!(summary.entries_deleted, 5);
    assert_eq!(summary.tables_reclaimed, 2);
    assert_eq!(env.free_count(), before);
    assert_eq!(env.list_of(proto), PageList::Free);
    assert_eq!(env.store.reserved_count(), 0);
}

#[test]
fn shared_cursor_follows_the_subrange_chain() {
    let range = RangeDescriptor::shared(PageRange::new(page(10), page(19)), vec![
        Subrange { start: page(10), page_count: 4, table: IndirectionTable { id: 1, len: 8 }, first_index: 6 },
        Subrange { start: page(14), page_count: 6, table: IndirectionTable { id: 2, len: 6 }, first_index: 0 },
    ]);
    assert!(range.is_shared());

    let mut cursor = SharedCursor::at(Some(&range), page(11));
    let entries: Vec<_> = (0..5).map(|_| cursor.next_entry()).collect();
    assert_eq!(entries, [
        Some(PrototypeRef { table: 1, index: 7 }),
        None,
        None,
        Some(PrototypeRef { table: 2, index: 0 }),
        Some(PrototypeRef { table: 2, index: 1 }),
    ]);

    let private = RangeDescriptor::private(PageRange::new(page(0), page(3)));
    assert!(!private.is_shared());
    assert_eq!(SharedCursor::at(Some(&private), page(1)).next_entry(), None);
    assert_eq!(SharedCursor::at(None, page(1)).next_entry(), None);
}

#[test]
fn shared_cursor_finds_a_subrange_after_uncovered_pages() {
    let range = RangeDescriptor::shared(PageRange::new(page(0), page(9)), vec![
        Subrange { start: page(5), page_count: 5, table: IndirectionTable { id: 1, len: 5 }, first_index: 0 },
    ]);
    let mut cursor = SharedCursor::at(Some(&range), page(0));
    let entries: Vec<_> = (0..7).map(|_| cursor.next_entry()).collect();
    assert_eq!(entries, [
        None,
        None,
        None,
        None,
        None,
        Some(PrototypeRef { table: 1, index: 0 }),
        Some(PrototypeRef { table: 1, index: 1 }),
    ]);
}

#[test]
fn shared_cursor_crosses_a_gap_between_subranges() {
    let range = RangeDescriptor::shared(PageRange::new(page(0), page(9)), vec![
        Subrange { start: page(2), page_count: 2, table: IndirectionTable { id: 1, len: 2 }, first_index: 0 },
        Subrange { start: page(6), page_count: 2, table: IndirectionTable { id: 2, len: 4 }, first_index: 2 },
    ]);
    let mut cursor = SharedCursor::at(Some(&range), page(3));
    let entries: Vec<_> = (0..6).map(|_| cursor.next_entry()).collect();
    assert_eq!(entries, [
        Some(PrototypeRef { table: 1, index: 1 }),
        None,
        None,
        Some(PrototypeRef { table: 2, index: 2 }),
        Some(PrototypeRef { table: 2, index: 3 }),
        None,
    ]);
}

/// A shared range of pages 0 to 9, of which only pages 5 to 9 are backed by table 7.
fn partly_backed_shared_range() -> RangeDescriptor {
    RangeDescriptor::shared(PageRange::new(page(0), page(9)), vec![Subrange {
        start: page(5),
        page_count: 5,
        table: IndirectionTable { id: 7, len: 5 },
        first_index: 0,
    }])
}

#[test]
fn shared_range_starting_after_its_leaf_is_checked() {
    let env = Env::new();
    let s = env.services();
    let mut ws = env.working_set();
    let frame = env.unmapped_page(PageOwner::Prototype(PrototypeRef { table: 7, index: 1 }));
    ws.map_shared_page(va(6), frame, rw(), &s).unwrap();

    let summary = delete_range(&mut ws, va(0), va(9), Some(&partly_backed_shared_range()), &s).unwrap();
    assert_eq!(summary.entries_deleted, 1);
    assert_eq!(env.ownership.lock().get(frame).share_count(), 0);
    assert_eq!(env.list_of(frame), PageList::Standby);
    assert_consistent(&env, &ws);
}

#[test]
#[should_panic(expected = "BUG")]
fn mismatched_page_after_uncovered_pages_panics() {
    let env = Env::new();
    let s = env.services();
    let mut ws = env.working_set();
    let frame = env.unmapped_page(PageOwner::Prototype(PrototypeRef { table: 7, index: 0 }));
    ws.map_shared_page(va(6), frame, rw(), &s).unwrap();
    let _ = delete_range(&mut ws, va(0), va(9), Some(&partly_backed_shared_range()), &s);
}

#[test]
fn range_outside_its_descriptor_is_rejected() {
    let env = Env::new();
    let s = env.services();
    let mut ws = env.working_set();
    ws.map_private_page(va(12), rw(), &s).unwrap();
    let range = RangeDescriptor::private(PageRange::new(page(0), page(9)));
    assert_eq!(delete_range(&mut ws, va(8), va(12), Some(&range), &s), Err(WorkingSetError::InvalidAddress));
    assert_eq!(ws.stats().private_pages, 1);
    assert_eq!(delete_range(&mut ws, va(0), va(9), Some(&range), &s).map(|t| t.entries_deleted), Ok(0));
}

#[test]
fn overflowing_the_flush_list_invalidates_everything_once() {
    let env = Env::new();
    let s = env.services();
    let mut ws = env.working_set_with(config().with_flush_list_capacity(4));
    for n in 0..10 {
        ws.map_private_page(va(n), rw(), &s).unwrap();
    }
    env.invalidator.ones.lock().unwrap().clear();
    env.invalidator.batches.lock().unwrap().clear();

    let summary = delete_range(&mut ws, va(0), va(9), None, &s).unwrap();
    assert_eq!(summary.entries_deleted, 10);
    assert_eq!(*env.invalidator.alls.lock().unwrap(), 1);
    assert!(env.invalidator.ones.lock().unwrap().is_empty());
    assert!(env.invalidator.batches.lock().unwrap().is_empty());
    assert_consistent(&env, &ws);
}

#[test]
fn address_spaces_sharing_a_page_tear_down_in_parallel() {
    let env = Env::new();
    let s = env.services();
    let proto = env.unmapped_page(PageOwner::Prototype(PrototypeRef { table: 4, index: 0 }));
    let before = env.free_count();
    let range = one_page_shared_range(100, 4);
    let contexts: Vec<WorkingSetContext> = (0..2).map(|_| WorkingSetContext::new(config(), &s).unwrap()).collect();

    thread::scope(|scope| {
        for context in &contexts {
            let (s, range) = (&s, &range);
            scope.spawn(move || {
                for _ in 0..25 {
                    let mut ws = context.lock();
                    ws.map_shared_page(va(100), proto, rw(), s).unwrap();
                    for n in 0..8 {
                        ws.map_private_page(va(n), rw(), s).unwrap();
                    }
                    ws.trim(4, s);
                    delete_range(&mut ws, va(0), va(7), None, s).unwrap();
                    delete_range(&mut ws, va(100), va(100), Some(range), s).unwrap();
                    assert_eq!(ws.stats().private_pages, 0);
                }
            });
        }
    });

    for context in &contexts {
        assert_consistent(&env, &context.lock());
    }
    assert_eq!(env.ownership.lock().get(proto).share_count(), 0);
    assert_eq!(env.list_of(proto), PageList::Standby);
    for context in contexts {
        delete_address_space(context, &s);
    }
    assert_eq!(env.free_count(), before);
}
