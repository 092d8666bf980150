//! Tests for share/reference counting, page lists, the coarse lock guard, and clone records.

extern crate std;

use super::*;
use backing_store::PagingFile;
use memory_structs::{PhysicalAddress, VirtualAddress};

fn table(count: usize) -> PageDescriptorTable {
    PageDescriptorTable::new(Frame::containing_address(PhysicalAddress::new_canonical(0x10_0000)), count)
}

fn private_owner() -> PageOwner {
    PageOwner::Private {
        space: AddressSpaceId(1),
        page: Page::containing_address(VirtualAddress::new_canonical(0x4000)),
    }
}

#[test]
fn allocate_until_exhausted() {
    let mut t = table(2);
    let a = t.allocate_page(private_owner()).unwrap();
    let b = t.allocate_page(private_owner()).unwrap();
    assert!(a < b);
    assert!(t.allocate_page(private_owner()).is_none());
    assert_eq!(t.get(a).share_count(), 1);
    assert_eq!(t.get(a).reference_count(), 1);
    assert_eq!(t.get(a).list(), PageList::Active);
}

#[test]
fn deleted_page_returns_to_free_pool_at_zero() {
    let store = PagingFile::new(8);
    let mut t = table(4);
    let frame = t.allocate_page(PageOwner::Prototype(PrototypeRef { table: 0, index: 0 })).unwrap();
    t.increment_share(frame);
    assert_eq!(t.get(frame).share_count(), 2);
    assert_eq!(t.get(frame).reference_count(), 1);
    t.mark_deleted(frame);

    t.decrement_share(frame, &store);
    assert_eq!(t.get(frame).share_count(), 1);
    assert_eq!(t.free_count(), 3);

    t.decrement_share(frame, &store);
    assert_eq!(t.get(frame).share_count(), 0);
    assert_eq!(t.get(frame).list(), PageList::Free);
    assert_eq!(t.free_count(), 4);
}

#[test]
fn undeleted_page_goes_to_standby_or_modified() {
    let store = PagingFile::new(8);
    let mut t = table(4);
    let clean = t.allocate_page(private_owner()).unwrap();
    let dirty = t.allocate_page(private_owner()).unwrap();
    t.get_mut(dirty).modified = true;
    t.decrement_share(clean, &store);
    t.decrement_share(dirty, &store);
    assert_eq!(t.get(clean).list(), PageList::Standby);
    assert_eq!(t.get(dirty).list(), PageList::Modified);
    assert_eq!(t.standby_count(), 1);
    assert_eq!(t.modified_count(), 1);

    // faulting the page back in takes it off the list
    t.increment_share(clean);
    assert_eq!(t.get(clean).list(), PageList::Active);
    assert_eq!(t.get(clean).reference_count(), 1);
    assert_eq!(t.standby_count(), 0);
}

#[test]
fn reclaim_releases_backing_block() {
    let store = PagingFile::new(8);
    let mut t = table(4);
    let frame = t.allocate_page(private_owner()).unwrap();
    t.get_mut(frame).backing = store.reserve_block().unwrap();
    t.decrement_share(frame, &store);
    assert_eq!(store.reserved_count(), 1);

    t.mark_deleted(frame);
    t.reclaim_unreferenced(frame, &store);
    assert_eq!(store.reserved_count(), 0);
    assert_eq!(t.standby_count(), 0);
    assert_eq!(t.free_count(), 4);
}

#[test]
fn pinned_page_outlives_its_last_share() {
    let store = PagingFile::new(8);
    let mut t = table(4);
    let frame = t.allocate_page(private_owner()).unwrap();
    assert!(!t.get(frame).is_pinned());
    t.pin(frame);
    assert!(t.get(frame).is_pinned());
    t.mark_deleted(frame);
    t.decrement_share(frame, &store);
    assert_eq!(t.get(frame).list(), PageList::Active);
    assert_eq!(t.free_count(), 3);
    t.unpin(frame, &store);
    assert_eq!(t.free_count(), 4);
}

#[test]
#[should_panic(expected = "BUG")]
fn share_count_underflow_is_fatal() {
    let store = PagingFile::new(8);
    let mut t = table(4);
    let frame = t.allocate_page(private_owner()).unwrap();
    t.decrement_share(frame, &store);
    t.decrement_share(frame, &store);
}

#[test]
#[should_panic(expected = "BUG")]
fn double_delete_is_fatal() {
    let mut t = table(4);
    let frame = t.allocate_page(private_owner()).unwrap();
    t.mark_deleted(frame);
    t.mark_deleted(frame);
}

#[test]
fn coarse_lock_release_and_reacquire() {
    let ownership = PageOwnership::new(table(4));
    let mut lock = ownership.lock();
    let frame = lock.allocate_page(private_owner()).unwrap();
    lock.release();
    assert!(!lock.is_held());
    // another party can take the lock in the meantime
    assert_eq!(ownership.lock().get(frame).share_count(), 1);
    lock.reacquire();
    lock.reacquire();
    assert!(lock.is_held());
    assert_eq!(lock.reacquisitions(), 1);
    assert_eq!(lock.free_count(), 3);
}

#[test]
#[should_panic(expected = "BUG")]
fn released_coarse_lock_cannot_be_used() {
    let ownership = PageOwnership::new(table(4));
    let mut lock = ownership.lock();
    lock.release();
    let _ = lock.free_count();
}

#[test]
fn clone_record_lifecycle() {
    let records = CloneRecords::new();
    let mut arena = records.lock();
    let id = arena.create(2, None, BackingStoreLocation::Block(5));
    assert_eq!(arena.get(id).unwrap().references, 2);
    assert!(arena.decrement(id).is_none());
    let last = arena.decrement(id).unwrap();
    assert_eq!(last.backing, BackingStoreLocation::Block(5));
    assert!(arena.get(id).is_none());
    assert!(arena.is_empty());
    // the slot is reused
    assert_eq!(arena.create(1, None, BackingStoreLocation::NoBlock), id);
}

#[test]
fn address_space_ids_are_unique() {
    let ownership = PageOwnership::new(table(1));
    let a = ownership.new_address_space_id();
    let b = ownership.new_address_space_id();
    assert_ne!(a, b);
}
