//! Tests for walking, building, and reclaiming the hierarchy.

extern crate std;

use super::*;
use backing_store::PagingFile;
use memory_structs::PhysicalAddress;
use page_table_entry::BackingStoreLocation;

/// A `Valid` entry; the flags don't matter for these tests.
fn rw(frame: Frame) -> PageTableEntry {
    PageTableEntry::Valid { frame, flags: Default::default() }
}

fn pages(count: usize) -> PageDescriptorTable {
    PageDescriptorTable::new(Frame::containing_address(PhysicalAddress::new_canonical(0x200_0000)), count)
}

fn va(addr: usize) -> VirtualAddress {
    VirtualAddress::new_canonical(addr)
}

#[test]
fn rejects_unsupported_depths() {
    let mut p = pages(4);
    assert_eq!(PageTable::new(AddressSpaceId(1), 1, &mut p).err(), Some(PageTableError::InvalidDepth));
    assert_eq!(PageTable::new(AddressSpaceId(1), 5, &mut p).err(), Some(PageTableError::InvalidDepth));
    assert_eq!(p.free_count(), 4);
}

#[test]
fn self_map_addresses() {
    assert_eq!(table_virtual_address(4, 3, va(0x1234_5000)).value(), 0xFFFF_FF7F_BFDF_E000);
    // the leaf table covering 0x20_3000 in a two-level hierarchy
    assert_eq!(table_virtual_address(2, 0, va(0x20_3000)).value(), 0x3FC0_1000);
    assert_eq!(table_virtual_address(2, 1, va(0x20_3000)).value(), 0x3FDF_E000);
}

#[test]
fn walk_reports_absent_level() {
    let mut p = pages(8);
    let pt = PageTable::new(AddressSpaceId(1), 3, &mut p).unwrap();
    match pt.walk(va(0x40_1000)) {
        Walk::Absent { level, resume_at } => {
            assert_eq!(level, 1);
            assert_eq!(resume_at, Some(va(0x4000_0000)));
        }
        other => panic!("unexpected walk result {:?}", other),
    }
    assert!(pt.entry(va(0x40_1000)).is_none());
}

#[test]
fn build_install_and_reclaim() {
    let store = PagingFile::new(4);
    let mut p = pages(16);
    let mut pt = PageTable::new(AddressSpaceId(1), 4, &mut p).unwrap();
    let root_frame = pt.table(pt.root()).frame();

    let (leaf, created) = pt.ensure_path(va(0x7000), &mut p, &store).unwrap();
    assert_eq!(created.len(), 3);
    assert_eq!(pt.table_count(), 4);
    assert_eq!(p.get(root_frame).share_count(), 2);
    assert_eq!(created[2].0, Page::containing_address(pt.table_virtual_address(0, va(0x7000))));
    assert_eq!(pt.walk(va(0x7000)), Walk::Leaf(leaf));

    // a second path through the same tables creates nothing
    let (leaf2, created2) = pt.ensure_path(va(0x8000), &mut p, &store).unwrap();
    assert_eq!(leaf2, leaf);
    assert!(created2.is_empty());

    let data = p.allocate_page(PageOwner::None).unwrap();
    pt.install(va(0x7000), rw(data), &mut p).unwrap();
    pt.install(va(0x8000), PageTableEntry::BackingStore(BackingStoreLocation::NoBlock), &mut p).unwrap();
    assert_eq!(pt.install(va(0x7000), rw(data), &mut p), Err(PageTableError::AlreadyMapped));
    let leaf_frame = pt.table(leaf).frame();
    assert_eq!(pt.table(leaf).occupancy(), 2);
    // one for the parent link, one for the resident entry
    assert_eq!(p.get(leaf_frame).share_count(), 2);

    // tear both entries down by hand, then reclaim
    let t = pt.table_mut(leaf);
    t.entry_mut(va(0x7000).level_index(0)).zero();
    t.decrement_occupancy();
    t.entry_mut(va(0x8000).level_index(0)).zero();
    t.decrement_occupancy();
    p.decrement_share(leaf_frame, &store);
    p.mark_deleted(data);
    p.decrement_share(data, &store);

    let reclaimed = pt.reclaim_empty(leaf, &mut p, &store);
    assert_eq!(reclaimed.len(), 3);
    assert_eq!(reclaimed[0], created[2].0);
    assert_eq!(pt.table_count(), 1);
    assert_eq!(p.get(root_frame).share_count(), 1);
    assert_eq!(p.free_count(), 15);

    pt.destroy(&mut p, &store);
    assert_eq!(p.free_count(), 16);
}

#[test]
fn reclaim_stops_at_occupied_ancestor() {
    let store = PagingFile::new(4);
    let mut p = pages(16);
    let mut pt = PageTable::new(AddressSpaceId(1), 3, &mut p).unwrap();
    let (a, _) = pt.ensure_path(va(0x1000), &mut p, &store).unwrap();
    // a second leaf under the same level 1 table
    let (b, created) = pt.ensure_path(va(0x20_1000), &mut p, &store).unwrap();
    assert_eq!(created.len(), 1);
    assert_ne!(a, b);

    let reclaimed = pt.reclaim_empty(a, &mut p, &store);
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(pt.walk(va(0x20_1000)), Walk::Leaf(b));
    assert!(pt.leaf_for(va(0x1000)).is_none());
}

#[test]
fn ensure_path_rolls_back_when_out_of_pages() {
    let store = PagingFile::new(4);
    // the root plus one more table
    let mut p = pages(2);
    let mut pt = PageTable::new(AddressSpaceId(1), 3, &mut p).unwrap();
    assert_eq!(pt.ensure_path(va(0x1000), &mut p, &store).err(), Some(PageTableError::OutOfPages));
    assert_eq!(pt.table_count(), 1);
    assert_eq!(p.free_count(), 1);
    assert_eq!(pt.table(pt.root()).occupancy(), 0);
}

#[test]
fn layout_of_two_level_space() {
    let layout = AddressSpaceLayout::new(2);
    assert_eq!(layout.root_entry_pages(), 512);
    assert_eq!(layout.user_size(), 0x3FC0_0000);
    assert!(layout.is_user_address(va(0x3FBF_F000)));
    assert!(!layout.is_user_address(layout.working_set_base()));
    assert_eq!(layout.working_set_base().value(), 0x3FE0_0000);
    assert_eq!(layout.hash_base(64).start_address().value(), 0x3FE0_0000 + 64 * 0x1000);
    assert_eq!(layout.hash_page(64, 3), layout.wsl_page(67));
}

#[test]
fn user_range_of_four_level_space_is_lower_half() {
    let layout = AddressSpaceLayout::new(4);
    assert_eq!(layout.user_last_address().value(), 0x7FFF_FFFF_FFFF);
    assert_eq!(layout.working_set_base().value(), 0xFFFF_FF80_0000_0000);
}
