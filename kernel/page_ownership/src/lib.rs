//! The physical page descriptor table: the sole source of truth for who owns a physical page.
//!
//! Every managed physical [`Frame`] has one [`PhysicalPageDescriptor`] that records
//! * the **share count**: how many page-table-level owners reference the frame,
//! * the **reference count**: all outstanding users, i.e., one for a nonzero share count
//!   plus one per pin (in-flight I/O),
//! * whether the page was deleted, and whether its content was modified,
//! * a back-reference to the one working-set list slot that directly indexes it, if any,
//! * which mapping owns it, and which page list it's on.
//!
//! Counts only change through the increment/decrement functions on [`PageDescriptorTable`],
//! and driving any of them below zero is a fatal bug.
//! When the reference count drops to zero, a deleted page returns to the free pool,
//! while a page that still backs a transition mapping goes onto the standby list
//! (or the modified list if its content was never written back).
//!
//! The table lives behind the single coarse lock in [`PageOwnership`];
//! see [`CoarseLock`] for how that lock may be dropped and reacquired mid-operation.
//! Clone records, used while a copy-on-write page is shared between address spaces,
//! live in their own arena, [`CloneRecords`].

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;

#[cfg(test)]
mod test;

mod clone_records;
mod coarse_lock;

pub use clone_records::*;
pub use coarse_lock::*;

use alloc::{collections::BTreeSet, vec::Vec};
use backing_store::BackingStore;
use core::sync::atomic::{AtomicUsize, Ordering};
use memory_structs::{Frame, Page};
use page_table_entry::{BackingStoreLocation, CloneId, PrototypeRef};
use spin::Mutex;

/// Identifies one address space (and thus one working set).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressSpaceId(pub usize);

/// The working-set list slot that directly indexes a physical page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WsleOwner {
    pub space: AddressSpaceId,
    pub index: usize,
}

/// The mapping that owns a physical page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageOwner {
    /// Not owned; the page is in the free pool.
    None,
    /// A private page of `space`, mapped at `page`.
    Private { space: AddressSpaceId, page: Page },
    /// The canonical shared copy of a prototype table entry.
    Prototype(PrototypeRef),
    /// A private copy shared between address spaces through a clone record.
    Clone(CloneId),
    /// A page-table page of `space`; `page` is its self-map address.
    PageTable { space: AddressSpaceId, page: Page },
    /// A working-set list or hash table page of `space`.
    WorkingSetList { space: AddressSpaceId, page: Page },
}

/// Which page list a physical page is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageList {
    Free,
    /// Referenced by at least one user.
    Active,
    /// Unreferenced, clean, still backing a transition mapping.
    Standby,
    /// Unreferenced, dirty, still backing a transition mapping.
    Modified,
}

/// The ownership record of one physical page.
#[derive(Debug)]
pub struct PhysicalPageDescriptor {
    share_count: usize,
    reference_count: usize,
    deleted: bool,
    list: PageList,
    /// The page's content differs from its backing-store copy.
    pub modified: bool,
    /// The working-set slot that directly indexes this page.
    pub wsle: Option<WsleOwner>,
    pub owner: PageOwner,
    /// The backing-store block reserved for this page's content.
    pub backing: BackingStoreLocation,
}
assert_not_impl_any!(PhysicalPageDescriptor: Clone, Copy);

impl PhysicalPageDescriptor {
    const fn free() -> PhysicalPageDescriptor {
        PhysicalPageDescriptor {
            share_count: 0,
            reference_count: 0,
            deleted: true,
            list: PageList::Free,
            modified: false,
            wsle: None,
            owner: PageOwner::None,
            backing: BackingStoreLocation::NoBlock,
        }
    }

    pub fn share_count(&self) -> usize {
        self.share_count
    }

    pub fn reference_count(&self) -> usize {
        self.reference_count
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn list(&self) -> PageList {
        self.list
    }

    /// Returns `true` if users beyond the page-table owners hold this page,
    /// which makes it ineligible for eviction from a working set.
    pub fn is_pinned(&self) -> bool {
        self.reference_count > 1 || (self.reference_count == 1 && self.share_count == 0)
    }
}

/// All physical page descriptors, indexed by frame number, plus the free pool
/// and the standby and modified lists.
pub struct PageDescriptorTable {
    base: usize,
    descriptors: Vec<PhysicalPageDescriptor>,
    free: Vec<Frame>,
    standby: BTreeSet<Frame>,
    modified: BTreeSet<Frame>,
}

impl PageDescriptorTable {
    /// Creates a table managing `count` frames starting at `first_frame`,
    /// all of which begin in the free pool.
    pub fn new(first_frame: Frame, count: usize) -> PageDescriptorTable {
        let base = first_frame.number();
        let mut descriptors = Vec::with_capacity(count);
        descriptors.resize_with(count, PhysicalPageDescriptor::free);
        // hand out the lowest frames first
        let free = (0..count).rev().map(|i| Frame::from_number(base + i)).collect();
        PageDescriptorTable {
            base,
            descriptors,
            free,
            standby: BTreeSet::new(),
            modified: BTreeSet::new(),
        }
    }

    fn index_of(&self, frame: Frame) -> usize {
        match frame.number().checked_sub(self.base) {
            Some(i) if i < self.descriptors.len() => i,
            _ => {
                error!("PageDescriptorTable: {:?} is not a managed frame", frame);
                panic!("BUG: no physical page descriptor exists for a resident frame");
            }
        }
    }

    /// Returns the descriptor of the given `frame`.
    pub fn get(&self, frame: Frame) -> &PhysicalPageDescriptor {
        &self.descriptors[self.index_of(frame)]
    }

    /// Returns the descriptor of the given `frame` for updating its
    /// back-reference, modified bit, owner, or backing-store reservation.
    pub fn get_mut(&mut self, frame: Frame) -> &mut PhysicalPageDescriptor {
        let i = self.index_of(frame);
        &mut self.descriptors[i]
    }

    /// Takes a page out of the free pool and gives it to `owner`
    /// with a share count and a reference count of one.
    pub fn allocate_page(&mut self, owner: PageOwner) -> Option<Frame> {
        let Some(frame) = self.free.pop() else {
            warn!("PageDescriptorTable: out of free pages");
            return None;
        };
        let desc = self.get_mut(frame);
        if desc.share_count != 0 || desc.reference_count != 0 || desc.list != PageList::Free {
            error!("PageDescriptorTable: free {:?} has descriptor {:?}", frame, desc);
            panic!("BUG: a page in the free pool was still referenced");
        }
        *desc = PhysicalPageDescriptor {
            share_count: 1,
            reference_count: 1,
            deleted: false,
            list: PageList::Active,
            modified: false,
            wsle: None,
            owner,
            backing: BackingStoreLocation::NoBlock,
        };
        trace!("PageDescriptorTable: allocated {:?} for {:?}", frame, owner);
        Some(frame)
    }

    /// Returns the number of pages in the free pool.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn standby_count(&self) -> usize {
        self.standby.len()
    }

    pub fn modified_count(&self) -> usize {
        self.modified.len()
    }

    /// Adds one page-table-level owner to `frame`.
    ///
    /// The first owner of an unreferenced page also takes a reference,
    /// pulling it off the standby or modified list.
    pub fn increment_share(&mut self, frame: Frame) {
        let i = self.index_of(frame);
        if self.descriptors[i].deleted {
            error!("PageDescriptorTable::increment_share(): {:?} is deleted", frame);
            panic!("BUG: added a share to a deleted page");
        }
        self.descriptors[i].share_count += 1;
        if self.descriptors[i].share_count == 1 {
            self.add_reference(frame);
        }
    }

    /// Removes one page-table-level owner from `frame`.
    ///
    /// Dropping the last owner also drops the reference the owners held;
    /// see [`decrement_reference()`](Self::decrement_reference).
    pub fn decrement_share(&mut self, frame: Frame, store: &dyn BackingStore) {
        let desc = self.get_mut(frame);
        if desc.share_count == 0 {
            error!("PageDescriptorTable::decrement_share(): {:?} has descriptor {:?}", frame, desc);
            panic!("BUG: share count of a physical page went below zero");
        }
        desc.share_count -= 1;
        if desc.share_count == 0 {
            self.decrement_reference(frame, store);
        }
    }

    /// Drops one reference to `frame`.
    ///
    /// At zero, a deleted page releases its backing-store block and returns to the free pool;
    /// any other page stays resident on the standby or modified list.
    pub fn decrement_reference(&mut self, frame: Frame, store: &dyn BackingStore) {
        let desc = self.get_mut(frame);
        if desc.reference_count == 0 {
            error!("PageDescriptorTable::decrement_reference(): {:?} has descriptor {:?}", frame, desc);
            panic!("BUG: reference count of a physical page went below zero");
        }
        desc.reference_count -= 1;
        if desc.reference_count != 0 {
            return;
        }
        if desc.deleted {
            let backing = core::mem::replace(&mut desc.backing, BackingStoreLocation::NoBlock);
            store.release_block(backing);
            self.free_page(frame);
        } else if desc.modified {
            desc.list = PageList::Modified;
            self.modified.insert(frame);
        } else {
            desc.list = PageList::Standby;
            self.standby.insert(frame);
        }
    }

    /// Marks `frame` as deleted: once unreferenced, it goes back to the free pool
    /// rather than onto the standby or modified list.
    pub fn mark_deleted(&mut self, frame: Frame) {
        let desc = self.get_mut(frame);
        if desc.deleted {
            error!("PageDescriptorTable::mark_deleted(): {:?} has descriptor {:?}", frame, desc);
            panic!("BUG: deleted a physical page descriptor twice");
        }
        desc.deleted = true;
    }

    /// Takes an unreferenced page off the standby or modified list
    /// and frees it, releasing its backing-store block.
    ///
    /// The page must already be marked deleted.
    pub fn reclaim_unreferenced(&mut self, frame: Frame, store: &dyn BackingStore) {
        let desc = self.get(frame);
        if desc.reference_count != 0 || !desc.deleted {
            error!("PageDescriptorTable::reclaim_unreferenced(): {:?} has descriptor {:?}", frame, desc);
            panic!("BUG: reclaimed a page that is still referenced or not deleted");
        }
        self.unlink(frame);
        let backing = core::mem::replace(&mut self.get_mut(frame).backing, BackingStoreLocation::NoBlock);
        store.release_block(backing);
        self.free_page(frame);
    }

    /// Adds an extra reference to a page for in-flight I/O,
    /// which keeps it resident and makes it ineligible for eviction.
    pub fn pin(&mut self, frame: Frame) {
        if self.get(frame).list == PageList::Free {
            error!("PageDescriptorTable::pin(): {:?} is free", frame);
            panic!("BUG: pinned a free physical page");
        }
        self.add_reference(frame);
    }

    /// Drops a reference taken by [`pin()`](Self::pin).
    pub fn unpin(&mut self, frame: Frame, store: &dyn BackingStore) {
        self.decrement_reference(frame, store);
    }

    fn add_reference(&mut self, frame: Frame) {
        if self.get(frame).reference_count == 0 {
            self.unlink(frame);
        }
        let desc = self.get_mut(frame);
        desc.reference_count += 1;
        desc.list = PageList::Active;
    }

    /// Removes `frame` from the standby or modified list, if it's on one.
    fn unlink(&mut self, frame: Frame) {
        match self.get(frame).list {
            PageList::Standby => { self.standby.remove(&frame); }
            PageList::Modified => { self.modified.remove(&frame); }
            PageList::Free | PageList::Active => {}
        }
        self.get_mut(frame).list = PageList::Active;
    }

    fn free_page(&mut self, frame: Frame) {
        let desc = self.get_mut(frame);
        if desc.share_count != 0 || desc.reference_count != 0 {
            error!("PageDescriptorTable::free_page(): {:?} has descriptor {:?}", frame, desc);
            panic!("BUG: freed a physical page that is still referenced");
        }
        *desc = PhysicalPageDescriptor::free();
        self.free.push(frame);
        trace!("PageDescriptorTable: freed {:?}", frame);
    }
}

/// The coarse page-ownership lock around the [`PageDescriptorTable`].
///
/// Lock ordering: a working-set lock is always acquired before the clone-record lock,
/// which is always acquired before this lock.
pub struct PageOwnership {
    table: Mutex<PageDescriptorTable>,
    next_space_id: AtomicUsize,
}

impl PageOwnership {
    pub fn new(table: PageDescriptorTable) -> PageOwnership {
        PageOwnership {
            table: Mutex::new(table),
            next_space_id: AtomicUsize::new(1),
        }
    }

    /// Acquires the coarse lock.
    pub fn lock(&self) -> CoarseLock<'_> {
        CoarseLock::new(&self.table)
    }

    /// Hands out a new, unique address space identifier.
    pub fn new_address_space_id(&self) -> AddressSpaceId {
        AddressSpaceId(self.next_space_id.fetch_add(1, Ordering::Relaxed))
    }
}
