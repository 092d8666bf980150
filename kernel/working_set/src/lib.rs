//! Per-address-space working sets: which virtual pages are resident right now.
//!
//! A [`WorkingSet`] owns the page-table hierarchy of one address space and the
//! [`WorkingSetList`] describing every resident page in it.
//! Every resident user page, and every page the list itself lives on, has one
//! working-set list entry (WSLE). Pages of the list and of its hash table are
//! tracked as permanently locked entries, so the working set can never evict its own storage.
//!
//! A page's entry is found through the back-reference in its physical page descriptor
//! when that back-reference is free, or else through the list's [`WslHashTable`].
//!
//! All operations run under the working-set lock ([`WorkingSetContext::lock()`]),
//! and those that touch physical page descriptors also take the coarse lock,
//! always in that order.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;


mod allocate;
mod config;
mod fault;
mod grow;
mod hash;
mod list;

pub use config::*;
pub use hash::WslHashTable;
pub use list::{ResidentPage, WorkingSetEntry, WorkingSetList};

use backing_store::BackingStore;
use memory_structs::{Frame, Page, PageRange};
use page_ownership::{AddressSpaceId, CloneRecords, PageDescriptorTable, PageOwner, PageOwnership};
use page_table::{AddressSpaceLayout, PageTable, PageTableError};
use page_table_entry::PageTableEntry;
use spin::{Mutex, MutexGuard};
use tlb_shootdown::TlbInvalidator;

/// Recoverable failures of working-set operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkingSetError {
    /// A free slot was required, but there was none.
    NoFreeSlot,
    /// The working-set list cannot grow any further.
    GrowthUnavailable,
    /// Every resident page is ineligible for eviction.
    NoVictim,
    /// The page needs a hash table entry, but the hash table is full.
    HashTableFull,
    OutOfPages,
    NotMapped,
    AlreadyMapped,
    /// The page is not in the working set.
    NotResident,
    NotLocked,
    /// The page backs the working set or its page tables and is always locked.
    PermanentlyLocked,
    /// Locking the page would leave no room for dynamic entries.
    LockLimit,
    InvalidAddress,
    PageTable(PageTableError),
}

impl From<PageTableError> for WorkingSetError {
    fn from(err: PageTableError) -> Self {
        match err {
            PageTableError::OutOfPages => WorkingSetError::OutOfPages,
            PageTableError::AlreadyMapped => WorkingSetError::AlreadyMapped,
            other => WorkingSetError::PageTable(other),
        }
    }
}

impl From<WorkingSetError> for &'static str {
    fn from(err: WorkingSetError) -> &'static str {
        match err {
            WorkingSetError::NoFreeSlot => "no free working set list entry",
            WorkingSetError::GrowthUnavailable => "the working set list cannot grow",
            WorkingSetError::NoVictim => "no working set entry could be evicted",
            WorkingSetError::HashTableFull => "the working set hash table is full",
            WorkingSetError::OutOfPages => "out of physical pages",
            WorkingSetError::NotMapped => "the address is not mapped",
            WorkingSetError::AlreadyMapped => "the address is already mapped",
            WorkingSetError::NotResident => "the page is not in the working set",
            WorkingSetError::NotLocked => "the page is not locked in the working set",
            WorkingSetError::PermanentlyLocked => "the page is permanently locked in the working set",
            WorkingSetError::LockLimit => "too many pages are locked in the working set",
            WorkingSetError::InvalidAddress => "the address is outside of the user range",
            WorkingSetError::PageTable(e) => e.into(),
        }
    }
}

/// The collaborators every working-set operation may need.
#[derive(Clone, Copy)]
pub struct MemoryServices<'s> {
    pub ownership: &'s PageOwnership,
    pub clones: &'s CloneRecords,
    pub backing_store: &'s dyn BackingStore,
    pub invalidator: &'s dyn TlbInvalidator,
}

/// Counters describing a working set's history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkingSetStats {
    /// Occupied working-set list entries, locked ones included.
    pub size: usize,
    pub peak_size: usize,
    /// Private pages committed to this address space, resident or not.
    pub private_pages: usize,
    pub page_faults: usize,
    pub pages_trimmed: usize,
    pub replacements: usize,
    pub growths: usize,
    pub shrinks: usize,
    /// Entries found through the hash table.
    pub hashed_entries: usize,
    pub list_pages: usize,
    pub hash_pages: usize,
}

/// The working set of one address space, together with its page-table hierarchy.
pub struct WorkingSet {
    pub(crate) space: AddressSpaceId,
    pub(crate) config: WorkingSetConfig,
    pub(crate) layout: AddressSpaceLayout,
    pub(crate) page_table: PageTable,
    pub(crate) list: WorkingSetList,
    /// Mapped working-set list pages.
    pub(crate) wsl_pages: usize,
    /// Mapped hash table pages.
    pub(crate) hash_pages: usize,
    /// User pages moved into the locked region by [`lock_page()`](WorkingSet::lock_page).
    pub(crate) locked_user_pages: usize,
    pub(crate) stats: WorkingSetStats,
}
assert_not_impl_any!(WorkingSet: Clone);

impl WorkingSet {
    /// Creates the page-table root and the first working-set list page of a new address space.
    pub fn new(
        space: AddressSpaceId,
        config: WorkingSetConfig,
        pages: &mut PageDescriptorTable,
        services: &MemoryServices,
    ) -> Result<WorkingSet, &'static str> {
        config.validate()?;
        let page_table = PageTable::new(space, config.hierarchy_depth, pages)?;
        let mut ws = WorkingSet {
            space,
            layout: AddressSpaceLayout::new(config.hierarchy_depth),
            config,
            page_table,
            list: WorkingSetList::new(space),
            wsl_pages: 0,
            hash_pages: 0,
            locked_user_pages: 0,
            stats: WorkingSetStats::default(),
        };
        while ws.list.first_dynamic() >= ws.list.capacity() {
            if let Err(e) = ws.grow(pages, services) {
                warn!("WorkingSet::new(): couldn't create the working set list of {:?}: {:?}", space, e);
                ws.destroy(pages, services);
                return Err(e.into());
            }
        }
        debug!("WorkingSet: created {:?} with {} locked entries", space, ws.list.first_dynamic());
        Ok(ws)
    }

    pub fn space(&self) -> AddressSpaceId {
        self.space
    }

    pub fn config(&self) -> &WorkingSetConfig {
        &self.config
    }

    pub fn layout(&self) -> AddressSpaceLayout {
        self.layout
    }

    pub fn list(&self) -> &WorkingSetList {
        &self.list
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    pub fn size(&self) -> usize {
        self.list.size()
    }

    pub fn locked_user_pages(&self) -> usize {
        self.locked_user_pages
    }

    pub fn stats(&self) -> WorkingSetStats {
        WorkingSetStats {
            size: self.list.size(),
            hashed_entries: self.list.non_direct_count(),
            list_pages: self.wsl_pages,
            hash_pages: self.hash_pages,
            ..self.stats
        }
    }

    /// Records that a private page committed to this address space was deleted.
    pub fn decrement_private_pages(&mut self) {
        self.stats.private_pages = self.stats.private_pages.saturating_sub(1);
    }

    /// Finds the slot describing `page`, which is mapped to `frame`.
    pub fn locate(&self, page: Page, frame: Frame, pages: &PageDescriptorTable) -> Option<usize> {
        self.list.locate(page, frame, pages)
    }

    /// Removes the entry in `slot`, returning its slot to the free list.
    pub fn remove_slot(&mut self, slot: usize, pages: &mut PageDescriptorTable) -> ResidentPage {
        let removed = self.list.remove(slot, pages);
        if removed.locked && self.layout.is_user_address(removed.page.start_address()) {
            self.locked_user_pages -= 1;
        }
        trace!("WorkingSet: removed {:?} from slot {} of {:?}", removed.page, slot, self.space);
        removed
    }

    /// Removes `page` (mapped to `frame`) from the working set, if it's in it.
    pub fn remove_page(&mut self, page: Page, frame: Frame, pages: &mut PageDescriptorTable) -> Option<ResidentPage> {
        let slot = self.list.locate(page, frame, pages)?;
        Some(self.remove_slot(slot, pages))
    }

    /// Removes every unlocked entry for a page within `range` without touching
    /// physical page descriptors, so the coarse lock need not be held.
    ///
    /// Only valid while the whole address space is being torn down:
    /// the back-references of removed direct entries are left stale,
    /// and must be cleared by whoever deletes their mappings.
    pub fn remove_range_without_descriptors(&mut self, range: &PageRange) -> usize {
        let mut removed = 0;
        for slot in self.list.first_dynamic()..self.list.capacity() {
            let in_range = matches!(self.list.entry(slot), Some(WorkingSetEntry::Occupied(rp)) if range.contains(&rp.page));
            if in_range {
                self.list.remove_without_descriptor(slot);
                removed += 1;
            }
        }
        if removed != 0 {
            trace!("WorkingSet: removed {} entries of {:?} in {:?} during teardown", removed, self.space, range);
        }
        removed
    }

    /// Checks the structural invariants of the working set and its list,
    /// returning a description of the first one that doesn't hold.
    pub fn check_invariants(&self, pages: &PageDescriptorTable) -> Result<(), &'static str> {
        let list = &self.list;
        if list.capacity() != self.wsl_pages * self.config.entries_per_page {
            return Err("list capacity doesn't match its mapped pages");
        }
        if list.capacity() != 0
            && !(list.first_dynamic() <= list.last_entry() && list.last_entry() <= list.last_initialized())
        {
            return Err("FirstDynamic <= LastEntry <= LastInitialized doesn't hold");
        }
        let mut on_free_list = 0;
        for slot in list.free_slots() {
            if slot < list.first_dynamic() {
                return Err("a locked slot is on the free list");
            }
            on_free_list += 1;
        }
        let mut occupied = 0;
        let mut hashed = 0;
        for slot in 0..list.capacity() {
            let rp = match list.entry(slot) {
                Some(WorkingSetEntry::Occupied(rp)) => rp,
                _ if slot < list.first_dynamic() => return Err("a locked slot is free"),
                _ => continue,
            };
            occupied += 1;
            if rp.hashed {
                hashed += 1;
            }
            if slot > list.last_entry() && slot >= list.first_dynamic() {
                return Err("an occupied slot lies beyond LastEntry");
            }
            if rp.locked != (slot < list.first_dynamic()) {
                return Err("a slot's locked flag doesn't match its region");
            }
            if list.locate(rp.page, rp.frame, pages) != Some(slot) {
                return Err("an entry cannot be located through its back-reference or the hash table");
            }
            match pages.get(rp.frame).owner {
                PageOwner::PageTable { page, .. } if page == rp.page => {}
                PageOwner::PageTable { .. } => return Err("a page table entry names the wrong table"),
                _ => match self.page_table.entry(rp.page.start_address()) {
                    Some(PageTableEntry::Valid { frame, .. }) if *frame == rp.frame => {}
                    _ => return Err("an occupied entry's mapping is not valid for its frame"),
                },
            }
        }
        if occupied + on_free_list != list.capacity() {
            return Err("a dynamic slot is neither free nor occupied");
        }
        if occupied != list.size() || hashed != list.non_direct_count() {
            return Err("the list's counters are wrong");
        }
        if list.hash_capacity() != self.hash_pages * self.config.hash_entries_per_page {
            return Err("hash table capacity doesn't match its mapped pages");
        }
        Ok(())
    }
}

/// A working set behind its lock; the per-address-space context every operation runs in.
pub struct WorkingSetContext {
    id: AddressSpaceId,
    inner: Mutex<WorkingSet>,
}

impl WorkingSetContext {
    /// Creates the address space `id` with a fresh working set.
    pub fn new(config: WorkingSetConfig, services: &MemoryServices) -> Result<WorkingSetContext, &'static str> {
        let id = services.ownership.new_address_space_id();
        let ws = {
            let mut pages = services.ownership.lock();
            WorkingSet::new(id, config, &mut pages, services)?
        };
        Ok(WorkingSetContext { id, inner: Mutex::new(ws) })
    }

    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Acquires the working-set lock.
    ///
    /// This must be taken before the clone-record lock or the coarse page-ownership lock.
    pub fn lock(&self) -> MutexGuard<'_, WorkingSet> {
        self.inner.lock()
    }

    pub fn into_inner(self) -> WorkingSet {
        self.inner.into_inner()
    }
}
