//! The page-fault side of the working set: installing resident mappings
//! and adding them to the working set, plus locking pages into it.

use memory_structs::{Frame, Page, VirtualAddress};
use page_ownership::{PageDescriptorTable, PageOwner};
use page_table::TableId;
use page_table_entry::{CloneId, PageTableEntry, SharedIndirection};
use pte_flags::PteFlags;
use crate::{MemoryServices, WorkingSet, WorkingSetError};

impl WorkingSet {
    fn check_user_address(&self, vaddr: VirtualAddress) -> Result<Page, WorkingSetError> {
        if self.layout.is_user_address(vaddr) {
            Ok(Page::containing_address(vaddr))
        } else {
            Err(WorkingSetError::InvalidAddress)
        }
    }

    /// Makes the leaf entry for `vaddr` valid for `frame`, which already counts this mapping
    /// in its share count, and adds the page to the working set.
    ///
    /// The entry must be empty or a non-resident shared entry.
    /// On failure the entry and its leaf table are restored;
    /// dropping the frame's share is up to the caller.
    fn make_valid(
        &mut self,
        vaddr: VirtualAddress,
        leaf: TableId,
        frame: Frame,
        protection: PteFlags,
        pages: &mut PageDescriptorTable,
        services: &MemoryServices,
    ) -> Result<usize, WorkingSetError> {
        let page = Page::containing_address(vaddr);
        let table = self.page_table.table_mut(leaf);
        let container = table.frame();
        let pte = table.entry_mut(vaddr.level_index(0));
        let previous = *pte;
        *pte = PageTableEntry::new_valid(frame, protection);
        if previous.is_unused() {
            table.increment_occupancy();
        }
        pages.increment_share(container);

        match self.allocate(page, frame, false, pages, services) {
            Ok(slot) => {
                self.stats.page_faults += 1;
                Ok(slot)
            }
            Err(e) => {
                let table = self.page_table.table_mut(leaf);
                *table.entry_mut(vaddr.level_index(0)) = previous;
                if previous.is_unused() {
                    table.decrement_occupancy();
                }
                pages.decrement_share(container, services.backing_store);
                Err(e)
            }
        }
    }

    /// Returns the leaf table for `vaddr`, creating it if needed,
    /// and checks that its entry there is one of the states `accept`s.
    fn leaf_accepting(
        &mut self,
        vaddr: VirtualAddress,
        accept: impl Fn(&PageTableEntry) -> bool,
        pages: &mut PageDescriptorTable,
        services: &MemoryServices,
    ) -> Result<TableId, WorkingSetError> {
        let (leaf, _) = self.page_table.ensure_path(vaddr, pages, services.backing_store)?;
        if accept(self.page_table.table(leaf).entry(vaddr.level_index(0))) {
            Ok(leaf)
        } else {
            self.page_table.reclaim_empty(leaf, pages, services.backing_store);
            Err(WorkingSetError::AlreadyMapped)
        }
    }

    /// Maps a new private page at `vaddr` and adds it to the working set.
    pub fn map_private_page(
        &mut self,
        vaddr: VirtualAddress,
        protection: PteFlags,
        services: &MemoryServices,
    ) -> Result<Frame, WorkingSetError> {
        let page = self.check_user_address(vaddr)?;
        let mut pages = services.ownership.lock();
        let leaf = self.leaf_accepting(vaddr, PageTableEntry::is_unused, &mut pages, services)?;
        let Some(frame) = pages.allocate_page(PageOwner::Private { space: self.space, page }) else {
            self.page_table.reclaim_empty(leaf, &mut pages, services.backing_store);
            return Err(WorkingSetError::OutOfPages);
        };
        if let Err(e) = self.make_valid(vaddr, leaf, frame, protection, &mut pages, services) {
            pages.mark_deleted(frame);
            pages.decrement_share(frame, services.backing_store);
            self.page_table.reclaim_empty(leaf, &mut pages, services.backing_store);
            return Err(e);
        }
        self.stats.private_pages += 1;
        Ok(frame)
    }

    /// Maps the resident prototype page `frame` at `vaddr` and adds it to the working set.
    ///
    /// The entry at `vaddr` must be empty, or a shared entry left behind when the page was evicted.
    pub fn map_shared_page(
        &mut self,
        vaddr: VirtualAddress,
        frame: Frame,
        protection: PteFlags,
        services: &MemoryServices,
    ) -> Result<(), WorkingSetError> {
        self.check_user_address(vaddr)?;
        let mut pages = services.ownership.lock();
        if !matches!(pages.get(frame).owner, PageOwner::Prototype(_)) {
            return Err(WorkingSetError::NotResident);
        }
        let accept = |pte: &PageTableEntry| matches!(
            pte,
            PageTableEntry::Empty | PageTableEntry::Shared { indirection: SharedIndirection::LookupNeeded | SharedIndirection::Prototype(_), .. }
        );
        let leaf = self.leaf_accepting(vaddr, accept, &mut pages, services)?;
        pages.increment_share(frame);
        if let Err(e) = self.make_valid(vaddr, leaf, frame, protection, &mut pages, services) {
            pages.decrement_share(frame, services.backing_store);
            self.page_table.reclaim_empty(leaf, &mut pages, services.backing_store);
            return Err(e);
        }
        Ok(())
    }

    /// Maps the resident private copy behind clone record `id` at `vaddr`
    /// and adds it to the working set.
    ///
    /// A new mapping takes a reference on the record;
    /// one that replaces this record's own non-resident shared entry already holds it.
    pub fn map_clone_page(
        &mut self,
        vaddr: VirtualAddress,
        id: CloneId,
        protection: PteFlags,
        services: &MemoryServices,
    ) -> Result<Frame, WorkingSetError> {
        self.check_user_address(vaddr)?;
        // lock order: clone records, then the coarse lock
        let mut clones = services.clones.lock();
        let frame = clones.get(id).and_then(|r| r.frame).ok_or(WorkingSetError::NotResident)?;
        let mut pages = services.ownership.lock();
        let accept = |pte: &PageTableEntry| pte.is_unused() || matches!(
            pte,
            PageTableEntry::Shared { indirection: SharedIndirection::Clone(c), .. } if *c == id
        );
        let leaf = self.leaf_accepting(vaddr, accept, &mut pages, services)?;
        let new_reference = self.page_table.table(leaf).entry(vaddr.level_index(0)).is_unused();
        pages.increment_share(frame);
        if let Err(e) = self.make_valid(vaddr, leaf, frame, protection, &mut pages, services) {
            pages.decrement_share(frame, services.backing_store);
            self.page_table.reclaim_empty(leaf, &mut pages, services.backing_store);
            return Err(e);
        }
        if new_reference {
            clones.increment(id);
        }
        Ok(frame)
    }

    /// Turns the transition entry at `vaddr` back into a valid one
    /// and adds the page to the working set again.
    pub fn resolve_transition_fault(&mut self, vaddr: VirtualAddress, services: &MemoryServices) -> Result<Frame, WorkingSetError> {
        let page = self.check_user_address(vaddr)?;
        let mut pages = services.ownership.lock();
        let leaf = self.page_table.leaf_for(vaddr).ok_or(WorkingSetError::NotMapped)?;
        let pte = self.page_table.table_mut(leaf).entry_mut(vaddr.level_index(0));
        let previous = *pte;
        let Some(frame) = pte.restore_from_transition() else {
            return Err(WorkingSetError::NotMapped);
        };
        // takes the page off the standby or modified list
        pages.increment_share(frame);
        match self.allocate(page, frame, false, &mut pages, services) {
            Ok(_) => {
                self.stats.page_faults += 1;
                Ok(frame)
            }
            Err(e) => {
                *self.page_table.table_mut(leaf).entry_mut(vaddr.level_index(0)) = previous;
                pages.decrement_share(frame, services.backing_store);
                Err(e)
            }
        }
    }

    /// Moves the page at `vaddr` into the locked region, so it's never evicted.
    pub fn lock_page(&mut self, vaddr: VirtualAddress, services: &MemoryServices) -> Result<(), WorkingSetError> {
        let (slot, mut pages) = self.resident_slot(vaddr, services)?;
        if slot < self.list.first_dynamic() {
            return Ok(());
        }
        match self.list.lock_slot(slot, &mut pages) {
            Some(_) => {
                self.locked_user_pages += 1;
                Ok(())
            }
            None => Err(WorkingSetError::LockLimit),
        }
    }

    /// Moves the page at `vaddr` back out of the locked region.
    pub fn unlock_page(&mut self, vaddr: VirtualAddress, services: &MemoryServices) -> Result<(), WorkingSetError> {
        let (slot, mut pages) = self.resident_slot(vaddr, services)?;
        if slot >= self.list.first_dynamic() {
            return Err(WorkingSetError::NotLocked);
        }
        self.list.unlock_slot(slot, &mut pages);
        self.locked_user_pages -= 1;
        Ok(())
    }

    fn resident_slot<'s>(
        &self,
        vaddr: VirtualAddress,
        services: &MemoryServices<'s>,
    ) -> Result<(usize, page_ownership::CoarseLock<'s>), WorkingSetError> {
        let page = self.check_user_address(vaddr)?;
        let pages = services.ownership.lock();
        let frame = self.page_table.entry(vaddr)
            .and_then(|pte| pte.pointed_frame())
            .ok_or(WorkingSetError::NotResident)?;
        if matches!(pages.get(frame).owner, PageOwner::WorkingSetList { .. } | PageOwner::PageTable { .. }) {
            return Err(WorkingSetError::PermanentlyLocked);
        }
        let slot = self.list.locate(page, frame, &pages).ok_or(WorkingSetError::NotResident)?;
        Ok((slot, pages))
    }
}
