//! Growing and shrinking the working set's own storage:
//! its list pages, its hash table pages, and the page tables that map them.

use memory_structs::{Frame, Page};
use page_ownership::{PageDescriptorTable, PageOwner};
use page_table::Walk;
use page_table_entry::PageTableEntry;
use pte_flags::PteFlags;
use crate::{allocate::ReplaceMode, MemoryServices, WorkingSet, WorkingSetError};

impl WorkingSet {
    /// Maps one more working-set list page, adding its entries to the free list.
    ///
    /// The new page and every page table created to map it become locked entries.
    pub(crate) fn grow(&mut self, pages: &mut PageDescriptorTable, services: &MemoryServices) -> Result<(), WorkingSetError> {
        if self.wsl_pages + 1 > self.config.wsl_region_pages {
            return Err(WorkingSetError::GrowthUnavailable);
        }
        let page = self.layout.wsl_page(self.wsl_pages);
        let (frame, created) = self.map_bookkeeping_page(page, pages, services)?;
        self.list.extend(self.config.entries_per_page);
        self.wsl_pages += 1;
        // the new entries always leave room for the locked ones
        for (p, f) in created.into_iter().chain(core::iter::once((page, frame))) {
            if self.list.insert_locked(p, f, pages).is_none() {
                error!("WorkingSet::grow(): no room to lock {:?} in {:?}", p, self.space);
                panic!("BUG: a new working-set list page could not hold its own entries");
            }
        }
        self.stats.growths += 1;
        debug!("WorkingSet: grew {:?} to {} list pages ({} entries)", self.space, self.wsl_pages, self.list.capacity());
        Ok(())
    }

    /// The number of locked entries that mapping the bookkeeping page `page` adds:
    /// one for the page, plus one per page table that must be created for it.
    pub(crate) fn bookkeeping_cost(&self, page: Page) -> usize {
        match self.page_table.walk(page.start_address()) {
            Walk::Leaf(_) => 1,
            Walk::Absent { level, .. } => level + 2,
        }
    }

    /// The number of locked entries that growing the list by one page adds.
    pub(crate) fn growth_cost(&self) -> usize {
        self.bookkeeping_cost(self.layout.wsl_page(self.wsl_pages))
    }

    /// Returns `true` if `added` more entries keep the working set within its hard maximum, if any.
    pub(crate) fn within_hard_maximum(&self, added: usize) -> bool {
        !self.config.hard_maximum || self.list.size() + added <= self.config.maximum_size
    }

    /// Maps `page` to a newly allocated frame owned by this working set,
    /// creating any missing page tables.
    ///
    /// Returns the frame and the pages and frames of the created tables.
    fn map_bookkeeping_page(
        &mut self,
        page: Page,
        pages: &mut PageDescriptorTable,
        services: &MemoryServices,
    ) -> Result<(Frame, alloc::vec::Vec<(Page, Frame)>), WorkingSetError> {
        let vaddr = page.start_address();
        let (leaf, created) = self.page_table.ensure_path(vaddr, pages, services.backing_store)?;
        let Some(frame) = pages.allocate_page(PageOwner::WorkingSetList { space: self.space, page }) else {
            self.page_table.reclaim_empty(leaf, pages, services.backing_store);
            return Err(WorkingSetError::OutOfPages);
        };
        let entry = PageTableEntry::new_valid(frame, PteFlags::new().writable(true));
        if let Err(e) = self.page_table.install(vaddr, entry, pages) {
            error!("WorkingSet: couldn't map bookkeeping page {:?} of {:?}: {:?}", page, self.space, e);
            panic!("BUG: a working-set bookkeeping page was already mapped");
        }
        Ok((frame, created))
    }

    /// Unmaps and frees the bookkeeping page `page`, removing its locked entry
    /// and those of any page tables that become empty.
    fn unmap_bookkeeping_page(&mut self, page: Page, pages: &mut PageDescriptorTable, services: &MemoryServices) {
        let vaddr = page.start_address();
        let Some(leaf) = self.page_table.leaf_for(vaddr) else {
            panic!("BUG: working-set bookkeeping page {:?} has no leaf table", page);
        };
        let table = self.page_table.table_mut(leaf);
        let frame = match table.entry_mut(vaddr.level_index(0)).zero() {
            PageTableEntry::Valid { frame, .. } => frame,
            other => {
                error!("WorkingSet: bookkeeping page {:?} of {:?} has entry {:?}", page, self.space, other);
                panic!("BUG: a working-set bookkeeping page was not mapped");
            }
        };
        table.decrement_occupancy();
        let container = table.frame();
        pages.decrement_share(container, services.backing_store);

        self.remove_locked(page, pages);
        pages.mark_deleted(frame);
        pages.decrement_share(frame, services.backing_store);
        services.invalidator.flush_one(vaddr, self.config.broadcast_invalidations);

        // each emptied table loses its locked entry before the table itself goes away
        let mut id = leaf;
        while id != self.page_table.root() && self.page_table.table(id).occupancy() == 0 {
            let table = self.page_table.table(id);
            let table_page = Page::containing_address(self.page_table.table_virtual_address(table.level(), vaddr));
            self.remove_locked(table_page, pages);
            id = self.page_table.delete_table(id, pages, services.backing_store);
        }
    }

    fn remove_locked(&mut self, page: Page, pages: &mut PageDescriptorTable) {
        match self.list.locate_locked(page) {
            Some(slot) => { self.list.remove(slot, pages); }
            None => {
                error!("WorkingSet: bookkeeping page {:?} of {:?} has no locked entry", page, self.space);
                panic!("BUG: a working-set bookkeeping page was not in its own working set");
            }
        }
    }

    /// Makes sure at least `count` slots are free, growing or evicting if needed.
    fn reserve_free_slots(&mut self, count: usize, pages: &mut PageDescriptorTable, services: &MemoryServices) -> Result<(), WorkingSetError> {
        while self.list.free_slots().count() < count {
            if !self.within_hard_maximum(self.growth_cost()) || self.grow(pages, services).is_err() {
                let slot = self.replace(ReplaceMode::ReplaceOnly, None, pages, services)
                    .map_err(|_| WorkingSetError::NoVictim)?;
                self.list.push_free(slot);
            }
        }
        Ok(())
    }

    /// The number of hash table pages that keep `count` entries at a load factor of at most one half.
    fn hash_pages_for(&self, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let per_page = self.config.hash_entries_per_page;
        core::cmp::min((2 * (count + 1) + per_page - 1) / per_page, self.config.hash_region_pages)
    }

    /// The number of locked entries that mapping the next hash table page may add,
    /// counting a list page grown to make room for them.
    pub(crate) fn hash_growth_cost(&self) -> usize {
        let page = self.layout.hash_page(self.config.wsl_region_pages, self.hash_pages);
        let mut cost = self.bookkeeping_cost(page);
        if self.list.free_slots().count() < self.config.hierarchy_depth + 1 {
            cost += self.growth_cost();
        }
        cost
    }

    /// Grows the hash table to fit at least one more entry.
    /// Failing to grow is not an error, as long as the table still has room.
    pub(crate) fn grow_hash_table(&mut self, pages: &mut PageDescriptorTable, services: &MemoryServices) {
        let target = self.hash_pages_for(self.list.hash.len() + 1);
        if target <= self.hash_pages {
            warn!("WorkingSet: the hash table of {:?} is at its maximum of {} pages", self.space, self.hash_pages);
            return;
        }
        let old_pages = self.hash_pages;
        while self.hash_pages < target {
            if let Err(e) = self.map_hash_page(pages, services) {
                warn!("WorkingSet: couldn't grow the hash table of {:?}: {:?}", self.space, e);
                break;
            }
        }
        if self.hash_pages != old_pages {
            self.list.hash.resize(self.hash_pages * self.config.hash_entries_per_page);
            debug!("WorkingSet: hash table of {:?} grew to {} pages", self.space, self.hash_pages);
        }
    }

    fn map_hash_page(&mut self, pages: &mut PageDescriptorTable, services: &MemoryServices) -> Result<(), WorkingSetError> {
        let page = self.layout.hash_page(self.config.wsl_region_pages, self.hash_pages);
        // the page and up to `depth - 1` new tables each use up a free slot when locked,
        // and one dynamic slot must remain
        self.reserve_free_slots(self.config.hierarchy_depth + 1, pages, services)?;
        let (frame, created) = self.map_bookkeeping_page(page, pages, services)?;
        self.hash_pages += 1;
        for (p, f) in created.into_iter().chain(core::iter::once((page, frame))) {
            if self.list.insert_locked(p, f, pages).is_none() {
                error!("WorkingSet: no room to lock hash page {:?} of {:?}", p, self.space);
                panic!("BUG: reserved working-set slots disappeared while mapping a hash page");
            }
        }
        Ok(())
    }

    /// Compacts the list, freeing trailing list pages that are no longer needed,
    /// and resizes the hash table to its number of entries.
    pub(crate) fn compact(&mut self, pages: &mut PageDescriptorTable, services: &MemoryServices) {
        loop {
            let end = self.list.slide_down(pages);
            if self.wsl_pages <= 1 {
                break;
            }
            let new_capacity = (self.wsl_pages - 1) * self.config.entries_per_page;
            // the page's own locked entry (and maybe its tables') goes away with it
            if new_capacity < end || new_capacity <= self.list.first_dynamic() {
                break;
            }
            self.list.truncate(new_capacity);
            self.wsl_pages -= 1;
            let page = self.layout.wsl_page(self.wsl_pages);
            self.unmap_bookkeeping_page(page, pages, services);
            self.stats.shrinks += 1;
            debug!("WorkingSet: shrank {:?} to {} list pages", self.space, self.wsl_pages);
        }

        let target = self.hash_pages_for(self.list.hash.len());
        if target < self.hash_pages && self.list.hash.len() * 4 < self.list.hash.capacity() {
            self.list.hash.resize(target * self.config.hash_entries_per_page);
            while self.hash_pages > target {
                self.hash_pages -= 1;
                let page = self.layout.hash_page(self.config.wsl_region_pages, self.hash_pages);
                self.unmap_bookkeeping_page(page, pages, services);
            }
            debug!("WorkingSet: hash table of {:?} shrank to {} pages", self.space, self.hash_pages);
        }
    }

    /// Releases the working set's own storage and the root page table.
    ///
    /// Every user page must already be gone from the working set
    /// and every user page table reclaimed.
    pub fn destroy(mut self, pages: &mut PageDescriptorTable, services: &MemoryServices) {
        if self.list.size() != self.list.first_dynamic() || self.locked_user_pages != 0 {
            error!("WorkingSet::destroy(): {:?} still has {} entries ({} locked)", self.space, self.list.size(), self.list.first_dynamic());
            panic!("BUG: destroyed a working set that still has user pages");
        }
        let wsl_region = self.config.wsl_region_pages;
        let bookkeeping = (0..self.hash_pages).rev().map(|i| self.layout.hash_page(wsl_region, i))
            .chain((0..self.wsl_pages).rev().map(|i| self.layout.wsl_page(i)));
        let bookkeeping: alloc::vec::Vec<Page> = bookkeeping.collect();

        for page in bookkeeping {
            let vaddr = page.start_address();
            let Some(leaf) = self.page_table.leaf_for(vaddr) else {
                panic!("BUG: working-set bookkeeping page {:?} has no leaf table", page);
            };
            let table = self.page_table.table_mut(leaf);
            let Some(frame) = table.entry_mut(vaddr.level_index(0)).zero().pointed_frame() else {
                panic!("BUG: working-set bookkeeping page {:?} was not mapped", page);
            };
            table.decrement_occupancy();
            let container = table.frame();
            pages.decrement_share(container, services.backing_store);
            pages.mark_deleted(frame);
            pages.decrement_share(frame, services.backing_store);
            self.page_table.reclaim_empty(leaf, pages, services.backing_store);
            services.invalidator.flush_one(vaddr, self.config.broadcast_invalidations);
        }
        debug!("WorkingSet: destroyed {:?} (peak size {})", self.space, self.stats.peak_size);
        self.page_table.destroy(pages, services.backing_store);
    }
}
