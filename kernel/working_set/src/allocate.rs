//! Allocating working-set entries, and the replacement policy that evicts them.

use alloc::vec::Vec;
use core::cmp::Reverse;
use memory_structs::{Frame, Page};
use page_ownership::{PageDescriptorTable, PageOwner};
use page_table_entry::{PageTableEntry, SharedIndirection};
use tlb_shootdown::FlushList;
use crate::{check_limits, LimitError, MemoryServices, WorkingSet, WorkingSetError};

/// What the caller of [`WorkingSet::replace()`] can live with if nothing is evicted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReplaceMode {
    /// Growing the list is an acceptable alternative.
    Any,
    /// Only a replacement will do.
    ReplaceOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReplaceFailure {
    GrowInstead,
    NoVictim,
}

impl WorkingSet {
    /// Adds `page`, which was just mapped to `frame`, to the working set.
    ///
    /// If `must_not_evict` is set, only an already free slot is used;
    /// otherwise this may grow the list or evict another page to make room.
    /// Returns the slot the page now occupies.
    pub fn allocate(
        &mut self,
        page: Page,
        frame: Frame,
        must_not_evict: bool,
        pages: &mut PageDescriptorTable,
        services: &MemoryServices,
    ) -> Result<usize, WorkingSetError> {
        if !must_not_evict
            && self.list.needs_hash_entry(frame, pages)
            && self.list.hash.needs_growth()
            && self.within_hard_maximum(self.hash_growth_cost() + 1)
        {
            self.grow_hash_table(pages, services);
        }
        let slot = self.do_replacement(must_not_evict, pages, services)?;
        if !self.list.occupy(slot, page, frame, pages) {
            warn!("WorkingSet::allocate(): no hash table entry for {:?} in {:?}", page, self.space);
            return Err(WorkingSetError::HashTableFull);
        }
        let size = self.list.size();
        if size > self.stats.peak_size {
            self.stats.peak_size = size;
        }
        trace!("WorkingSet: {:?} -> {:?} in slot {} of {:?}", page, frame, slot, self.space);
        Ok(slot)
    }

    /// Finds a free slot for a new entry, growing or evicting as the limits dictate,
    /// and takes it off the free list.
    pub(crate) fn do_replacement(
        &mut self,
        must_not_evict: bool,
        pages: &mut PageDescriptorTable,
        services: &MemoryServices,
    ) -> Result<usize, WorkingSetError> {
        if must_not_evict {
            return self.list.pop_free().ok_or_else(|| {
                warn!("WorkingSet: no free slot in {:?} for a page that must not evict", self.space);
                WorkingSetError::NoFreeSlot
            });
        }

        let size = self.list.size();
        let free_pages = pages.free_count();
        let config = &self.config;

        if size < config.minimum_size {
            return self.free_slot_or_grow(pages, services);
        }
        if config.hard_maximum && size >= config.maximum_size {
            return self.replace(ReplaceMode::ReplaceOnly, None, pages, services)
                .map_err(|_| WorkingSetError::NoVictim);
        }
        let throttled = free_pages < config.growth_free_page_floor
            || (size >= config.maximum_size && free_pages < config.plenty_free_pages);
        if throttled {
            match self.replace(ReplaceMode::Any, None, pages, services) {
                Ok(slot) => return Ok(slot),
                Err(_) => debug!("WorkingSet: nothing to replace in {:?}, growing instead", self.space),
            }
        }
        self.free_slot_or_grow(pages, services)
    }

    /// Uses a free slot, or grows the list to get one, or as a last resort replaces a page.
    ///
    /// Under a hard maximum, the list only grows if its new locked entries
    /// and the page being added all fit below the maximum.
    fn free_slot_or_grow(&mut self, pages: &mut PageDescriptorTable, services: &MemoryServices) -> Result<usize, WorkingSetError> {
        if let Some(slot) = self.list.pop_free() {
            return Ok(slot);
        }
        if !self.within_hard_maximum(self.growth_cost() + 1) {
            trace!("WorkingSet: growing {:?} would pass its hard maximum, replacing instead", self.space);
            return self.replace(ReplaceMode::ReplaceOnly, None, pages, services)
                .map_err(|_| WorkingSetError::NoVictim);
        }
        match self.grow(pages, services) {
            Ok(()) => {
                if let Some(slot) = self.list.pop_free() {
                    return Ok(slot);
                }
            }
            Err(e) => debug!("WorkingSet: couldn't grow {:?}: {:?}", self.space, e),
        }
        self.replace(ReplaceMode::ReplaceOnly, None, pages, services)
            .map_err(|_| WorkingSetError::NoVictim)
    }

    /// Picks a victim with a circular scan of the dynamic region and evicts it,
    /// returning its slot (already taken off the free list).
    ///
    /// A page that has not been accessed for `immediate_replacement_age` epochs is taken at once;
    /// otherwise the oldest of the first `max_replacement_candidates` eligible pages is.
    pub(crate) fn replace(
        &mut self,
        mode: ReplaceMode,
        mut flush: Option<&mut FlushList>,
        pages: &mut PageDescriptorTable,
        services: &MemoryServices,
    ) -> Result<usize, ReplaceFailure> {
        let first = self.list.first_dynamic();
        let last = self.list.last_entry();
        let mut slot = self.list.next_slot;
        if slot < first || slot > last {
            slot = first;
        }
        let mut oldest: Option<(usize, u64)> = None;
        let mut candidates = 0;

        for _ in first..=last {
            let current = slot;
            slot = if slot >= last { first } else { slot + 1 };

            let Some(rp) = self.list.entry(current).and_then(|e| e.resident()).copied() else {
                continue;
            };
            if rp.locked || pages.get(rp.frame).is_pinned() {
                continue;
            }
            let age = self.refresh_age(current);
            candidates += 1;
            if oldest.map_or(true, |(_, a)| age > a) {
                oldest = Some((current, age));
            }
            let victim = if age >= self.config.immediate_replacement_age as u64 {
                current
            } else if candidates >= self.config.max_replacement_candidates {
                oldest.map_or(current, |(s, _)| s)
            } else {
                continue;
            };
            if self.eliminate(victim, flush.as_deref_mut(), pages, services) {
                return Ok(self.finish_replacement(victim));
            }
            oldest = None;
            candidates = 0;
        }

        // the scan wrapped around without reaching either threshold
        if let Some((victim, _)) = oldest {
            if self.eliminate(victim, flush, pages, services) {
                return Ok(self.finish_replacement(victim));
            }
        }
        match mode {
            ReplaceMode::Any => Err(ReplaceFailure::GrowInstead),
            ReplaceMode::ReplaceOnly => {
                warn!("WorkingSet: no page of {:?} could be replaced", self.space);
                Err(ReplaceFailure::NoVictim)
            }
        }
    }

    /// Resumes the next scan right after `victim`, and takes its slot off the free list.
    fn finish_replacement(&mut self, victim: usize) -> usize {
        self.list.next_slot = if victim >= self.list.last_entry() { self.list.first_dynamic() } else { victim + 1 };
        self.stats.replacements += 1;
        match self.list.pop_free() {
            Some(slot) => slot,
            None => panic!("BUG: an evicted working-set slot did not reach the free list"),
        }
    }

    /// Folds the hardware accessed bit of the page in `slot` into its recency stamp,
    /// and returns how many aging epochs have passed since it was last accessed.
    fn refresh_age(&mut self, slot: usize) -> u64 {
        let rp = self.list.resident(slot);
        let accessed = self.page_table
            .entry_mut(rp.page.start_address())
            .map_or(false, |pte| pte.test_and_clear_accessed());
        let epoch = self.list.epoch;
        let rp = self.list.resident_mut(slot);
        if accessed {
            rp.stamp = epoch;
        }
        epoch - rp.stamp
    }

    /// Evicts the page in `slot`, invalidating its mapping and returning the slot to the free list.
    ///
    /// Returns `false` without changing anything if the entry is locked,
    /// or its physical page has users besides its page-table owners.
    pub(crate) fn eliminate(
        &mut self,
        slot: usize,
        flush: Option<&mut FlushList>,
        pages: &mut PageDescriptorTable,
        services: &MemoryServices,
    ) -> bool {
        let rp = self.list.resident(slot);
        if rp.locked || pages.get(rp.frame).is_pinned() {
            return false;
        }
        let vaddr = rp.page.start_address();
        let Some(leaf) = self.page_table.leaf_for(vaddr) else {
            error!("WorkingSet::eliminate(): {:?} in slot {} has no leaf table", rp.page, slot);
            panic!("BUG: a working-set entry's page is not mapped");
        };
        let table = self.page_table.table_mut(leaf);
        let container = table.frame();
        let pte = table.entry_mut(vaddr.level_index(0));
        let flags = match *pte {
            PageTableEntry::Valid { frame, flags } if frame == rp.frame => flags,
            other => {
                error!("WorkingSet::eliminate(): {:?} in slot {} has entry {:?}, expected {:?}", rp.page, slot, other, rp.frame);
                panic!("BUG: a working-set entry's mapping is not valid for its frame");
            }
        };

        let desc = pages.get_mut(rp.frame);
        if flags.is_dirty() {
            desc.modified = true;
        }
        let shared_as = match desc.owner {
            PageOwner::Private { .. } => None,
            PageOwner::Prototype(_) => Some(SharedIndirection::LookupNeeded),
            PageOwner::Clone(id) => Some(SharedIndirection::Clone(id)),
            other => {
                error!("WorkingSet::eliminate(): {:?} in slot {} is owned by {:?}", rp.page, slot, other);
                panic!("BUG: tried to evict a page that is not a private or shared user page");
            }
        };
        match shared_as {
            // a transition entry still counts towards its leaf table
            None => { pte.set_transition(); }
            Some(indirection) => {
                *pte = PageTableEntry::Shared { indirection, protection_override: Some(flags.protection()) };
                pages.decrement_share(container, services.backing_store);
            }
        }

        self.list.remove(slot, pages);
        pages.decrement_share(rp.frame, services.backing_store);
        match flush {
            Some(list) => list.push_or_flush(vaddr, services.invalidator),
            None => services.invalidator.flush_one(vaddr, self.config.broadcast_invalidations),
        }
        trace!("WorkingSet: evicted {:?} from slot {} of {:?}", rp.page, slot, self.space);
        true
    }

    /// Evicts pages, least recently used first, until at most `target_size` entries remain,
    /// then compacts the list. Returns the number of evicted pages.
    pub fn trim(&mut self, target_size: usize, services: &MemoryServices) -> usize {
        let target = if self.config.hard_minimum {
            core::cmp::max(target_size, self.config.minimum_size)
        } else {
            target_size
        };
        let mut pages = services.ownership.lock();
        let mut flush = FlushList::new(self.config.flush_list_capacity, self.config.broadcast_invalidations);

        let mut victims: Vec<(usize, u64)> = Vec::new();
        for slot in self.list.first_dynamic()..self.list.capacity() {
            if self.list.entry(slot).map_or(false, |e| !e.is_free()) {
                victims.push((slot, self.refresh_age(slot)));
            }
        }
        victims.sort_by_key(|&(_, age)| Reverse(age));

        let mut trimmed = 0;
        for (slot, _) in victims {
            if self.list.size() <= target {
                break;
            }
            if self.eliminate(slot, Some(&mut flush), &mut pages, services) {
                trimmed += 1;
            }
        }
        flush.flush(services.invalidator);
        self.compact(&mut pages, services);
        self.stats.pages_trimmed += trimmed;
        debug!("WorkingSet: trimmed {} pages of {:?}, size is now {}", trimmed, self.space, self.list.size());
        trimmed
    }

    /// Starts a new aging epoch and folds the accessed bits of up to `count`
    /// dynamic entries into their recency stamps, resuming where the last call stopped.
    pub fn age(&mut self, count: usize, services: &MemoryServices) {
        self.list.epoch += 1;
        let first = self.list.first_dynamic();
        let last = self.list.last_entry();
        let mut slot = self.list.next_age_slot;
        if slot < first || slot > last {
            slot = first;
        }
        let mut flush = FlushList::new(self.config.flush_list_capacity, self.config.broadcast_invalidations);
        let epoch = self.list.epoch;
        for _ in 0..core::cmp::min(count, last + 1 - first) {
            let current = slot;
            slot = if slot >= last { first } else { slot + 1 };
            let Some(rp) = self.list.entry(current).and_then(|e| e.resident()).copied() else {
                continue;
            };
            let vaddr = rp.page.start_address();
            let accessed = self.page_table.entry_mut(vaddr).map_or(false, |pte| pte.test_and_clear_accessed());
            if accessed {
                self.list.resident_mut(current).stamp = epoch;
                flush.push_or_flush(vaddr, services.invalidator);
            }
        }
        self.list.next_age_slot = slot;
        flush.flush(services.invalidator);
    }

    /// Changes the working-set limits. Lowering a hard maximum below the current size
    /// trims the working set down to it.
    pub fn set_limits(
        &mut self,
        minimum: usize,
        maximum: usize,
        hard_minimum: bool,
        hard_maximum: bool,
        services: &MemoryServices,
    ) -> Result<(), LimitError> {
        check_limits(minimum, maximum, hard_minimum, hard_maximum)?;
        self.config.minimum_size = minimum;
        self.config.maximum_size = maximum;
        self.config.hard_minimum = hard_minimum;
        self.config.hard_maximum = hard_maximum;
        if hard_maximum && self.list.size() > maximum {
            self.trim(maximum, services);
        }
        Ok(())
    }
}
