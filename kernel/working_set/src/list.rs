//! The working-set list: a growable array of slots describing resident pages.
//!
//! Slot indices are partitioned into
//! * `[0, first_dynamic)`: locked slots that can never be evicted,
//!   which always include the pages backing the list itself, and
//! * `[first_dynamic, capacity)`: dynamic slots, each either on the free list or occupied.
//!
//! `last_entry` bounds the occupied part of the dynamic region
//! and is where the replacement scan wraps around.

use alloc::vec::Vec;
use memory_structs::{Frame, Page};
use page_ownership::{AddressSpaceId, PageDescriptorTable, WsleOwner};
use crate::hash::WslHashTable;

/// A resident page described by an occupied working-set slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResidentPage {
    pub page: Page,
    pub frame: Frame,
    /// Set for every slot below `first_dynamic`.
    pub locked: bool,
    /// The slot is found through the hash table rather than the page's descriptor.
    pub hashed: bool,
    /// The aging epoch in which this page was last seen accessed.
    pub stamp: u64,
}

/// One working-set list slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkingSetEntry {
    /// On the free list; `next` is the following free slot.
    Free { next: Option<usize> },
    Occupied(ResidentPage),
}

impl WorkingSetEntry {
    pub fn resident(&self) -> Option<&ResidentPage> {
        match self {
            WorkingSetEntry::Occupied(rp) => Some(rp),
            WorkingSetEntry::Free { .. } => None,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, WorkingSetEntry::Free { .. })
    }
}

/// The slots, free list, and indexes of one working set.
pub struct WorkingSetList {
    space: AddressSpaceId,
    pub(crate) entries: Vec<WorkingSetEntry>,
    pub(crate) first_free: Option<usize>,
    pub(crate) first_dynamic: usize,
    pub(crate) last_entry: usize,
    /// Where the replacement scan resumes.
    pub(crate) next_slot: usize,
    /// Where aging resumes.
    pub(crate) next_age_slot: usize,
    pub(crate) epoch: u64,
    pub(crate) occupied: usize,
    pub(crate) hash: WslHashTable,
}

impl WorkingSetList {
    pub(crate) fn new(space: AddressSpaceId) -> WorkingSetList {
        WorkingSetList {
            space,
            entries: Vec::new(),
            first_free: None,
            first_dynamic: 0,
            last_entry: 0,
            next_slot: 0,
            next_age_slot: 0,
            epoch: 0,
            occupied: 0,
            hash: WslHashTable::new(),
        }
    }

    /// The number of initialized slots.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// The number of occupied slots, locked ones included.
    pub fn size(&self) -> usize {
        self.occupied
    }

    pub fn first_dynamic(&self) -> usize {
        self.first_dynamic
    }

    pub fn last_entry(&self) -> usize {
        self.last_entry
    }

    /// The highest initialized slot index.
    pub fn last_initialized(&self) -> usize {
        self.entries.len().saturating_sub(1)
    }

    /// The number of slots found through the hash table.
    pub fn non_direct_count(&self) -> usize {
        self.hash.len()
    }

    pub fn hash_capacity(&self) -> usize {
        self.hash.capacity()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn entry(&self, slot: usize) -> Option<&WorkingSetEntry> {
        self.entries.get(slot)
    }

    pub fn has_free_slot(&self) -> bool {
        self.first_free.is_some()
    }

    /// Iterates over the free list from its head.
    pub fn free_slots(&self) -> impl Iterator<Item = usize> + '_ {
        let mut next = self.first_free;
        core::iter::from_fn(move || {
            let slot = next?;
            next = match self.entries[slot] {
                WorkingSetEntry::Free { next } => next,
                WorkingSetEntry::Occupied(_) => panic!("BUG: free list contains occupied slot {}", slot),
            };
            Some(slot)
        })
    }

    pub(crate) fn resident_mut(&mut self, slot: usize) -> &mut ResidentPage {
        match &mut self.entries[slot] {
            WorkingSetEntry::Occupied(rp) => rp,
            WorkingSetEntry::Free { .. } => panic!("BUG: working-set slot {} is not occupied", slot),
        }
    }

    pub(crate) fn resident(&self, slot: usize) -> ResidentPage {
        match self.entries[slot] {
            WorkingSetEntry::Occupied(rp) => rp,
            WorkingSetEntry::Free { .. } => panic!("BUG: working-set slot {} is not occupied", slot),
        }
    }

    /// Finds the slot of `page`, which is mapped to `frame`:
    /// through the frame's direct back-reference if it names this list, or the hash table.
    pub fn locate(&self, page: Page, frame: Frame, pages: &PageDescriptorTable) -> Option<usize> {
        if let Some(WsleOwner { space, index }) = pages.get(frame).wsle {
            if space == self.space {
                if let Some(WorkingSetEntry::Occupied(rp)) = self.entries.get(index) {
                    if rp.page == page && !rp.hashed {
                        return Some(index);
                    }
                }
            }
        }
        self.hash.lookup(page)
    }

    /// Finds a locked slot holding `page` by scanning the locked region.
    pub fn locate_locked(&self, page: Page) -> Option<usize> {
        self.entries[..self.first_dynamic].iter().position(|e| {
            matches!(e, WorkingSetEntry::Occupied(rp) if rp.page == page)
        })
    }

    pub(crate) fn pop_free(&mut self) -> Option<usize> {
        let slot = self.first_free?;
        self.first_free = match self.entries[slot] {
            WorkingSetEntry::Free { next } => next,
            WorkingSetEntry::Occupied(_) => panic!("BUG: free list head {} is occupied", slot),
        };
        Some(slot)
    }

    pub(crate) fn push_free(&mut self, slot: usize) {
        if slot < self.first_dynamic {
            error!("WorkingSetList: tried to free locked slot {} (first dynamic {})", slot, self.first_dynamic);
            panic!("BUG: a locked working-set slot was put on the free list");
        }
        self.entries[slot] = WorkingSetEntry::Free { next: self.first_free };
        self.first_free = Some(slot);
    }

    /// Takes `slot` out of the middle of the free list.
    fn unlink_free(&mut self, slot: usize) {
        let next_of_slot = match self.entries[slot] {
            WorkingSetEntry::Free { next } => next,
            WorkingSetEntry::Occupied(_) => panic!("BUG: unlinking occupied slot {} from the free list", slot),
        };
        if self.first_free == Some(slot) {
            self.first_free = next_of_slot;
            return;
        }
        let mut cursor = self.first_free;
        while let Some(c) = cursor {
            match &mut self.entries[c] {
                WorkingSetEntry::Free { next } if *next == Some(slot) => {
                    *next = next_of_slot;
                    return;
                }
                WorkingSetEntry::Free { next } => cursor = *next,
                WorkingSetEntry::Occupied(_) => break,
            }
        }
        panic!("BUG: free working-set slot {} is not on the free list", slot);
    }

    /// Rethreads the free list through every free dynamic slot in ascending order.
    pub(crate) fn rebuild_free_list(&mut self) {
        self.first_free = None;
        for slot in (self.first_dynamic..self.entries.len()).rev() {
            if self.entries[slot].is_free() {
                self.entries[slot] = WorkingSetEntry::Free { next: self.first_free };
                self.first_free = Some(slot);
            }
        }
    }

    /// Adds `count` new free slots at the end, threaded onto the head of the free list
    /// so that they are handed out in ascending order.
    pub(crate) fn extend(&mut self, count: usize) {
        let start = self.entries.len();
        self.entries.resize(start + count, WorkingSetEntry::Free { next: None });
        for slot in (start..start + count).rev() {
            self.entries[slot] = WorkingSetEntry::Free { next: self.first_free };
            self.first_free = Some(slot);
        }
    }

    /// Drops every slot from `new_len` on, all of which must be free.
    pub(crate) fn truncate(&mut self, new_len: usize) {
        if self.entries[new_len..].iter().any(|e| !e.is_free()) || new_len <= self.first_dynamic {
            panic!("BUG: truncated the working-set list over occupied or locked slots");
        }
        self.entries.truncate(new_len);
        self.rebuild_free_list();
        self.last_entry = core::cmp::min(self.last_entry, new_len - 1);
        self.clamp_cursors();
    }

    fn clamp_cursors(&mut self) {
        let span = self.entries.len();
        if self.next_slot >= span || self.next_slot < self.first_dynamic {
            self.next_slot = self.first_dynamic;
        }
        if self.next_age_slot >= span || self.next_age_slot < self.first_dynamic {
            self.next_age_slot = self.first_dynamic;
        }
    }

    /// Records the back-reference of a newly occupied `slot` for `rp`:
    /// the page's descriptor if its back-reference is unused, otherwise the hash table.
    ///
    /// Returns `false` (leaving everything untouched) if the hash table is full.
    fn index_new(&mut self, slot: usize, rp: &mut ResidentPage, pages: &mut PageDescriptorTable) -> bool {
        let desc = pages.get_mut(rp.frame);
        if desc.wsle.is_none() {
            desc.wsle = Some(WsleOwner { space: self.space, index: slot });
            rp.hashed = false;
            true
        } else if self.hash.insert(rp.page, slot) {
            rp.hashed = true;
            true
        } else {
            false
        }
    }

    /// Returns `true` if inserting `frame` would need a hash table entry.
    pub(crate) fn needs_hash_entry(&self, frame: Frame, pages: &PageDescriptorTable) -> bool {
        pages.get(frame).wsle.is_some()
    }

    /// Fills a free dynamic `slot` (already taken off the free list) with `page`.
    ///
    /// On failure, `slot` is put back on the free list.
    pub(crate) fn occupy(&mut self, slot: usize, page: Page, frame: Frame, pages: &mut PageDescriptorTable) -> bool {
        let mut rp = ResidentPage { page, frame, locked: false, hashed: false, stamp: self.epoch };
        if !self.index_new(slot, &mut rp, pages) {
            self.push_free(slot);
            return false;
        }
        self.entries[slot] = WorkingSetEntry::Occupied(rp);
        self.occupied += 1;
        if slot > self.last_entry {
            self.last_entry = slot;
        }
        true
    }

    /// Moves the occupied entry at `from` into the unoccupied slot `to`,
    /// relocating its back-reference. `from` is left free but not on the free list.
    pub(crate) fn relocate(&mut self, from: usize, to: usize, pages: &mut PageDescriptorTable) {
        let rp = self.resident(from);
        if rp.hashed {
            self.hash.update(rp.page, to);
        } else {
            let desc = pages.get_mut(rp.frame);
            match desc.wsle {
                Some(WsleOwner { space, index }) if space == self.space && index == from => {
                    desc.wsle = Some(WsleOwner { space, index: to });
                }
                other => {
                    error!("WorkingSetList::relocate(): {:?} in slot {} has back-reference {:?}", rp.page, from, other);
                    panic!("BUG: a direct working-set entry's back-reference does not match its slot");
                }
            }
        }
        self.entries[to] = WorkingSetEntry::Occupied(rp);
        self.entries[from] = WorkingSetEntry::Free { next: None };
    }

    /// Swaps two occupied entries, relocating both back-references.
    fn swap_occupied(&mut self, a: usize, b: usize, pages: &mut PageDescriptorTable) {
        if a == b {
            return;
        }
        let ra = self.resident(a);
        // unindex `a` first so that relocating `b` onto it sees a consistent table
        self.clear_index(a, &ra, pages);
        self.relocate(b, a, pages);
        self.entries[b] = WorkingSetEntry::Occupied(ra);
        self.restore_index(b, &ra, pages);
    }

    fn clear_index(&mut self, slot: usize, rp: &ResidentPage, pages: &mut PageDescriptorTable) {
        if rp.hashed {
            self.hash.remove(rp.page);
        } else {
            let desc = pages.get_mut(rp.frame);
            if desc.wsle != Some(WsleOwner { space: self.space, index: slot }) {
                error!("WorkingSetList: {:?} in slot {} has back-reference {:?}", rp.page, slot, desc.wsle);
                panic!("BUG: a direct working-set entry's back-reference does not match its slot");
            }
            desc.wsle = None;
        }
    }

    fn restore_index(&mut self, slot: usize, rp: &ResidentPage, pages: &mut PageDescriptorTable) {
        if rp.hashed {
            // the entry was just removed, so there is room for it again
            self.hash.insert(rp.page, slot);
        } else {
            pages.get_mut(rp.frame).wsle = Some(WsleOwner { space: self.space, index: slot });
        }
    }

    /// Empties `slot`, dropping its back-reference, and returns what it held.
    ///
    /// A locked slot is first swapped to the top of the locked region, which then shrinks by one.
    pub(crate) fn remove(&mut self, slot: usize, pages: &mut PageDescriptorTable) -> ResidentPage {
        let rp = self.resident(slot);
        self.clear_index(slot, &rp, pages);
        self.vacate(slot, pages);
        rp
    }

    /// Like [`remove()`](Self::remove), but without touching the page's descriptor.
    ///
    /// Only for tearing down a whole address space, where a stale back-reference
    /// naming this list is cleared later by whoever deletes the mapping.
    pub(crate) fn remove_without_descriptor(&mut self, slot: usize) -> ResidentPage {
        let rp = self.resident(slot);
        if rp.locked {
            panic!("BUG: removed a locked working-set entry without its descriptor");
        }
        if rp.hashed {
            self.hash.remove(rp.page);
        }
        self.entries[slot] = WorkingSetEntry::Free { next: None };
        self.occupied -= 1;
        self.push_free(slot);
        self.shrink_last_entry(slot);
        rp
    }

    /// Puts an emptied (no longer indexed) `slot` back on the free list.
    fn vacate(&mut self, slot: usize, pages: &mut PageDescriptorTable) {
        self.occupied -= 1;
        if slot < self.first_dynamic {
            let top = self.first_dynamic - 1;
            self.entries[slot] = WorkingSetEntry::Free { next: None };
            if top != slot {
                self.relocate(top, slot, pages);
            }
            self.first_dynamic = top;
            self.push_free(top);
            self.clamp_cursors();
        } else {
            self.entries[slot] = WorkingSetEntry::Free { next: None };
            self.push_free(slot);
            self.shrink_last_entry(slot);
        }
    }

    fn shrink_last_entry(&mut self, removed: usize) {
        if removed != self.last_entry {
            return;
        }
        while self.last_entry > self.first_dynamic && self.entries[self.last_entry].is_free() {
            self.last_entry -= 1;
        }
    }

    /// Inserts a new locked entry at the boundary of the locked region,
    /// moving whatever dynamic entry was there into a free slot.
    ///
    /// At least one dynamic slot must remain afterwards; returns `None` otherwise,
    /// or if there is no free slot to work with.
    pub(crate) fn insert_locked(&mut self, page: Page, frame: Frame, pages: &mut PageDescriptorTable) -> Option<usize> {
        let boundary = self.first_dynamic;
        if boundary + 1 >= self.entries.len() {
            return None;
        }
        match self.entries[boundary] {
            WorkingSetEntry::Free { .. } => self.unlink_free(boundary),
            WorkingSetEntry::Occupied(_) => {
                let spare = self.pop_free()?;
                self.relocate(boundary, spare, pages);
                if spare > self.last_entry {
                    self.last_entry = spare;
                }
            }
        }
        let mut rp = ResidentPage { page, frame, locked: true, hashed: false, stamp: self.epoch };
        if !self.index_new(boundary, &mut rp, pages) {
            self.push_free(boundary);
            return None;
        }
        self.entries[boundary] = WorkingSetEntry::Occupied(rp);
        self.occupied += 1;
        self.first_dynamic += 1;
        if self.last_entry < self.first_dynamic {
            self.last_entry = self.first_dynamic;
        }
        self.clamp_cursors();
        Some(boundary)
    }

    /// Moves the dynamic entry at `slot` into the locked region.
    pub(crate) fn lock_slot(&mut self, slot: usize, pages: &mut PageDescriptorTable) -> Option<usize> {
        if slot < self.first_dynamic {
            return Some(slot);
        }
        let boundary = self.first_dynamic;
        if boundary + 1 >= self.entries.len() {
            return None;
        }
        match self.entries[boundary] {
            WorkingSetEntry::Free { .. } => {
                self.unlink_free(boundary);
                self.relocate(slot, boundary, pages);
                self.push_free(slot);
                self.shrink_last_entry(slot);
            }
            WorkingSetEntry::Occupied(_) => self.swap_occupied(slot, boundary, pages),
        }
        self.resident_mut(boundary).locked = true;
        self.first_dynamic += 1;
        if self.last_entry < self.first_dynamic {
            self.last_entry = self.first_dynamic;
        }
        self.clamp_cursors();
        Some(boundary)
    }

    /// Moves the locked entry at `slot` back into the dynamic region.
    pub(crate) fn unlock_slot(&mut self, slot: usize, pages: &mut PageDescriptorTable) -> usize {
        let top = self.first_dynamic - 1;
        self.swap_occupied(slot, top, pages);
        self.resident_mut(top).locked = false;
        self.first_dynamic = top;
        self.clamp_cursors();
        top
    }

    /// Slides every occupied dynamic entry towards the front of the dynamic region.
    ///
    /// Returns the first slot past the last occupied one.
    pub(crate) fn slide_down(&mut self, pages: &mut PageDescriptorTable) -> usize {
        let mut to = self.first_dynamic;
        for from in self.first_dynamic..self.entries.len() {
            if self.entries[from].is_free() {
                continue;
            }
            if from != to {
                self.relocate(from, to, pages);
            }
            to += 1;
        }
        self.rebuild_free_list();
        self.last_entry = core::cmp::max(self.first_dynamic, to.saturating_sub(1));
        self.clamp_cursors();
        to
    }
}
