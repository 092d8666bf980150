//! The overflow index of a working-set list.
//!
//! A working-set slot is normally found through the direct back-reference in its
//! physical page's descriptor. Only one address space can own that back-reference,
//! so slots for pages that are already directly indexed elsewhere
//! (shared pages mapped into several address spaces) are found through this
//! open-addressing hash table from virtual page to slot index instead.
//!
//! The table's capacity is a whole number of hash pages; the pages themselves
//! are mapped and tracked by the owning working set.

use alloc::{vec, vec::Vec};
use memory_structs::Page;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Bucket {
    page: Page,
    slot: usize,
}

/// Maps virtual pages to working-set slot indices.
pub struct WslHashTable {
    buckets: Vec<Option<Bucket>>,
    count: usize,
}

impl WslHashTable {
    pub const fn new() -> WslHashTable {
        WslHashTable { buckets: Vec::new(), count: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns `true` if one more entry would exceed the table's load limit.
    pub fn needs_growth(&self) -> bool {
        (self.count + 1) * 4 > self.capacity() * 3
    }

    /// The bucket where a search for `page` starts. The table must not be empty.
    pub(crate) fn home(&self, page: Page) -> usize {
        // Fibonacci hashing spreads consecutive page numbers across the table.
        // Done in 64 bits so every target places a page in the same bucket.
        let hash = (page.number() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 17;
        (hash % self.buckets.len() as u64) as usize
    }

    /// Inserts `page`, which must not already be present.
    /// Returns `false` if the table is full.
    pub fn insert(&mut self, page: Page, slot: usize) -> bool {
        if self.count >= self.capacity() {
            return false;
        }
        let mut i = self.home(page);
        loop {
            match self.buckets[i] {
                None => {
                    self.buckets[i] = Some(Bucket { page, slot });
                    self.count += 1;
                    return true;
                }
                Some(b) if b.page == page => {
                    error!("WslHashTable: {:?} is already at slot {}", page, b.slot);
                    panic!("BUG: a page was inserted into the working-set hash table twice");
                }
                Some(_) => i = (i + 1) % self.buckets.len(),
            }
        }
    }

    fn find(&self, page: Page) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        let mut i = self.home(page);
        for _ in 0..self.buckets.len() {
            match self.buckets[i] {
                None => return None,
                Some(b) if b.page == page => return Some(i),
                Some(_) => i = (i + 1) % self.buckets.len(),
            }
        }
        None
    }

    /// Returns the slot index of `page`.
    pub fn lookup(&self, page: Page) -> Option<usize> {
        self.find(page).and_then(|i| self.buckets[i]).map(|b| b.slot)
    }

    /// Points `page` at a new slot after its entry was moved.
    pub fn update(&mut self, page: Page, slot: usize) {
        match self.find(page) {
            Some(i) => self.buckets[i] = Some(Bucket { page, slot }),
            None => {
                error!("WslHashTable::update(): {:?} is not in the table", page);
                panic!("BUG: relocated a hashed working-set entry that was not in the hash table");
            }
        }
    }

    /// Removes `page`, returning the slot it pointed to.
    pub fn remove(&mut self, page: Page) -> Option<usize> {
        let mut hole = self.find(page)?;
        let removed = self.buckets[hole].take().map(|b| b.slot);
        self.count -= 1;
        // shift later members of the probe run back into the hole
        let len = self.buckets.len();
        let mut i = (hole + 1) % len;
        while let Some(b) = self.buckets[i] {
            let home = self.home(b.page);
            let displaced = (i + len - home) % len;
            let gap = (i + len - hole) % len;
            if displaced >= gap {
                self.buckets[hole] = self.buckets[i].take();
                hole = i;
            }
            i = (i + 1) % len;
        }
        removed
    }

    /// Rebuilds the table with room for `capacity` entries.
    /// Every current entry must fit.
    pub fn resize(&mut self, capacity: usize) {
        if capacity < self.count {
            error!("WslHashTable::resize(): {} entries don't fit in {}", self.count, capacity);
            panic!("BUG: shrank the working-set hash table below its entry count");
        }
        let old = core::mem::replace(&mut self.buckets, vec![None; capacity]);
        self.count = 0;
        for b in old.into_iter().flatten() {
            self.insert(b.page, b.slot);
        }
    }

    /// Iterates over every `(page, slot)` pair in the table.
    pub fn iter(&self) -> impl Iterator<Item = (Page, usize)> + '_ {
        self.buckets.iter().flatten().map(|b| (b.page, b.slot))
    }
}

impl Default for WslHashTable {
    fn default() -> Self {
        Self::new()
    }
}
