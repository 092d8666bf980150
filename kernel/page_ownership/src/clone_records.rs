//! Clone records: the reference-counted indirection used while a
//! copy-on-write page is shared between address spaces.
//!
//! Each `Shared { indirection: Clone(id), .. }` mapping, resident or not,
//! holds one reference to its record. The record owns the private copy's
//! physical page (when resident) and its backing-store block.

use alloc::vec::Vec;
use memory_structs::Frame;
use page_table_entry::{BackingStoreLocation, CloneId};
use spin::{Mutex, MutexGuard};

/// One clone record.
#[derive(Debug, PartialEq, Eq)]
pub struct CloneRecord {
    /// The number of mappings that refer to this record.
    pub references: usize,
    /// The private copy's physical page, if it's resident.
    pub frame: Option<Frame>,
    pub backing: BackingStoreLocation,
}

/// The arena of all clone records, behind its own lock.
///
/// This lock ranks between a working-set lock and the coarse page-ownership lock.
pub struct CloneRecords {
    arena: Mutex<CloneArena>,
}

/// The locked contents of [`CloneRecords`].
pub struct CloneArena {
    slots: Vec<Option<CloneRecord>>,
    free: Vec<usize>,
}

impl CloneRecords {
    pub const fn new() -> CloneRecords {
        CloneRecords {
            arena: Mutex::new(CloneArena { slots: Vec::new(), free: Vec::new() }),
        }
    }

    /// Acquires the clone-record lock.
    ///
    /// This may spin while another address space is using a clone record.
    pub fn lock(&self) -> MutexGuard<'_, CloneArena> {
        self.arena.lock()
    }
}

impl Default for CloneRecords {
    fn default() -> Self {
        Self::new()
    }
}

impl CloneArena {
    /// Creates a new record with the given number of references.
    pub fn create(&mut self, references: usize, frame: Option<Frame>, backing: BackingStoreLocation) -> CloneId {
        let record = CloneRecord { references, frame, backing };
        let id = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(record);
                i
            }
            None => {
                self.slots.push(Some(record));
                self.slots.len() - 1
            }
        };
        trace!("CloneArena: created {:?} with {} references", CloneId(id), references);
        CloneId(id)
    }

    pub fn get(&self, id: CloneId) -> Option<&CloneRecord> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    fn get_mut_or_die(&mut self, id: CloneId) -> &mut CloneRecord {
        match self.slots.get_mut(id.0).and_then(|s| s.as_mut()) {
            Some(record) => record,
            None => {
                error!("CloneArena: {:?} does not exist", id);
                panic!("BUG: a mapping referred to a nonexistent clone record");
            }
        }
    }

    pub fn get_mut(&mut self, id: CloneId) -> Option<&mut CloneRecord> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    pub fn increment(&mut self, id: CloneId) {
        self.get_mut_or_die(id).references += 1;
    }

    /// Drops one reference to the record `id`.
    ///
    /// Returns the record itself once its last reference is gone,
    /// so the caller can dispose of its page and backing-store block.
    pub fn decrement(&mut self, id: CloneId) -> Option<CloneRecord> {
        let record = self.get_mut_or_die(id);
        if record.references == 0 {
            error!("CloneArena: {:?} has no references left", id);
            panic!("BUG: clone record reference count went below zero");
        }
        record.references -= 1;
        if record.references != 0 {
            return None;
        }
        self.free.push(id.0);
        self.slots[id.0].take()
    }

    /// Returns the number of live records.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
