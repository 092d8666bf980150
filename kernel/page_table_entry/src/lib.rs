//! Defines the state of a leaf page table entry (PTE), one per virtual page.
//!
//! A `PageTableEntry` is always in exactly one of these states:
//! * [`Empty`]: nothing is mapped here.
//! * [`Valid`]: a resident translation to a physical [`Frame`].
//! * [`Transition`]: the frame still holds the page's content,
//!   but the translation has been invalidated and the frame is pending reclamation.
//! * [`BackingStore`]: the content lives in the backing store (or nowhere yet).
//! * [`Shared`]: the residency of this page is tracked elsewhere,
//!   in a prototype (shared indirection) table or a clone record.
//!
//! The resident states (`Valid` and `Transition`) always imply that a
//! physical page descriptor exists for the frame they name.
//!
//! [`Empty`]: PageTableEntry::Empty
//! [`Valid`]: PageTableEntry::Valid
//! [`Transition`]: PageTableEntry::Transition
//! [`BackingStore`]: PageTableEntry::BackingStore
//! [`Shared`]: PageTableEntry::Shared

#![no_std]

#[cfg(test)]
mod test;

use core::mem;
use memory_structs::Frame;
use pte_flags::PteFlags;

/// Identifies one entry of a shared indirection ("prototype") table:
/// the table itself and the index of the entry within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PrototypeRef {
    pub table: usize,
    pub index: usize,
}

/// Index of a clone record in the clone-record arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CloneId(pub usize);

/// Where a [`Shared`](PageTableEntry::Shared) mapping finds its content.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SharedIndirection {
    /// The canonical shared descriptor of a section, found through its prototype table.
    Prototype(PrototypeRef),
    /// A private copy shared between address spaces through a clone record.
    Clone(CloneId),
    /// The indirection must be recomputed from the range descriptor
    /// that covers this address.
    LookupNeeded,
}

/// Where a non-resident private page's content is kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackingStoreLocation {
    /// No block was ever reserved (e.g. a demand-zero page).
    NoBlock,
    /// The block is known only to the owner of the range.
    LookupNeeded,
    /// A reserved block in the backing store.
    Block(usize),
}

impl BackingStoreLocation {
    /// Returns `true` if this location names an actual reserved block.
    pub fn is_block(&self) -> bool {
        matches!(self, BackingStoreLocation::Block(_))
    }
}

/// The translation record of one virtual page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PageTableEntry {
    #[default]
    Empty,
    Valid {
        frame: Frame,
        /// Always contains `VALID`; `ACCESSED` and `DIRTY` are maintained by the hardware.
        flags: PteFlags,
    },
    Transition {
        frame: Frame,
        protection: PteFlags,
    },
    BackingStore(BackingStoreLocation),
    Shared {
        indirection: SharedIndirection,
        protection_override: Option<PteFlags>,
    },
}

impl PageTableEntry {
    /// Creates a `Valid` entry mapping `frame` with the given protection.
    pub fn new_valid(frame: Frame, protection: PteFlags) -> PageTableEntry {
        PageTableEntry::Valid { frame, flags: protection.protection().valid(true) }
    }

    /// Returns `true` if this entry is unused.
    pub fn is_unused(&self) -> bool {
        matches!(self, PageTableEntry::Empty)
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, PageTableEntry::Valid { .. })
    }

    pub fn is_transition(&self) -> bool {
        matches!(self, PageTableEntry::Transition { .. })
    }

    /// Returns `true` if this entry is `Valid` or `Transition`,
    /// i.e., it names a frame whose descriptor counts it.
    pub fn is_resident(&self) -> bool {
        self.resident_frame().is_some()
    }

    /// Returns the frame mapped by a `Valid` entry.
    pub fn pointed_frame(&self) -> Option<Frame> {
        match self {
            PageTableEntry::Valid { frame, .. } => Some(*frame),
            _ => None,
        }
    }

    /// Returns the frame named by a `Valid` or `Transition` entry.
    pub fn resident_frame(&self) -> Option<Frame> {
        match self {
            PageTableEntry::Valid { frame, .. } | PageTableEntry::Transition { frame, .. } => Some(*frame),
            _ => None,
        }
    }

    /// Returns the flags of a `Valid` entry.
    pub fn flags(&self) -> Option<PteFlags> {
        match self {
            PageTableEntry::Valid { flags, .. } => Some(*flags),
            _ => None,
        }
    }

    /// Zeroes out this entry, setting it as unused, and returns its previous state.
    pub fn zero(&mut self) -> PageTableEntry {
        mem::take(self)
    }

    /// Invalidates a `Valid` entry into `Transition`, keeping its protection.
    ///
    /// Returns the hardware flags the entry had right before,
    /// so that the caller can preserve its `DIRTY` bit,
    /// or `None` (leaving this entry untouched) if it wasn't `Valid`.
    pub fn set_transition(&mut self) -> Option<PteFlags> {
        match *self {
            PageTableEntry::Valid { frame, flags } => {
                *self = PageTableEntry::Transition { frame, protection: flags.protection() };
                Some(flags)
            }
            _ => None,
        }
    }

    /// Makes a `Transition` entry `Valid` again, returning its frame,
    /// or `None` (leaving this entry untouched) if it wasn't in transition.
    pub fn restore_from_transition(&mut self) -> Option<Frame> {
        match *self {
            PageTableEntry::Transition { frame, protection } => {
                *self = PageTableEntry::new_valid(frame, protection);
                Some(frame)
            }
            _ => None,
        }
    }

    /// Clears the `ACCESSED` bit of a `Valid` entry, returning whether it was set.
    pub fn test_and_clear_accessed(&mut self) -> bool {
        match self {
            PageTableEntry::Valid { flags, .. } => {
                let was = flags.is_accessed();
                flags.remove(PteFlags::ACCESSED);
                was
            }
            _ => false,
        }
    }
}
