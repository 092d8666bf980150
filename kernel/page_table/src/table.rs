use alloc::{vec, vec::Vec};
use kernel_config::memory::{ENTRIES_PER_PAGE_TABLE, INDEX_BITS, PAGE_SHIFT, SELF_MAP_ROOT_INDEX};
use memory_structs::{Frame, Page, VirtualAddress};
use page_table_entry::PageTableEntry;

/// Index of a table page in a [`PageTable`](crate::PageTable)'s arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TableId(pub(crate) usize);

/// Returns the self-map address of the table at `level` whose entries cover `vaddr`,
/// in a hierarchy of `depth` levels.
///
/// This works like a recursive mapping: the root table's [`SELF_MAP_ROOT_INDEX`] entry
/// points back at the root itself, so an address whose top `level + 1` indices
/// are all the self-map index, followed by the top indices of `vaddr`,
/// resolves to the table page itself.
/// For a four-level hierarchy, the root table is at `0o177777_776_776_776_776_0000`.
pub fn table_virtual_address(depth: usize, level: usize, vaddr: VirtualAddress) -> VirtualAddress {
    let page = Page::containing_address(vaddr).number();
    let vaddr_fields = depth - 1 - level;
    let mut number = (page >> (INDEX_BITS * (level + 1))) & ((1 << (INDEX_BITS * vaddr_fields)) - 1);
    for field in vaddr_fields..depth {
        number |= SELF_MAP_ROOT_INDEX << (INDEX_BITS * field);
    }
    VirtualAddress::new_canonical(number << PAGE_SHIFT)
}

/// The entries of one table page.
#[derive(Debug)]
pub enum TableEntries {
    /// An upper-level table, whose entries point at lower-level tables.
    Directory(Vec<Option<TableId>>),
    /// A leaf table, whose entries map pages.
    Leaf(Vec<PageTableEntry>),
}

/// One page of the hierarchy.
#[derive(Debug)]
pub struct Table {
    frame: Frame,
    level: usize,
    /// The parent table and the index of our entry in it; `None` for the root.
    parent: Option<(TableId, usize)>,
    entries: TableEntries,
    /// The number of entries that are not empty.
    occupancy: usize,
}

impl Table {
    pub(crate) fn new(frame: Frame, level: usize, parent: Option<(TableId, usize)>) -> Table {
        let entries = if level == 0 {
            TableEntries::Leaf(vec![PageTableEntry::Empty; ENTRIES_PER_PAGE_TABLE])
        } else {
            TableEntries::Directory(vec![None; ENTRIES_PER_PAGE_TABLE])
        };
        Table { frame, level, parent, entries, occupancy: 0 }
    }

    /// The physical frame holding this table.
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// The level of this table, where 0 is the leaf level.
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn parent(&self) -> Option<(TableId, usize)> {
        self.parent
    }

    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.entries, TableEntries::Leaf(_))
    }

    /// Returns the lower-level table that the entry at `index` points to.
    pub fn child(&self, index: usize) -> Option<TableId> {
        match &self.entries {
            TableEntries::Directory(children) => children[index],
            TableEntries::Leaf(_) => None,
        }
    }

    pub(crate) fn set_child(&mut self, index: usize, child: Option<TableId>) {
        match &mut self.entries {
            TableEntries::Directory(children) => children[index] = child,
            TableEntries::Leaf(_) => panic!("BUG: tried to link a table below a leaf table"),
        }
    }

    /// Returns the leaf entry at `index`.
    pub fn entry(&self, index: usize) -> &PageTableEntry {
        match &self.entries {
            TableEntries::Leaf(entries) => &entries[index],
            TableEntries::Directory(_) => panic!("BUG: accessed a page table entry of a non-leaf table"),
        }
    }

    /// Returns the leaf entry at `index` for modification.
    ///
    /// Changing whether the entry is empty must be accompanied by an occupancy update.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        match &mut self.entries {
            TableEntries::Leaf(entries) => &mut entries[index],
            TableEntries::Directory(_) => panic!("BUG: accessed a page table entry of a non-leaf table"),
        }
    }

    pub fn increment_occupancy(&mut self) {
        self.occupancy += 1;
    }

    pub fn decrement_occupancy(&mut self) {
        match self.occupancy.checked_sub(1) {
            Some(o) => self.occupancy = o,
            None => {
                error!("Table at level {} in {:?}: occupancy underflow", self.level, self.frame);
                panic!("BUG: page table occupancy went below zero");
            }
        }
    }
}
