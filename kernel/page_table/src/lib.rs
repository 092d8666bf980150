//! A software page-table hierarchy of configurable depth.
//!
//! The hierarchy has between [`MIN_HIERARCHY_DEPTH`] and [`MAX_HIERARCHY_DEPTH`] levels;
//! level 0 holds leaf tables of [`PageTableEntry`]s and level `depth - 1` is the root.
//! Each table page is backed by a physical frame from the page descriptor table,
//! and the frame's share count tracks the table's users:
//! one for the link from its parent table (or the address space, for the root),
//! plus one per resident entry (`Valid` or `Transition`) for leaf tables,
//! or one per child table for upper-level tables.
//!
//! Every table also counts its non-empty entries (its occupancy),
//! so that callers tearing down a range can reclaim a table as soon as it empties,
//! cascading upwards through [`PageTable::reclaim_empty()`].

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
mod test;

mod layout;
mod table;

pub use layout::AddressSpaceLayout;
pub use table::{table_virtual_address, Table, TableEntries, TableId};

use alloc::vec::Vec;
use backing_store::BackingStore;
use kernel_config::memory::{MAX_HIERARCHY_DEPTH, MIN_HIERARCHY_DEPTH};
use memory_structs::{Frame, Page, VirtualAddress};
use page_ownership::{AddressSpaceId, PageDescriptorTable, PageOwner};
use page_table_entry::PageTableEntry;

/// Recoverable failures of page table operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageTableError {
    /// The hierarchy depth is outside of the supported range.
    InvalidDepth,
    /// No physical page was available for a new table.
    OutOfPages,
    /// No leaf table covers the address.
    NoLeafTable,
    /// The entry to install over was not empty.
    AlreadyMapped,
}

impl From<PageTableError> for &'static str {
    fn from(err: PageTableError) -> &'static str {
        match err {
            PageTableError::InvalidDepth => "unsupported page table hierarchy depth",
            PageTableError::OutOfPages => "out of physical pages for a page table",
            PageTableError::NoLeafTable => "no leaf page table covers the address",
            PageTableError::AlreadyMapped => "page table entry is already in use",
        }
    }
}

/// The result of walking the hierarchy towards a virtual address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Walk {
    /// The leaf table covering the address.
    Leaf(TableId),
    /// The table at `level` covering the address does not exist.
    /// No address before `resume_at` in that table's region can be mapped;
    /// `None` means the region extends to the end of the address space.
    Absent { level: usize, resume_at: Option<VirtualAddress> },
}

/// The page-table hierarchy of one address space.
pub struct PageTable {
    space: AddressSpaceId,
    depth: usize,
    root: TableId,
    tables: Vec<Option<Table>>,
    free_ids: Vec<usize>,
}

impl PageTable {
    /// Creates a hierarchy with only an empty root table.
    pub fn new(space: AddressSpaceId, depth: usize, pages: &mut PageDescriptorTable) -> Result<PageTable, PageTableError> {
        if !(MIN_HIERARCHY_DEPTH..=MAX_HIERARCHY_DEPTH).contains(&depth) {
            return Err(PageTableError::InvalidDepth);
        }
        let page = Page::containing_address(table_virtual_address(depth, depth - 1, VirtualAddress::zero()));
        let frame = pages.allocate_page(PageOwner::PageTable { space, page })
            .ok_or(PageTableError::OutOfPages)?;
        let mut page_table = PageTable {
            space,
            depth,
            root: TableId(0),
            tables: Vec::new(),
            free_ids: Vec::new(),
        };
        page_table.root = page_table.insert_table(Table::new(frame, depth - 1, None));
        debug!("PageTable: created {}-level hierarchy for {:?}, root {:?}", depth, space, frame);
        Ok(page_table)
    }

    pub fn space(&self) -> AddressSpaceId {
        self.space
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn layout(&self) -> AddressSpaceLayout {
        AddressSpaceLayout::new(self.depth)
    }

    pub fn root(&self) -> TableId {
        self.root
    }

    /// The number of table pages currently in the hierarchy, including the root.
    pub fn table_count(&self) -> usize {
        self.tables.len() - self.free_ids.len()
    }

    /// Returns the self-map address of the table at `level` covering `vaddr`.
    pub fn table_virtual_address(&self, level: usize, vaddr: VirtualAddress) -> VirtualAddress {
        table_virtual_address(self.depth, level, vaddr)
    }

    fn insert_table(&mut self, table: Table) -> TableId {
        match self.free_ids.pop() {
            Some(i) => {
                self.tables[i] = Some(table);
                TableId(i)
            }
            None => {
                self.tables.push(Some(table));
                TableId(self.tables.len() - 1)
            }
        }
    }

    pub fn table(&self, id: TableId) -> &Table {
        match self.tables.get(id.0).and_then(|t| t.as_ref()) {
            Some(t) => t,
            None => panic!("BUG: {:?} does not exist in the page table of {:?}", id, self.space),
        }
    }

    pub fn table_mut(&mut self, id: TableId) -> &mut Table {
        let space = self.space;
        match self.tables.get_mut(id.0).and_then(|t| t.as_mut()) {
            Some(t) => t,
            None => panic!("BUG: {:?} does not exist in the page table of {:?}", id, space),
        }
    }

    /// Walks from the root towards `vaddr`, stopping at the first absent table.
    pub fn walk(&self, vaddr: VirtualAddress) -> Walk {
        let mut id = self.root;
        for level in (1..self.depth).rev() {
            match self.table(id).child(vaddr.level_index(level)) {
                Some(child) => id = child,
                None => return Walk::Absent {
                    level: level - 1,
                    resume_at: vaddr.next_region_at_level(level),
                },
            }
        }
        Walk::Leaf(id)
    }

    /// Returns the leaf table covering `vaddr`, if it exists.
    pub fn leaf_for(&self, vaddr: VirtualAddress) -> Option<TableId> {
        match self.walk(vaddr) {
            Walk::Leaf(id) => Some(id),
            Walk::Absent { .. } => None,
        }
    }

    /// Returns the leaf entry mapping `vaddr`, if its leaf table exists.
    pub fn entry(&self, vaddr: VirtualAddress) -> Option<&PageTableEntry> {
        let leaf = self.leaf_for(vaddr)?;
        Some(self.table(leaf).entry(vaddr.level_index(0)))
    }

    /// Returns the leaf entry mapping `vaddr` for modification, if its leaf table exists.
    pub fn entry_mut(&mut self, vaddr: VirtualAddress) -> Option<&mut PageTableEntry> {
        let leaf = self.leaf_for(vaddr)?;
        Some(self.table_mut(leaf).entry_mut(vaddr.level_index(0)))
    }

    /// Returns the leaf table covering `vaddr`, creating every missing table on the way.
    ///
    /// Also returns the self-map page and frame of each table that was created, top-down.
    /// If a table cannot be allocated, the tables created so far are reclaimed again.
    pub fn ensure_path(
        &mut self,
        vaddr: VirtualAddress,
        pages: &mut PageDescriptorTable,
        store: &dyn BackingStore,
    ) -> Result<(TableId, Vec<(Page, Frame)>), PageTableError> {
        let mut created = Vec::new();
        let mut id = self.root;
        for level in (1..self.depth).rev() {
            let index = vaddr.level_index(level);
            id = match self.table(id).child(index) {
                Some(child) => child,
                None => {
                    let page = Page::containing_address(self.table_virtual_address(level - 1, vaddr));
                    let Some(frame) = pages.allocate_page(PageOwner::PageTable { space: self.space, page }) else {
                        warn!("PageTable::ensure_path(): no page for a level {} table covering {:?}", level - 1, vaddr);
                        if !created.is_empty() {
                            self.reclaim_empty(id, pages, store);
                        }
                        return Err(PageTableError::OutOfPages);
                    };
                    let child = self.insert_table(Table::new(frame, level - 1, Some((id, index))));
                    let parent = self.table_mut(id);
                    parent.set_child(index, Some(child));
                    parent.increment_occupancy();
                    let parent_frame = parent.frame();
                    pages.increment_share(parent_frame);
                    trace!("PageTable: new level {} table {:?} at {:?}", level - 1, frame, page);
                    created.push((page, frame));
                    child
                }
            };
        }
        Ok((id, created))
    }

    /// Installs `entry` over the empty leaf entry for `vaddr`,
    /// updating the leaf table's occupancy and, for resident entries, its share count.
    pub fn install(
        &mut self,
        vaddr: VirtualAddress,
        entry: PageTableEntry,
        pages: &mut PageDescriptorTable,
    ) -> Result<TableId, PageTableError> {
        let leaf = self.leaf_for(vaddr).ok_or(PageTableError::NoLeafTable)?;
        let table = self.table_mut(leaf);
        let pte = table.entry_mut(vaddr.level_index(0));
        if !pte.is_unused() {
            return Err(PageTableError::AlreadyMapped);
        }
        let resident = entry.is_resident();
        *pte = entry;
        table.increment_occupancy();
        if resident {
            pages.increment_share(table.frame());
        }
        Ok(leaf)
    }

    /// Deletes the empty, non-root table `id`, unlinking it from its parent.
    ///
    /// Returns the parent table.
    pub fn delete_table(&mut self, id: TableId, pages: &mut PageDescriptorTable, store: &dyn BackingStore) -> TableId {
        let taken = self.tables.get_mut(id.0).and_then(|t| t.take());
        let table = match taken {
            Some(t) => t,
            None => panic!("BUG: deleted nonexistent table {:?} of {:?}", id, self.space),
        };
        if table.occupancy() != 0 {
            error!("PageTable::delete_table(): {:?} still has {} entries", table.frame(), table.occupancy());
            panic!("BUG: deleted a page table that is still in use");
        }
        let Some((parent_id, index)) = table.parent() else {
            panic!("BUG: tried to delete the root page table of {:?} while it's in use", self.space);
        };
        let parent = self.table_mut(parent_id);
        parent.set_child(index, None);
        parent.decrement_occupancy();
        let parent_frame = parent.frame();
        pages.decrement_share(parent_frame, store);

        pages.mark_deleted(table.frame());
        pages.decrement_share(table.frame(), store);
        self.free_ids.push(id.0);
        debug!("PageTable: reclaimed level {} table {:?} of {:?}", table.level(), table.frame(), self.space);
        parent_id
    }

    /// Deletes `id` if it is empty, then each ancestor that becomes empty in turn,
    /// stopping at the root.
    ///
    /// Returns the self-map pages of the deleted tables, bottom-up.
    pub fn reclaim_empty(&mut self, id: TableId, pages: &mut PageDescriptorTable, store: &dyn BackingStore) -> Vec<Page> {
        let mut reclaimed = Vec::new();
        let mut id = id;
        while id != self.root && self.table(id).occupancy() == 0 {
            let page = table_page(pages, self.table(id).frame());
            id = self.delete_table(id, pages, store);
            reclaimed.push(page);
        }
        reclaimed
    }

    /// Releases the root table. Every other table must already be gone.
    pub fn destroy(mut self, pages: &mut PageDescriptorTable, store: &dyn BackingStore) {
        let root = self.root;
        let taken = self.tables.get_mut(root.0).and_then(|t| t.take());
        let table = match taken {
            Some(t) => t,
            None => panic!("BUG: the root table of {:?} is missing", self.space),
        };
        if table.occupancy() != 0 || self.tables.iter().any(|t| t.is_some()) {
            error!("PageTable::destroy(): root of {:?} still has {} entries", self.space, table.occupancy());
            panic!("BUG: destroyed a page table hierarchy that is still in use");
        }
        pages.mark_deleted(table.frame());
        pages.decrement_share(table.frame(), store);
        debug!("PageTable: destroyed the hierarchy of {:?}", self.space);
    }
}

/// The self-map page recorded as the owner of a table frame.
fn table_page(pages: &PageDescriptorTable, frame: Frame) -> Page {
    match pages.get(frame).owner {
        PageOwner::PageTable { page, .. } => page,
        other => {
            error!("PageTable: table {:?} is owned by {:?}", frame, other);
            panic!("BUG: a page table frame is not owned by a page table");
        }
    }
}
