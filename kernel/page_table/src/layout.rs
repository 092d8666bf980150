//! Where things live in every address space.

use kernel_config::memory::{bytes_per_entry, PAGE_SIZE, USER_ROOT_ENTRIES, WORKING_SET_ROOT_INDEX};
use memory_structs::{Page, VirtualAddress};

/// The end of the lower canonical half of the address space.
const LOWER_HALF_END: usize = 1 << 47;

/// The virtual memory map of an address space with a hierarchy of `depth` levels.
///
/// * Root entries `[0, USER_ROOT_ENTRIES)`: the user range.
/// * Root entry [`SELF_MAP_ROOT_INDEX`](kernel_config::memory::SELF_MAP_ROOT_INDEX): the self-mapped page tables.
/// * Root entry [`WORKING_SET_ROOT_INDEX`]: the working-set list pages,
///   then the reserved region of its hash table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressSpaceLayout {
    depth: usize,
}

impl AddressSpaceLayout {
    pub const fn new(depth: usize) -> AddressSpaceLayout {
        AddressSpaceLayout { depth }
    }

    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Bytes covered by one root table entry.
    pub const fn root_entry_size(&self) -> usize {
        bytes_per_entry(self.depth - 1)
    }

    /// Pages covered by one root table entry.
    pub const fn root_entry_pages(&self) -> usize {
        self.root_entry_size() / PAGE_SIZE
    }

    /// The size in bytes of the user range, which starts at address zero.
    pub fn user_size(&self) -> usize {
        core::cmp::min(USER_ROOT_ENTRIES * self.root_entry_size(), LOWER_HALF_END)
    }

    /// The last address of the user range.
    pub fn user_last_address(&self) -> VirtualAddress {
        VirtualAddress::new_canonical(self.user_size() - 1)
    }

    pub fn is_user_address(&self, vaddr: VirtualAddress) -> bool {
        vaddr.value() < self.user_size()
    }

    pub fn working_set_base(&self) -> VirtualAddress {
        VirtualAddress::new_canonical(WORKING_SET_ROOT_INDEX * self.root_entry_size())
    }

    /// The `index`th working-set list page.
    pub fn wsl_page(&self, index: usize) -> Page {
        Page::containing_address(self.working_set_base() + index * PAGE_SIZE)
    }

    /// The first page of the hash table's reserved region,
    /// which starts right after `wsl_region_pages` list pages.
    pub fn hash_base(&self, wsl_region_pages: usize) -> Page {
        self.wsl_page(wsl_region_pages)
    }

    /// The `index`th hash table page.
    pub fn hash_page(&self, wsl_region_pages: usize, index: usize) -> Page {
        self.hash_base(wsl_region_pages) + index
    }
}
