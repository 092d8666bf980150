//! The basic virtual memory map that every address space follows.
//!
//! Reserved root (top-level) page table entries:
//! * 511: the working-set list region, followed by its hash table's reserved region.
//! * 510: self-map of the page-table hierarchy, such that every table page
//!        of an address space has a fixed virtual address.
//! * 509 down to 0: available to the user range of the address space.

/// 64-bit architecture results in 8 bytes per address.
pub const BYTES_PER_ADDR: usize = core::mem::size_of::<usize>();

/// The lower 12 bits of a virtual address correspond to the leaf page offset.
pub const PAGE_SHIFT: usize = 12;
/// Page size is 4096 bytes, 4KiB pages.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Every level of the hierarchy consumes this many bits of a page number.
pub const INDEX_BITS: usize = 9;
/// Mask for one level's index.
pub const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;

/// Value: 512.
pub const ENTRIES_PER_PAGE_TABLE: usize = PAGE_SIZE / BYTES_PER_ADDR;

/// Value: 511. The last root entry holds the working-set list and its hash table.
pub const WORKING_SET_ROOT_INDEX: usize = ENTRIES_PER_PAGE_TABLE - 1;
/// Value: 510. This root entry maps the hierarchy onto itself
//              such that any table page can be addressed like any other page.
pub const SELF_MAP_ROOT_INDEX: usize = ENTRIES_PER_PAGE_TABLE - 2;
/// Value: 510. Root entries `[0, USER_ROOT_ENTRIES)` make up the user range.
pub const USER_ROOT_ENTRIES: usize = SELF_MAP_ROOT_INDEX;

/// The smallest supported page-table hierarchy (a root and a leaf level).
pub const MIN_HIERARCHY_DEPTH: usize = 2;
/// The largest supported page-table hierarchy.
pub const MAX_HIERARCHY_DEPTH: usize = 4;
/// The hierarchy depth used when no other is configured.
pub const DEFAULT_HIERARCHY_DEPTH: usize = MAX_HIERARCHY_DEPTH;

pub const MAX_VIRTUAL_ADDRESS: usize = usize::MAX;
pub const MAX_PAGE_NUMBER: usize = MAX_VIRTUAL_ADDRESS / PAGE_SIZE;

/// Returns the number of bytes covered by one entry at the given `level`,
/// where level 0 is the leaf level.
pub const fn bytes_per_entry(level: usize) -> usize {
    1 << (PAGE_SHIFT + level * INDEX_BITS)
}
