//! Basic types used throughout the virtual memory subsystem.
//!
//! 1. addresses: `VirtualAddress` and `PhysicalAddress`.
//! 2. "chunk" types: `Page` and `Frame`.
//! 3. ranges of pages: `PageRange`.
//!
//! Unlike a fixed four-level paging layout, the hierarchy index helpers here
//! take the level as an argument, where level 0 is the leaf level and
//! `depth - 1` is the root level of a hierarchy with `depth` levels.

#![no_std]


use core::{
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
};
use derive_more::*;
use kernel_config::memory::{INDEX_BITS, INDEX_MASK, MAX_PAGE_NUMBER, PAGE_SHIFT, PAGE_SIZE};
use paste::paste;

/// Generates `VirtualAddress` and `PhysicalAddress`, which differ only in
/// how they are canonicalized and what chunk type they belong to.
macro_rules! implement_address {
    ($TypeName:ident, $desc:literal, $prefix:literal, $is_canonical:ident, $canonicalize:ident, $chunk:ident) => {
        paste! {
            #[doc = "A " $desc " memory address, which is a `usize` under the hood."]
            #[derive(
                Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
                Binary, Octal, LowerHex, UpperHex,
                BitAnd, BitOr, BitAndAssign, BitOrAssign,
                Add, Sub, AddAssign, SubAssign,
            )]
            #[repr(transparent)]
            pub struct $TypeName(usize);

            impl $TypeName {
                #[doc = "Creates a new `" $TypeName "`, returning `None` if the address is not canonical."]
                pub fn new(addr: usize) -> Option<$TypeName> {
                    if $is_canonical(addr) { Some($TypeName(addr)) } else { None }
                }

                #[doc = "Creates a new `" $TypeName "` that is guaranteed to be canonical."]
                pub const fn new_canonical(addr: usize) -> $TypeName {
                    $TypeName($canonicalize(addr))
                }

                pub const fn zero() -> $TypeName {
                    $TypeName(0)
                }

                #[inline]
                pub const fn value(&self) -> usize {
                    self.0
                }

                #[doc = "Returns the offset of this address from its " $chunk " boundary."]
                pub const fn [<$chunk _offset>](&self) -> usize {
                    self.0 & (PAGE_SIZE - 1)
                }
            }
            impl fmt::Debug for $TypeName {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, concat!($prefix, "{:#X}"), self.0)
                }
            }
            impl fmt::Display for $TypeName {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{:?}", self)
                }
            }
            impl Add<usize> for $TypeName {
                type Output = $TypeName;
                fn add(self, rhs: usize) -> $TypeName {
                    $TypeName::new_canonical(self.0.saturating_add(rhs))
                }
            }
            impl AddAssign<usize> for $TypeName {
                fn add_assign(&mut self, rhs: usize) {
                    *self = $TypeName::new_canonical(self.0.saturating_add(rhs));
                }
            }
            impl Sub<usize> for $TypeName {
                type Output = $TypeName;
                fn sub(self, rhs: usize) -> $TypeName {
                    $TypeName::new_canonical(self.0.saturating_sub(rhs))
                }
            }
            impl SubAssign<usize> for $TypeName {
                fn sub_assign(&mut self, rhs: usize) {
                    *self = $TypeName::new_canonical(self.0.saturating_sub(rhs));
                }
            }
        }
    };
}

mod canonical_address {
    use bit_field::BitField;

    /// Virtual addresses are canonical if bits `[48, 64)` are sign-extended from bit 47.
    #[inline]
    pub fn is_canonical_virtual_address(virt_addr: usize) -> bool {
        matches!(virt_addr.get_bits(47..64), 0 | 0b1_1111_1111_1111_1111)
    }

    #[inline]
    pub const fn canonicalize_virtual_address(virt_addr: usize) -> usize {
        ((virt_addr << 16) as isize >> 16) as usize
    }

    #[inline]
    pub fn is_canonical_physical_address(phys_addr: usize) -> bool {
        matches!(phys_addr.get_bits(52..64), 0)
    }

    #[inline]
    pub const fn canonicalize_physical_address(phys_addr: usize) -> usize {
        phys_addr & 0x000F_FFFF_FFFF_FFFF
    }
}

use canonical_address::*;

implement_address!(
    VirtualAddress,
    "virtual",
    "v",
    is_canonical_virtual_address,
    canonicalize_virtual_address,
    page
);

implement_address!(
    PhysicalAddress,
    "physical",
    "p",
    is_canonical_physical_address,
    canonicalize_physical_address,
    frame
);

/// The bit position at which the index for hierarchy `level` begins.
const fn level_shift(level: usize) -> usize {
    PAGE_SHIFT + level * INDEX_BITS
}

impl VirtualAddress {
    /// Returns the 9-bit index into the table at the given hierarchy `level`.
    pub const fn level_index(&self, level: usize) -> usize {
        (self.0 >> level_shift(level)) & INDEX_MASK
    }

    /// Returns the first address of the region that follows the one covered by
    /// the entry at `level` containing this address,
    /// or `None` if no such region exists in the address space.
    pub fn next_region_at_level(&self, level: usize) -> Option<VirtualAddress> {
        let shift = level_shift(level);
        let next = ((self.0 >> shift).checked_add(1)?).checked_shl(shift as u32)?;
        // shifting past the top of the address space wraps around to zero
        if next == 0 {
            None
        } else {
            Some(VirtualAddress::new_canonical(next))
        }
    }
}

/// Generates the `Page` and `Frame` types.
macro_rules! implement_page_frame {
    ($TypeName:ident, $desc:literal, $prefix:literal, $address:ident) => {
        paste! {
            #[doc = "A `" $TypeName "` is a chunk of **" $desc "** memory aligned to a [`PAGE_SIZE`] boundary."]
            #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
            pub struct $TypeName {
                number: usize,
            }

            impl $TypeName {
                #[doc = "Returns the `" $address "` at the start of this `" $TypeName "`."]
                pub const fn start_address(&self) -> $address {
                    $address::new_canonical(self.number * PAGE_SIZE)
                }

                #[inline(always)]
                pub const fn number(&self) -> usize {
                    self.number
                }

                #[doc = "Returns the `" $TypeName "` containing the given `" $address "`."]
                pub const fn containing_address(addr: $address) -> $TypeName {
                    $TypeName {
                        number: addr.value() / PAGE_SIZE,
                    }
                }
            }
            impl fmt::Debug for $TypeName {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, concat!(stringify!($TypeName), "(", $prefix, "{:#X})"), self.start_address())
                }
            }
            impl Add<usize> for $TypeName {
                type Output = $TypeName;
                fn add(self, rhs: usize) -> $TypeName {
                    // cannot exceed max page number (which is also max frame number)
                    $TypeName {
                        number: core::cmp::min(MAX_PAGE_NUMBER, self.number.saturating_add(rhs)),
                    }
                }
            }
            impl Sub<usize> for $TypeName {
                type Output = $TypeName;
                fn sub(self, rhs: usize) -> $TypeName {
                    $TypeName {
                        number: self.number.saturating_sub(rhs),
                    }
                }
            }
        }
    };
}

implement_page_frame!(Page, "virtual", "v", VirtualAddress);
implement_page_frame!(Frame, "physical", "p", PhysicalAddress);

impl Page {
    /// Returns the 9-bit index of this `Page` into the table at hierarchy `level`.
    pub const fn level_index(&self, level: usize) -> usize {
        (self.number >> (level * INDEX_BITS)) & INDEX_MASK
    }
}

impl Frame {
    /// Creates the `Frame` with the given frame number.
    pub const fn from_number(number: usize) -> Frame {
        Frame { number }
    }
}

/// An inclusive range of contiguous virtual [`Page`]s.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    start: Page,
    end: Page,
}

impl PageRange {
    /// Creates a new range of pages from `start` to `end`, both inclusive.
    pub const fn new(start: Page, end: Page) -> PageRange {
        PageRange { start, end }
    }

    /// A range that contains no pages.
    pub const fn empty() -> PageRange {
        PageRange { start: Page { number: 1 }, end: Page { number: 0 } }
    }

    pub const fn start(&self) -> Page {
        self.start
    }

    pub const fn end(&self) -> Page {
        self.end
    }

    pub const fn is_empty(&self) -> bool {
        self.end.number < self.start.number
    }

    pub const fn size_in_pages(&self) -> usize {
        (self.end.number + 1).saturating_sub(self.start.number)
    }

    pub fn contains(&self, page: &Page) -> bool {
        self.start <= *page && *page <= self.end
    }

    /// Returns an iterator over every page in this range.
    pub fn iter(&self) -> PageRangeIter {
        PageRangeIter { next: self.start.number, end: self.end.number, done: self.is_empty() }
    }
}

impl fmt::Debug for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}..={:?}", self.start, self.end)
    }
}

impl IntoIterator for PageRange {
    type Item = Page;
    type IntoIter = PageRangeIter;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterates over the pages of a [`PageRange`] without mutating the range itself.
pub struct PageRangeIter {
    next: usize,
    end: usize,
    done: bool,
}

impl Iterator for PageRangeIter {
    type Item = Page;
    fn next(&mut self) -> Option<Page> {
        if self.done {
            return None;
        }
        let page = Page { number: self.next };
        if self.next == self.end {
            self.done = true;
        } else {
            self.next += 1;
        }
        Some(page)
    }
}
