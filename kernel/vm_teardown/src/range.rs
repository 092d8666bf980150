//! Describes what backs a virtual address range being torn down.

use alloc::vec::Vec;
use memory_structs::{Page, PageRange};
use page_table_entry::PrototypeRef;

/// A prototype (shared indirection) table, or the usable part of one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndirectionTable {
    pub id: usize,
    /// The number of entries in the table.
    pub len: usize,
}

/// A run of pages backed by consecutive entries of one indirection table,
/// starting at entry `first_index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subrange {
    pub start: Page,
    pub page_count: usize,
    pub table: IndirectionTable,
    pub first_index: usize,
}

impl Subrange {
    fn contains(&self, page: Page) -> bool {
        page >= self.start && page.number() - self.start.number() < self.page_count
    }

    /// The indirection table entry backing `page`, if the table reaches that far.
    fn entry_for(&self, offset: usize) -> Option<PrototypeRef> {
        let index = self.first_index + offset;
        (index < self.table.len).then(|| PrototypeRef { table: self.table.id, index })
    }
}

/// Whether a range is private to its address space, or a view of shared pages.
#[derive(Clone, Debug, PartialEq, Eq)]
enum RangeKind {
    Private,
    /// Shared pages, backed by a chain of subranges in address order.
    Shared(Vec<Subrange>),
}

/// A mapped range of virtual pages and what backs it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeDescriptor {
    pages: PageRange,
    kind: RangeKind,
}

impl RangeDescriptor {
    pub fn private(pages: PageRange) -> RangeDescriptor {
        RangeDescriptor { pages, kind: RangeKind::Private }
    }

    /// A shared range; `subranges` must be sorted by start page and must not overlap.
    pub fn shared(pages: PageRange, subranges: Vec<Subrange>) -> RangeDescriptor {
        RangeDescriptor { pages, kind: RangeKind::Shared(subranges) }
    }

    pub fn pages(&self) -> &PageRange {
        &self.pages
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.kind, RangeKind::Shared(_))
    }

    fn subranges(&self) -> &[Subrange] {
        match &self.kind {
            RangeKind::Shared(subranges) => subranges,
            RangeKind::Private => &[],
        }
    }

    /// The subrange holding `page` and the page's offset within it.
    fn locate(&self, page: Page) -> Option<(usize, usize)> {
        self.subranges().iter()
            .position(|s| s.contains(page))
            .map(|i| (i, page.number() - self.subranges()[i].start.number()))
    }
}

/// Walks the indirection table entries of consecutive pages,
/// moving on to the next subrange of the chain when one ends.
///
/// Pages between subranges have no entry; the cursor finds its place
/// again at the first page of the next subrange.
pub(crate) struct SharedCursor<'r> {
    range: Option<&'r RangeDescriptor>,
    /// The page the next call to [`next_entry()`](SharedCursor::next_entry) resolves.
    page: Page,
    /// The subrange and offset within it of `page`, if known.
    position: Option<(usize, usize)>,
}

impl<'r> SharedCursor<'r> {
    /// A cursor positioned at `page`.
    pub(crate) fn at(range: Option<&'r RangeDescriptor>, page: Page) -> SharedCursor<'r> {
        let position = range.and_then(|r| r.locate(page));
        SharedCursor { range, page, position }
    }

    /// Returns the entry backing the current page and advances to the next page.
    ///
    /// `None` means there's nothing to resolve for this page: the range is private,
    /// no subrange covers the page, or its indirection table ended before the page.
    pub(crate) fn next_entry(&mut self) -> Option<PrototypeRef> {
        let range = self.range?;
        let page = self.page;
        self.page = page + 1;
        let (i, offset) = match self.position {
            Some(position) => position,
            None => range.locate(page)?,
        };
        let subranges = range.subranges();
        let current = subranges[i];
        let entry = current.entry_for(offset);
        self.position = if offset + 1 < current.page_count {
            Some((i, offset + 1))
        } else {
            subranges.get(i + 1)
                .filter(|next| next.start == current.start + current.page_count)
                .map(|_| (i + 1, 0))
        };
        entry
    }
}
