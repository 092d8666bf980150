//! Runtime tunables of a working set.

use kernel_config::{
    memory::{MAX_HIERARCHY_DEPTH, MIN_HIERARCHY_DEPTH, DEFAULT_HIERARCHY_DEPTH},
    working_set::*,
};
use page_table::AddressSpaceLayout;

/// Why a pair of working-set limits was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitError {
    MinimumExceedsMaximum,
    AboveAbsoluteMaximum,
    /// Both limits are hard, but they leave less than [`FLUID_WORKING_SET`] pages between them.
    NotEnoughFluid,
}

impl From<LimitError> for &'static str {
    fn from(err: LimitError) -> &'static str {
        match err {
            LimitError::MinimumExceedsMaximum => "working set minimum exceeds its maximum",
            LimitError::AboveAbsoluteMaximum => "working set maximum is above the absolute limit",
            LimitError::NotEnoughFluid => "hard working set limits are too close together",
        }
    }
}

/// Checks a minimum and maximum working-set size against each other and the absolute limit.
pub fn check_limits(minimum: usize, maximum: usize, hard_minimum: bool, hard_maximum: bool) -> Result<(), LimitError> {
    if minimum > maximum {
        return Err(LimitError::MinimumExceedsMaximum);
    }
    if maximum > MAXIMUM_WORKING_SET_LIMIT {
        return Err(LimitError::AboveAbsoluteMaximum);
    }
    if hard_minimum && hard_maximum && minimum + FLUID_WORKING_SET >= maximum {
        return Err(LimitError::NotEnoughFluid);
    }
    Ok(())
}

/// The configuration of one working set and the address space it describes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkingSetConfig {
    /// The number of levels in the page-table hierarchy.
    pub hierarchy_depth: usize,
    /// Working-set list entries held by each list page.
    pub entries_per_page: usize,
    /// Hash table entries held by each hash table page.
    pub hash_entries_per_page: usize,
    /// The most list pages there can be; the hash table's region starts right after them.
    pub wsl_region_pages: usize,
    pub hash_region_pages: usize,
    pub minimum_size: usize,
    pub maximum_size: usize,
    /// Trimming never shrinks the set below `minimum_size`.
    pub hard_minimum: bool,
    /// The set never grows beyond `maximum_size`.
    pub hard_maximum: bool,
    /// A page that has not been accessed for this many aging epochs is evicted on sight.
    pub immediate_replacement_age: u32,
    /// How many eviction candidates to examine before settling for the oldest.
    pub max_replacement_candidates: usize,
    /// Growth is throttled while fewer pages than this are free.
    pub growth_free_page_floor: usize,
    /// A soft maximum may be exceeded while at least this many pages are free.
    pub plenty_free_pages: usize,
    pub flush_list_capacity: usize,
    /// Invalidate translations on every core rather than just the current one.
    pub broadcast_invalidations: bool,
}

impl Default for WorkingSetConfig {
    fn default() -> Self {
        WorkingSetConfig {
            hierarchy_depth: DEFAULT_HIERARCHY_DEPTH,
            entries_per_page: WSLES_PER_PAGE,
            hash_entries_per_page: HASH_ENTRIES_PER_PAGE,
            wsl_region_pages: DEFAULT_WSL_REGION_PAGES,
            hash_region_pages: DEFAULT_HASH_REGION_PAGES,
            minimum_size: DEFAULT_MINIMUM_WORKING_SET,
            maximum_size: DEFAULT_MAXIMUM_WORKING_SET,
            hard_minimum: false,
            hard_maximum: false,
            immediate_replacement_age: DEFAULT_IMMEDIATE_REPLACEMENT_AGE,
            max_replacement_candidates: DEFAULT_MAX_REPLACEMENT_CANDIDATES,
            growth_free_page_floor: DEFAULT_GROWTH_FREE_PAGE_FLOOR,
            plenty_free_pages: DEFAULT_PLENTY_FREE_PAGES,
            flush_list_capacity: DEFAULT_FLUSH_LIST_CAPACITY,
            broadcast_invalidations: true,
        }
    }
}

impl WorkingSetConfig {
    pub fn with_hierarchy_depth(mut self, depth: usize) -> Self {
        self.hierarchy_depth = depth;
        self
    }

    pub fn with_entries_per_page(mut self, entries: usize) -> Self {
        self.entries_per_page = entries;
        self
    }

    pub fn with_hash_entries_per_page(mut self, entries: usize) -> Self {
        self.hash_entries_per_page = entries;
        self
    }

    pub fn with_regions(mut self, wsl_region_pages: usize, hash_region_pages: usize) -> Self {
        self.wsl_region_pages = wsl_region_pages;
        self.hash_region_pages = hash_region_pages;
        self
    }

    pub fn with_limits(mut self, minimum: usize, maximum: usize, hard_minimum: bool, hard_maximum: bool) -> Self {
        self.minimum_size = minimum;
        self.maximum_size = maximum;
        self.hard_minimum = hard_minimum;
        self.hard_maximum = hard_maximum;
        self
    }

    pub fn with_replacement(mut self, immediate_age: u32, max_candidates: usize) -> Self {
        self.immediate_replacement_age = immediate_age;
        self.max_replacement_candidates = max_candidates;
        self
    }

    pub fn with_free_page_thresholds(mut self, growth_floor: usize, plenty: usize) -> Self {
        self.growth_free_page_floor = growth_floor;
        self.plenty_free_pages = plenty;
        self
    }

    pub fn with_flush_list_capacity(mut self, capacity: usize) -> Self {
        self.flush_list_capacity = capacity;
        self
    }

    pub fn with_broadcast_invalidations(mut self, broadcast: bool) -> Self {
        self.broadcast_invalidations = broadcast;
        self
    }

    /// Checks that this configuration describes a working set that can exist.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !(MIN_HIERARCHY_DEPTH..=MAX_HIERARCHY_DEPTH).contains(&self.hierarchy_depth) {
            return Err("unsupported page table hierarchy depth");
        }
        // growing by one list page adds up to `depth` locked entries,
        // and at least one dynamic entry must remain
        if self.entries_per_page <= self.hierarchy_depth || self.entries_per_page > WSLES_PER_PAGE {
            return Err("invalid number of working set list entries per page");
        }
        if self.hash_entries_per_page == 0 || self.hash_entries_per_page > HASH_ENTRIES_PER_PAGE {
            return Err("invalid number of hash table entries per page");
        }
        let layout = AddressSpaceLayout::new(self.hierarchy_depth);
        if self.wsl_region_pages == 0
            || self.wsl_region_pages + self.hash_region_pages > layout.root_entry_pages()
        {
            return Err("working set list and hash table regions don't fit in their root table entry");
        }
        if self.flush_list_capacity == 0 || self.max_replacement_candidates == 0 {
            return Err("flush list capacity and replacement candidates must be nonzero");
        }
        check_limits(self.minimum_size, self.maximum_size, self.hard_minimum, self.hard_maximum)
            .map_err(Into::into)
    }
}
