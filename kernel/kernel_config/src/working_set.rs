//! Default working-set limits and tuning knobs.
//!
//! These are the values a `WorkingSetConfig` starts out with;
//! all of them except [`FLUID_WORKING_SET`] and [`MAXIMUM_WORKING_SET_LIMIT`]
//! can be overridden per address space.

use crate::memory::{BYTES_PER_ADDR, PAGE_SIZE};

/// Number of working-set list entries held by one working-set list page.
pub const WSLES_PER_PAGE: usize = PAGE_SIZE / BYTES_PER_ADDR;
/// Number of hash table entries (a virtual address and a slot index) held by one hash table page.
pub const HASH_ENTRIES_PER_PAGE: usize = PAGE_SIZE / (2 * BYTES_PER_ADDR);

/// Pages reserved for the working-set list before the hash table's region begins.
pub const DEFAULT_WSL_REGION_PAGES: usize = 64;
/// Upper bound on the number of pages the hash table may occupy.
pub const DEFAULT_HASH_REGION_PAGES: usize = 16;

pub const DEFAULT_MINIMUM_WORKING_SET: usize = 50;
pub const DEFAULT_MAXIMUM_WORKING_SET: usize = 345;
/// No working set can be configured larger than this many pages.
pub const MAXIMUM_WORKING_SET_LIMIT: usize = 0x0FFF_FFFF;
/// When both limits are hard, the maximum must exceed the minimum by more than this.
pub const FLUID_WORKING_SET: usize = 8;

/// A candidate at least this many aging passes old is evicted without looking further.
pub const DEFAULT_IMMEDIATE_REPLACEMENT_AGE: u32 = 3;
/// Replacement settles for the oldest candidate after examining this many.
pub const DEFAULT_MAX_REPLACEMENT_CANDIDATES: usize = 8;

/// Growth is throttled while fewer free physical pages than this remain.
pub const DEFAULT_GROWTH_FREE_PAGE_FLOOR: usize = 16;
/// Above this many free physical pages, a soft maximum may be exceeded.
pub const DEFAULT_PLENTY_FREE_PAGES: usize = 1024;

/// Capacity of a deferred invalidation list.
pub const DEFAULT_FLUSH_LIST_CAPACITY: usize = 32;

/// The range teardown flushes and drops the coarse lock after this many deletions.
pub const TEARDOWN_LOCK_BATCH: usize = 16;
