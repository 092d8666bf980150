//! The backing store holds the content of private pages that are not resident.
//!
//! The memory subsystem never allocates blocks on its own behalf here;
//! it only gives back reservations through [`BackingStore::release_block()`]
//! when the mapping or page that owned them goes away.
//!
//! [`PagingFile`] is a simple fixed-size implementation that tracks its blocks in a bitmap.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
mod test;

use alloc::vec;
use alloc::vec::Vec;
use page_table_entry::BackingStoreLocation;
use spin::Mutex;

/// The contract between the memory subsystem and whatever manages backing-store blocks.
pub trait BackingStore: Send + Sync {
    /// Releases the block at the given `location`.
    ///
    /// Returns `true` if a block was actually released,
    /// and `false` for the `NoBlock` and `LookupNeeded` sentinels.
    /// Releasing must be synchronous and must never block.
    fn release_block(&self, location: BackingStoreLocation) -> bool;
}

const BITS_PER_WORD: usize = u64::BITS as usize;

/// A paging file of a fixed number of blocks.
pub struct PagingFile {
    bitmap: Mutex<Vec<u64>>,
    num_blocks: usize,
}

impl PagingFile {
    /// Creates a new paging file with `num_blocks` blocks, all of them free.
    pub fn new(num_blocks: usize) -> PagingFile {
        let words = (num_blocks + BITS_PER_WORD - 1) / BITS_PER_WORD;
        PagingFile {
            bitmap: Mutex::new(vec![0; words]),
            num_blocks,
        }
    }

    /// Reserves the lowest free block, or returns `None` if the file is full.
    pub fn reserve_block(&self) -> Option<BackingStoreLocation> {
        let mut bitmap = self.bitmap.lock();
        for (w, word) in bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let block = w * BITS_PER_WORD + bit;
            if block >= self.num_blocks {
                break;
            }
            *word |= 1 << bit;
            return Some(BackingStoreLocation::Block(block));
        }
        warn!("PagingFile: all {} blocks are reserved", self.num_blocks);
        None
    }

    /// Returns the number of reserved blocks.
    pub fn reserved_count(&self) -> usize {
        self.bitmap.lock().iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn capacity(&self) -> usize {
        self.num_blocks
    }
}

impl BackingStore for PagingFile {
    fn release_block(&self, location: BackingStoreLocation) -> bool {
        let block = match location {
            BackingStoreLocation::Block(b) => b,
            BackingStoreLocation::NoBlock | BackingStoreLocation::LookupNeeded => return false,
        };
        if block >= self.num_blocks {
            error!("PagingFile::release_block(): block {} is beyond the end of the file", block);
            panic!("BUG: released a backing-store block outside of the paging file");
        }
        let mut bitmap = self.bitmap.lock();
        let word = &mut bitmap[block / BITS_PER_WORD];
        let mask = 1 << (block % BITS_PER_WORD);
        if *word & mask == 0 {
            error!("PagingFile::release_block(): block {} was not reserved", block);
            panic!("BUG: released a backing-store block twice");
        }
        *word &= !mask;
        trace!("PagingFile: released block {}", block);
        true
    }
}
