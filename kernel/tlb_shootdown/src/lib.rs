//! Support for invalidating stale translations, locally or on all cores.
//!
//! The actual flushing (and the shootdown IPIs it may take) is done by a
//! [`TlbInvalidator`]; this crate only decides when and how much to flush.
//! A [`FlushList`] defers invalidations so that a long run of unmappings
//! costs one batched shootdown instead of one per page.

#![no_std]

extern crate alloc;

#[cfg(test)]
mod test;

use alloc::vec::Vec;
use memory_structs::VirtualAddress;

/// Invalidates cached translations.
///
/// If `all_cores` is set, the invalidation must be complete on every core
/// before the call returns, i.e., it's a synchronous shootdown.
pub trait TlbInvalidator: Send + Sync {
    fn flush_one(&self, vaddr: VirtualAddress, all_cores: bool);
    fn flush_batch(&self, vaddrs: &[VirtualAddress], all_cores: bool);
    fn flush_all(&self, all_cores: bool);
}

/// A bounded list of deferred invalidations.
///
/// Once the list is full, further addresses can either be refused
/// ([`try_push()`](FlushList::try_push)), so the caller flushes them immediately,
/// or absorbed ([`push()`](FlushList::push)), in which case the next
/// [`flush()`](FlushList::flush) invalidates everything at once.
pub struct FlushList {
    vaddrs: Vec<VirtualAddress>,
    capacity: usize,
    all_cores: bool,
    overflowed: bool,
}

impl FlushList {
    pub fn new(capacity: usize, all_cores: bool) -> FlushList {
        FlushList {
            vaddrs: Vec::with_capacity(capacity),
            capacity,
            all_cores,
            overflowed: false,
        }
    }

    /// Defers the invalidation of `vaddr`, or gives it back if the list is full.
    pub fn try_push(&mut self, vaddr: VirtualAddress) -> Result<(), VirtualAddress> {
        if self.vaddrs.len() >= self.capacity {
            return Err(vaddr);
        }
        self.vaddrs.push(vaddr);
        Ok(())
    }

    /// Defers the invalidation of `vaddr`, switching to a full flush if the list is full.
    pub fn push(&mut self, vaddr: VirtualAddress) {
        if self.try_push(vaddr).is_err() {
            self.overflowed = true;
        }
    }

    /// Defers the invalidation of `vaddr`, or issues it right away if the list is full.
    pub fn push_or_flush(&mut self, vaddr: VirtualAddress, invalidator: &dyn TlbInvalidator) {
        if let Err(vaddr) = self.try_push(vaddr) {
            invalidator.flush_one(vaddr, self.all_cores);
        }
    }

    /// Issues every deferred invalidation and empties the list.
    pub fn flush(&mut self, invalidator: &dyn TlbInvalidator) {
        if self.overflowed {
            log::debug!("FlushList: overflowed past {} entries, flushing everything", self.capacity);
            invalidator.flush_all(self.all_cores);
        } else {
            match self.vaddrs.as_slice() {
                [] => {}
                [vaddr] => invalidator.flush_one(*vaddr, self.all_cores),
                vaddrs => invalidator.flush_batch(vaddrs, self.all_cores),
            }
        }
        self.vaddrs.clear();
        self.overflowed = false;
    }

    pub fn len(&self) -> usize {
        self.vaddrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vaddrs.is_empty() && !self.overflowed
    }
}
