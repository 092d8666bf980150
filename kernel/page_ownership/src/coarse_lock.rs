//! The guard of the coarse page-ownership lock.

use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};
use crate::PageDescriptorTable;

/// A held (or temporarily released) coarse page-ownership lock.
///
/// Unlike a plain `MutexGuard`, this can be [`release`]d and [`reacquire`]d
/// in place, so that an operation can drop the lock while it waits on
/// another resource without giving up its handle to the lock.
/// Every reacquisition is counted, which lets callers detect that the lock
/// was dropped underneath them and re-validate what they resolved while holding it.
///
/// Dereferencing a released `CoarseLock` is a bug and panics.
///
/// [`release`]: CoarseLock::release
/// [`reacquire`]: CoarseLock::reacquire
pub struct CoarseLock<'o> {
    lock: &'o Mutex<PageDescriptorTable>,
    guard: Option<MutexGuard<'o, PageDescriptorTable>>,
    reacquisitions: usize,
}
assert_not_impl_any!(CoarseLock<'static>: Clone);

impl<'o> CoarseLock<'o> {
    pub(crate) fn new(lock: &'o Mutex<PageDescriptorTable>) -> CoarseLock<'o> {
        CoarseLock {
            lock,
            guard: Some(lock.lock()),
            reacquisitions: 0,
        }
    }

    /// Drops the lock. Does nothing if it was already released.
    pub fn release(&mut self) {
        self.guard = None;
    }

    /// Acquires the lock again after a [`release()`](Self::release).
    /// Does nothing if it's currently held.
    pub fn reacquire(&mut self) {
        if self.guard.is_none() {
            self.guard = Some(self.lock.lock());
            self.reacquisitions += 1;
        }
    }

    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }

    /// The number of times this lock has been reacquired since it was first taken.
    pub fn reacquisitions(&self) -> usize {
        self.reacquisitions
    }
}

impl<'o> Deref for CoarseLock<'o> {
    type Target = PageDescriptorTable;
    fn deref(&self) -> &PageDescriptorTable {
        match self.guard.as_deref() {
            Some(table) => table,
            None => panic!("BUG: used the page descriptor table without holding the coarse lock"),
        }
    }
}

impl<'o> DerefMut for CoarseLock<'o> {
    fn deref_mut(&mut self) -> &mut PageDescriptorTable {
        match self.guard.as_deref_mut() {
            Some(table) => table,
            None => panic!("BUG: used the page descriptor table without holding the coarse lock"),
        }
    }
}
