//! This crate defines the flags of a page table entry (PTE).
//!
//! [`PteFlags`] mixes two kinds of bits:
//! * protection bits, chosen by whoever creates a mapping
//!   (`WRITABLE`, `NOT_EXECUTABLE`, `USER_ACCESSIBLE`, `NO_CACHE`, `COPY_ON_WRITE`);
//! * bits maintained by the hardware on a live mapping (`ACCESSED`, `DIRTY`).
//!
//! Only the protection bits survive when a mapping leaves the `Valid` state;
//! see [`PteFlags::protection()`].

#![no_std]


use bitflags::bitflags;

bitflags! {
    /// Flags for a page table entry that define how a page is mapped.
    pub struct PteFlags: u64 {
        /// * If set, this page is currently "present" in memory.
        /// * If not set, this page is not in memory; the rest of the entry
        ///   says why (transition, backing store, shared indirection, or nothing).
        const VALID = 1 << 0;

        /// * If set, this page is writable.
        /// * If not set, this page is read-only.
        const WRITABLE = 1 << 1;

        /// * If set, userspace (unprivileged mode) can access this page.
        const USER_ACCESSIBLE = 1 << 2;

        /// * If set, accesses to this page bypass the cache.
        const NO_CACHE = 1 << 4;

        /// * The hardware will set this bit when the page is accessed.
        /// * The working set clears it during aging once it has folded
        ///   the access into the page's recency stamp.
        const ACCESSED = 1 << 5;

        /// * The hardware will set this bit when the page has been written to.
        /// * It must be copied into the physical page descriptor
        ///   before the mapping is invalidated, otherwise the write is lost.
        const DIRTY = 1 << 6;

        /// Software-defined: a write to this page must first make a private copy.
        const COPY_ON_WRITE = 1 << 9;

        /// * If set, this page is not executable.
        /// * If not set, this page is executable.
        const NOT_EXECUTABLE = 1 << 63;
    }
}

/// See [`PteFlags::new()`] for what bits are set by default.
impl Default for PteFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl PteFlags {
    /// Returns a new `PteFlags` with the default value, in which
    /// only the `NOT_EXECUTABLE` bit is set.
    pub const fn new() -> Self {
        Self::NOT_EXECUTABLE
    }

    /// The bits that describe protection rather than hardware state.
    pub const PROTECTION_MASK: PteFlags = Self::from_bits_truncate(
        Self::WRITABLE.bits
        | Self::USER_ACCESSIBLE.bits
        | Self::NO_CACHE.bits
        | Self::COPY_ON_WRITE.bits
        | Self::NOT_EXECUTABLE.bits
    );

    /// Returns only the protection bits of these flags,
    /// dropping `VALID`, `ACCESSED` and `DIRTY`.
    #[must_use]
    pub fn protection(self) -> Self {
        self & Self::PROTECTION_MASK
    }

    /// Returns a copy of this `PteFlags` with the `VALID` bit set or cleared.
    #[must_use]
    #[doc(alias("present"))]
    pub fn valid(mut self, enable: bool) -> Self {
        self.set(Self::VALID, enable);
        self
    }

    /// Returns a copy of this `PteFlags` with the `WRITABLE` bit set or cleared.
    #[must_use]
    #[doc(alias("read_only"))]
    pub fn writable(mut self, enable: bool) -> Self {
        self.set(Self::WRITABLE, enable);
        self
    }

    /// Returns a copy of this `PteFlags` with the `NOT_EXECUTABLE` bit cleared (`enable`) or set.
    #[must_use]
    #[doc(alias("no_exec"))]
    pub fn executable(mut self, enable: bool) -> Self {
        self.set(Self::NOT_EXECUTABLE, !enable);
        self
    }

    #[must_use]
    pub fn copy_on_write(mut self, enable: bool) -> Self {
        self.set(Self::COPY_ON_WRITE, enable);
        self
    }

    #[doc(alias("present"))]
    pub fn is_valid(&self) -> bool {
        self.contains(Self::VALID)
    }

    #[doc(alias("read_only"))]
    pub fn is_writable(&self) -> bool {
        self.contains(Self::WRITABLE)
    }

    #[doc(alias("no_exec"))]
    pub fn is_executable(&self) -> bool {
        !self.contains(Self::NOT_EXECUTABLE)
    }

    pub fn is_dirty(&self) -> bool {
        self.contains(Self::DIRTY)
    }

    pub fn is_accessed(&self) -> bool {
        self.contains(Self::ACCESSED)
    }

    pub fn is_copy_on_write(&self) -> bool {
        self.contains(Self::COPY_ON_WRITE)
    }
}
