//! # Page Tables and Directories
//!
//! Both levels are 4 KiB-aligned arrays of 1024 [`PageEntry`] words.
//!
//! - [`L2Index`]: index into the page directory, VA bits `[31:22]`.
//! - [`L1Index`]: index into a page table, VA bits `[21:12]`.
//!
//! Entries are atomics: translations are read without the address-space lock
//! while a mapper may be writing a neighbouring entry.

use crate::Mmu;
use crate::page_entry::PageEntry;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::memory::ENTRIES_PER_TABLE;
use kernel_memory_addresses::{MemoryAddress, VirtualAddress};

/// Index into a page table (derived from VA bits `[21:12]`).
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L1Index(u16);

/// Index into a page directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L2Index(u16);

impl L1Index {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(va: VirtualAddress) -> Self {
        Self(((va.as_u32() >> 12) & 0x3FF) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES_PER_TABLE);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl L2Index {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(va: VirtualAddress) -> Self {
        Self((va.as_u32() >> 22) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES_PER_TABLE);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// First virtual address covered by this directory entry.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u32) << 22)
    }
}

/// A page table or page directory: 1024 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [AtomicU32; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    /// View the table stored at the kernel-virtual address `va`.
    ///
    /// # Safety
    /// `va` must be page aligned, mapped, and hold a page table for as long as
    /// the returned reference lives.
    #[inline]
    #[must_use]
    pub unsafe fn at<M: Mmu>(mmu: &M, va: VirtualAddress) -> &PageTable {
        debug_assert!(va.is_aligned::<kernel_memory_addresses::Size4K>());
        unsafe { &*mmu.virt_to_ptr::<PageTable>(va) }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, i: usize) -> PageEntry {
        PageEntry::from_bits(self.entries[i].load(Ordering::Acquire))
    }

    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub fn set(&self, i: usize, e: PageEntry) {
        self.entries[i].store(e.into_bits(), Ordering::Release);
    }

    #[inline]
    pub fn clear_entry(&self, i: usize) -> PageEntry {
        PageEntry::from_bits(self.entries[i].swap(0, Ordering::AcqRel))
    }

    /// Mark every entry unused.
    pub fn clear(&self) {
        for e in &self.entries {
            e.store(0, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.load(Ordering::Relaxed) == 0)
    }

    /// Copy entries `range` from `other`.
    pub fn copy_from(&self, other: &Self, range: core::ops::Range<usize>) {
        for i in range {
            self.set(i, other.get(i));
        }
    }

    /// Address stored in entry `i`, if the entry is present.
    #[inline]
    #[must_use]
    pub fn target(&self, i: usize) -> Option<MemoryAddress> {
        let e = self.get(i);
        e.present().then(|| e.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_entry::PageFlags;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn indices_split_the_address() {
        let va = VirtualAddress::new(0x8040_3ABC);
        assert_eq!(L2Index::of(va).as_usize(), 0x201);
        assert_eq!(L1Index::of(va).as_usize(), 0x003);
        assert_eq!(L2Index::new(0x201).base(), VirtualAddress::new(0x8040_0000));
    }

    #[test]
    fn entries_are_individually_addressable() {
        let table = Box::new(PageTable {
            entries: [const { AtomicU32::new(0) }; ENTRIES_PER_TABLE],
        });
        assert!(table.is_empty());

        let e = PageEntry::mapping(PhysicalAddress::new(0x5000), PageFlags::kernel_rw());
        table.set(1023, e);
        assert_eq!(table.get(1023), e);
        assert_eq!(table.target(1023), Some(MemoryAddress::new(0x5000)));
        assert_eq!(table.target(0), None);
        assert!(!table.is_empty());

        assert_eq!(table.clear_entry(1023), e);
        assert!(table.is_empty());
    }
}
