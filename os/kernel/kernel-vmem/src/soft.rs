//! A software model of the MMU for host-side tests.
//!
//! Physical memory is a run of 4 KiB-aligned frames owned by the
//! [`SoftMmu`]; physical addresses map to byte offsets from its base. Once
//! paging is enabled, every access walks the loaded directory in that memory
//! the way the processor would. A walk that hits a non-present entry, or an
//! address outside of the simulated RAM, panics with `page fault at ...`.

use crate::Mmu;
use crate::page_entry::PageEntry;
use crate::page_table::{L1Index, L2Index};
use alloc::alloc::{Layout, alloc_zeroed, handle_alloc_error};
use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};

#[repr(C, align(4096))]
struct Frame(#[allow(dead_code)] [u8; PAGE_SIZE as usize]);

pub struct SoftMmu {
    base: PhysicalAddress,
    frames: Box<[UnsafeCell<Frame>]>,
    directory: AtomicU32,
    paging: AtomicBool,
    invalidations: AtomicUsize,
}

// Safety: frames are only reached through raw pointers; the code under test
// provides the synchronization real RAM would need.
unsafe impl Sync for SoftMmu {}
unsafe impl Send for SoftMmu {}

impl SoftMmu {
    /// Zeroed RAM covering `[base, base + size)`; paging starts disabled.
    #[must_use]
    pub fn new(base: PhysicalAddress, size: u32) -> Self {
        assert!(base.is_aligned::<Size4K>() && size.is_multiple_of(PAGE_SIZE));
        let count = (size / PAGE_SIZE) as usize;
        let frames = if count == 0 {
            Box::new([])
        } else {
            let layout = Layout::array::<UnsafeCell<Frame>>(count).expect("frame layout");
            unsafe {
                let ptr = alloc_zeroed(layout).cast::<UnsafeCell<Frame>>();
                if ptr.is_null() {
                    handle_alloc_error(layout);
                }
                Box::from_raw(core::ptr::slice_from_raw_parts_mut(ptr, count))
            }
        };

        Self {
            base,
            frames,
            directory: AtomicU32::new(0),
            paging: AtomicBool::new(false),
            invalidations: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Exclusive end of the simulated RAM.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.base.as_u64() + self.frames.len() as u64 * u64::from(PAGE_SIZE)
    }

    /// The directory most recently loaded into CR3.
    #[must_use]
    pub fn directory(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.directory.load(Ordering::Acquire))
    }

    /// Number of single-page TLB invalidations so far.
    #[must_use]
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Host pointer to the byte at `pa`.
    ///
    /// # Panics
    /// If `pa` lies outside the simulated RAM.
    #[must_use]
    pub fn phys_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        if pa < self.base || pa.as_u64() >= self.end() {
            panic!("page fault at {pa}: outside physical memory");
        }
        let offset = (pa.as_u32() - self.base.as_u32()) as usize;
        let frame = &self.frames[offset / PAGE_SIZE as usize];
        unsafe {
            frame
                .get()
                .cast::<u8>()
                .add(offset % PAGE_SIZE as usize)
        }
    }

    fn read_entry(&self, table: PhysicalAddress, index: usize) -> PageEntry {
        let ptr = self.phys_ptr(table + (index as u32) * 4).cast::<AtomicU32>();
        PageEntry::from_bits(unsafe { &*ptr }.load(Ordering::Acquire))
    }

    /// Translate `va` through the loaded directory, as the processor would.
    /// Identity while paging is disabled.
    #[must_use]
    pub fn walk(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if !self.paging.load(Ordering::Acquire) {
            return Some(PhysicalAddress::new(va.as_u32()));
        }

        let pde = self.read_entry(self.directory(), L2Index::of(va).as_usize());
        if !pde.present() {
            return None;
        }
        let pte = self.read_entry(pde.address().into(), L1Index::of(va).as_usize());
        if !pte.present() {
            return None;
        }
        Some(PhysicalAddress::from(pte.address()) + va.offset::<Size4K>())
    }
}

impl Mmu for SoftMmu {
    fn virt_to_ptr<T>(&self, va: VirtualAddress) -> *mut T {
        match self.walk(va) {
            Some(pa) => self.phys_ptr(pa).cast(),
            None => panic!("page fault at {va}"),
        }
    }

    unsafe fn load_directory(&self, directory: PhysicalAddress) {
        self.directory.store(directory.as_u32(), Ordering::Release);
    }

    unsafe fn enable_paging(&self) {
        self.paging.store(true, Ordering::Release);
    }

    fn paging_enabled(&self) -> bool {
        self.paging.load(Ordering::Acquire)
    }

    fn invalidate_page(&self, _va: VirtualAddress) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}
