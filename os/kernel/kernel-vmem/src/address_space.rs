//! # Address Space (x86, two-level)
//!
//! A [`VirtualAddressSpace`] owns one page directory and maps, unmaps and
//! translates 4 KiB pages in it.
//!
//! ## Two directories
//!
//! Once paging is on, the kernel can no longer follow the physical addresses
//! stored in the hardware directory. Every address space therefore keeps a
//! *shadow* directory with the same layout whose entries hold the
//! kernel-virtual address of each page table:
//!
//! ```text
//!  physical directory (CR3)        shadow directory
//!  ┌──────────────────────┐        ┌──────────────────────┐
//!  │ PA(table) | P RW US  │  ...   │ VA(table) | P RW US  │
//!  └──────────────────────┘        └──────────────────────┘
//! ```
//!
//! Both are updated together under the address-space lock. Lookups read the
//! shadow without the lock.
//!
//! ## Kernel and user spaces
//!
//! Directory entries `0..512` cover the kernel area and point at page tables
//! owned by the kernel space; user spaces copy them at creation and own
//! entries `512..1024` exclusively.

use crate::page_entry::{PageEntry, PageFlags};
use crate::page_table::{L1Index, L2Index, PageTable};
use crate::{Mmu, PageTableAlloc, PageTableFrame};
use alloc::boxed::Box;
use kernel_info::fault::KernelFault;
use kernel_info::memory::{ENTRIES_PER_TABLE, KERNEL_AREA};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_sync::{SpinLock, SpinLockGuard};
use thiserror::Error;

/// Directory entries shared by all address spaces.
pub const KERNEL_DIRECTORY_ENTRIES: core::ops::Range<usize> = 0..KERNEL_AREA.directory_entries();

/// Directory entries private to one address space.
pub const USER_DIRECTORY_ENTRIES: core::ops::Range<usize> =
    KERNEL_AREA.directory_entries()..ENTRIES_PER_TABLE;

/// Failures a mapper has to branch on. Everything else is fatal.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum VmmError {
    /// No page table could be allocated for the address.
    #[error("no page table available to map {0}")]
    OutOfPagingMemory(VirtualAddress),
    /// No page could be allocated for a new directory.
    #[error("no page available for a page directory")]
    NoDirectory,
}

/// The heap manager an address space hands out virtual ranges from.
pub enum HeapRef<'m, H> {
    /// The kernel heap, shared.
    Borrowed(&'m H),
    /// A process heap, owned by its address space.
    Owned(Box<H>),
}

impl<H> core::ops::Deref for HeapRef<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        match self {
            HeapRef::Borrowed(h) => h,
            HeapRef::Owned(h) => h.as_ref(),
        }
    }
}

pub struct VirtualAddressSpace<'m, M: Mmu, H> {
    mmu: &'m M,
    physical_directory: PhysicalAddress,
    directory: VirtualAddress,
    virtual_directory: VirtualAddress,
    heap: HeapRef<'m, H>,
    kernel_address_space: bool,
    lock: SpinLock<()>,
}

impl<'m, M: Mmu, H> VirtualAddressSpace<'m, M, H> {
    /// Wrap the directory built during bootstrap.
    ///
    /// # Safety
    /// - `directory` must be the kernel-virtual address of the page directory
    ///   at `physical_directory`.
    /// - `virtual_directory` must be a zeroed or consistent shadow of it.
    /// - Only one kernel address space may exist.
    pub unsafe fn kernel(
        mmu: &'m M,
        physical_directory: PhysicalAddress,
        directory: VirtualAddress,
        virtual_directory: VirtualAddress,
        heap: &'m H,
    ) -> Self {
        debug_assert!(physical_directory.is_aligned::<Size4K>());
        debug_assert!(directory.is_aligned::<Size4K>());
        debug_assert!(virtual_directory.is_aligned::<Size4K>());
        Self {
            mmu,
            physical_directory,
            directory,
            virtual_directory,
            heap: HeapRef::Borrowed(heap),
            kernel_address_space: true,
            lock: SpinLock::new(()),
        }
    }

    /// A new process address space sharing the kernel area of `kernel`.
    ///
    /// # Errors
    /// [`VmmError::NoDirectory`] if `tables` cannot supply the two directory pages.
    pub fn user(
        kernel: &Self,
        heap: H,
        tables: &impl PageTableAlloc,
    ) -> Result<Self, VmmError> {
        let directory = tables.allocate_page_table().ok_or(VmmError::NoDirectory)?;
        let Some(shadow) = tables.allocate_page_table() else {
            tables.free_page_table(directory);
            return Err(VmmError::NoDirectory);
        };

        let space = Self {
            mmu: kernel.mmu,
            physical_directory: directory.phys,
            directory: directory.virt,
            virtual_directory: shadow.virt,
            heap: HeapRef::Owned(Box::new(heap)),
            kernel_address_space: false,
            lock: SpinLock::new(()),
        };

        // Copied once. A kernel page table installed after this point is
        // missing here, so callers install all of them first.
        let _guard = kernel.lock.lock();
        space
            .physical()
            .copy_from(kernel.physical(), KERNEL_DIRECTORY_ENTRIES);
        space
            .shadow()
            .copy_from(kernel.shadow(), KERNEL_DIRECTORY_ENTRIES);

        log::debug!(
            "created address space, directory at {} ({})",
            space.physical_directory,
            space.directory
        );
        Ok(space)
    }

    fn physical(&self) -> &PageTable {
        // SAFETY: the directory page is mapped in the kernel area for the
        // lifetime of the address space and only accessed through atomics.
        unsafe { PageTable::at(self.mmu, self.directory) }
    }

    fn shadow(&self) -> &PageTable {
        // SAFETY: as for the hardware directory; the shadow is never handed
        // to the MMU, so its entries may hold virtual addresses.
        unsafe { PageTable::at(self.mmu, self.virtual_directory) }
    }

    /// Kernel-virtual address of the page table covering `index`, if any.
    fn table(&self, index: L2Index) -> Option<VirtualAddress> {
        self.shadow().target(index.as_usize()).map(VirtualAddress::from)
    }

    fn table_flags(va: VirtualAddress) -> PageFlags {
        PageFlags::kernel_rw().with_user_accessible(!KERNEL_AREA.contains(va.as_u32()))
    }

    /// Link a page table into both directories. Caller holds the lock.
    fn link_table(&self, index: L2Index, frame: PageTableFrame) {
        let flags = Self::table_flags(index.base());
        let i = index.as_usize();
        // Shadow first: a lock-free reader must not find a present hardware
        // entry whose shadow is still missing.
        self.shadow()
            .set(i, PageEntry::with_address(frame.virt.as_memory_address(), flags));
        self.physical().set(i, PageEntry::mapping(frame.phys, flags));
    }

    /// The frame `va` translates to, including the offset into the page.
    ///
    /// Never allocates and never takes the lock.
    #[must_use]
    pub fn get_physical_address(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let table = self.table(L2Index::of(va))?;
        // SAFETY: shadow entries only name page tables in the kernel area,
        // which stay mapped until the directory entry is cleared.
        let entry = unsafe { PageTable::at(self.mmu, table) }.get(L1Index::of(va).as_usize());
        entry
            .present()
            .then(|| PhysicalAddress::from(entry.address()) + va.offset::<Size4K>())
    }

    /// Map the page at `virt` onto the frame at `phys`.
    ///
    /// With `abort_if_locked`, a contended lock returns `Ok(false)` instead of
    /// spinning; the page-fault handler uses this so that a fault raised while
    /// the lock is held on the same CPU cannot deadlock.
    ///
    /// # Errors
    /// [`VmmError::OutOfPagingMemory`] if a page table was needed and `tables`
    /// had none.
    ///
    /// # Panics
    /// Fires [`KernelFault::PagingError`] if `virt` is already mapped. The
    /// existing mapping is left untouched.
    pub fn map(
        &self,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        flags: PageFlags,
        abort_if_locked: bool,
        tables: &impl PageTableAlloc,
    ) -> Result<bool, VmmError> {
        let Some(_guard) = self.acquire(abort_if_locked) else {
            return Ok(false);
        };

        let index = L2Index::of(virt);
        let table = if let Some(table) = self.table(index) {
            table
        } else {
            let frame = tables
                .allocate_page_table()
                .ok_or(VmmError::OutOfPagingMemory(virt))?;
            self.link_table(index, frame);
            frame.virt
        };

        // SAFETY: the table was linked by this space or the kernel space and
        // lies in the mapped kernel area; the lock serializes writers.
        let table = unsafe { PageTable::at(self.mmu, table) };
        let i = L1Index::of(virt).as_usize();
        if table.get(i).present() {
            log::error!(
                "{virt} is already mapped to {}, refusing {phys}",
                table.get(i).address()
            );
            KernelFault::PagingError("page is already mapped").fire();
        }
        table.set(
            i,
            PageEntry::mapping(phys.align_down::<Size4K>(), flags.with_present(true)),
        );
        Ok(true)
    }

    fn acquire(&self, abort_if_locked: bool) -> Option<SpinLockGuard<'_, ()>> {
        if abort_if_locked {
            self.lock.try_lock()
        } else {
            Some(self.lock.lock())
        }
    }

    /// Remove the mapping of the page at `virt` and return the frame it had.
    ///
    /// Only the local TLB entry is invalidated. Page tables are never
    /// reclaimed here, even once empty.
    pub fn unmap(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let _guard = self.lock.lock();
        let table = self.table(L2Index::of(virt))?;
        // SAFETY: as in `map`; the lock is held.
        let old = unsafe { PageTable::at(self.mmu, table) }.clear_entry(L1Index::of(virt).as_usize());
        if !old.present() {
            return None;
        }
        self.mmu.invalidate_page(virt.align_down::<Size4K>());
        Some(PhysicalAddress::from(old.address()))
    }

    /// Install `frame` as the page table for directory entry `index`.
    ///
    /// Returns `false` and leaves the directory unchanged if a table is
    /// already present.
    pub fn install_page_table(&self, index: L2Index, frame: PageTableFrame) -> bool {
        let _guard = self.lock.lock();
        if self.shadow().get(index.as_usize()).present() {
            return false;
        }
        self.link_table(index, frame);
        true
    }

    /// Whether directory entry `index` has a page table.
    #[must_use]
    pub fn has_page_table(&self, index: L2Index) -> bool {
        self.table(index).is_some()
    }

    /// Make this the active address space of the executing CPU.
    ///
    /// # Safety
    /// The kernel area must be mapped identically in this and the current space.
    pub unsafe fn activate(&self) {
        // SAFETY: upheld by the caller; the directory is complete for the
        // kernel area.
        unsafe { self.mmu.load_directory(self.physical_directory) };
    }

    /// Release the user page tables and both directories to `tables`.
    ///
    /// Mapped frames are not freed; that is up to the owner of the mappings.
    ///
    /// # Panics
    /// Fires [`KernelFault::IllegalState`] for the kernel address space.
    pub fn destroy(self, tables: &impl PageTableAlloc) {
        if self.kernel_address_space {
            KernelFault::IllegalState("the kernel address space cannot be destroyed").fire();
        }

        let _guard = self.lock.lock();
        let physical = self.physical();
        let shadow = self.shadow();
        let mut freed = 0usize;
        for i in USER_DIRECTORY_ENTRIES {
            let (Some(phys), Some(virt)) = (physical.target(i), shadow.target(i)) else {
                continue;
            };
            physical.clear_entry(i);
            shadow.clear_entry(i);
            tables.free_page_table(PageTableFrame {
                virt: virt.into(),
                phys: phys.into(),
            });
            freed += 1;
        }

        // The shadow lives in the shared kernel area, so it is still reachable.
        let shadow_phys = self.get_physical_address(self.virtual_directory);
        tables.free_page_table(PageTableFrame {
            virt: self.directory,
            phys: self.physical_directory,
        });
        match shadow_phys {
            Some(phys) => tables.free_page_table(PageTableFrame {
                virt: self.virtual_directory,
                phys,
            }),
            None => log::warn!("shadow directory at {} is not mapped", self.virtual_directory),
        }
        log::debug!(
            "destroyed address space at {}, {freed} page tables released",
            self.physical_directory
        );
    }

    #[must_use]
    pub const fn physical_directory(&self) -> PhysicalAddress {
        self.physical_directory
    }

    #[must_use]
    pub const fn directory(&self) -> VirtualAddress {
        self.directory
    }

    #[must_use]
    pub const fn virtual_directory(&self) -> VirtualAddress {
        self.virtual_directory
    }

    #[must_use]
    pub fn heap(&self) -> &H {
        &self.heap
    }

    #[must_use]
    pub const fn is_kernel_address_space(&self) -> bool {
        self.kernel_address_space
    }

    #[must_use]
    pub const fn mmu(&self) -> &'m M {
        self.mmu
    }
}

impl<M: Mmu, H> core::fmt::Debug for VirtualAddressSpace<'_, M, H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtualAddressSpace")
            .field("physical_directory", &self.physical_directory)
            .field("directory", &self.directory)
            .field("virtual_directory", &self.virtual_directory)
            .field("kernel", &self.kernel_address_space)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftMmu;
    use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use kernel_info::memory::PAGE_SIZE;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    /// Hands out pages of identity-mapped soft RAM.
    struct BumpTables<'a> {
        mmu: &'a SoftMmu,
        next: AtomicU32,
        end: u32,
        freed: AtomicUsize,
    }

    impl<'a> BumpTables<'a> {
        fn new(mmu: &'a SoftMmu, start: u32, end: u32) -> Self {
            Self {
                mmu,
                next: AtomicU32::new(start),
                end,
                freed: AtomicUsize::new(0),
            }
        }
    }

    impl PageTableAlloc for BumpTables<'_> {
        fn allocate_page_table(&self) -> Option<PageTableFrame> {
            let page = self.next.fetch_add(PAGE_SIZE, Ordering::Relaxed);
            if page >= self.end {
                return None;
            }
            unsafe { self.mmu.zero_page(VirtualAddress::new(page)) };
            Some(PageTableFrame {
                virt: VirtualAddress::new(page),
                phys: PhysicalAddress::new(page),
            })
        }

        fn free_page_table(&self, _frame: PageTableFrame) {
            self.freed.fetch_add(1, Ordering::Relaxed);
        }
    }

    const RAM: u32 = 64 * PAGE_SIZE;

    fn kernel_space<'a>(
        mmu: &'a SoftMmu,
        tables: &BumpTables<'_>,
    ) -> VirtualAddressSpace<'a, SoftMmu, ()> {
        let dir = tables.allocate_page_table().unwrap();
        let shadow = tables.allocate_page_table().unwrap();
        unsafe { VirtualAddressSpace::kernel(mmu, dir.phys, dir.virt, shadow.virt, &()) }
    }

    #[test]
    fn maps_translates_and_unmaps() {
        let mmu = SoftMmu::new(PhysicalAddress::zero(), RAM);
        let tables = BumpTables::new(&mmu, 0, 16 * PAGE_SIZE);
        let space = kernel_space(&mmu, &tables);

        let virt = VirtualAddress::new(0x0040_2000);
        let phys = PhysicalAddress::new(0x0003_0000);
        assert_eq!(space.get_physical_address(virt), None);
        assert_eq!(space.map(phys, virt, PageFlags::kernel_rw(), false, &tables), Ok(true));
        assert_eq!(
            space.get_physical_address(virt + 0x123),
            Some(PhysicalAddress::new(0x0003_0123))
        );

        assert_eq!(space.unmap(virt), Some(phys));
        assert_eq!(mmu.invalidations(), 1);
        assert_eq!(space.unmap(virt), None);
        assert_eq!(space.get_physical_address(virt), None);
        assert!(space.has_page_table(L2Index::of(virt)));
    }

    #[test]
    fn double_map_is_fatal_and_keeps_the_first_mapping() {
        let mmu = SoftMmu::new(PhysicalAddress::zero(), RAM);
        let tables = BumpTables::new(&mmu, 0, 16 * PAGE_SIZE);
        let space = kernel_space(&mmu, &tables);

        let virt = VirtualAddress::new(0x0010_0000);
        let first = PhysicalAddress::new(0x0001_0000);
        space.map(first, virt, PageFlags::kernel_rw(), false, &tables).unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = space.map(PhysicalAddress::new(0x0002_0000), virt, PageFlags::kernel_rw(), false, &tables);
        }));
        assert!(result.is_err());
        assert_eq!(space.get_physical_address(virt), Some(first));
    }

    #[test]
    fn contended_map_gives_up_when_asked_to() {
        let mmu = SoftMmu::new(PhysicalAddress::zero(), RAM);
        let tables = BumpTables::new(&mmu, 0, 16 * PAGE_SIZE);
        let space = kernel_space(&mmu, &tables);

        let virt = VirtualAddress::new(0x0020_0000);
        let guard = space.lock.lock();
        assert_eq!(
            space.map(PhysicalAddress::new(0x5000), virt, PageFlags::kernel_rw(), true, &tables),
            Ok(false)
        );
        drop(guard);
        assert_eq!(space.get_physical_address(virt), None);
        assert_eq!(
            space.map(PhysicalAddress::new(0x5000), virt, PageFlags::kernel_rw(), true, &tables),
            Ok(true)
        );
    }

    #[test]
    fn missing_page_table_is_reported() {
        let mmu = SoftMmu::new(PhysicalAddress::zero(), RAM);
        let tables = BumpTables::new(&mmu, 0, 2 * PAGE_SIZE);
        let space = kernel_space(&mmu, &tables);

        let virt = VirtualAddress::new(0x0080_0000);
        assert_eq!(
            space.map(PhysicalAddress::new(0x9000), virt, PageFlags::kernel_rw(), false, &tables),
            Err(VmmError::OutOfPagingMemory(virt))
        );
    }

    #[test]
    fn user_spaces_share_the_kernel_area_only() {
        let mmu = SoftMmu::new(PhysicalAddress::zero(), RAM);
        let tables = BumpTables::new(&mmu, 0, 32 * PAGE_SIZE);
        let kernel = kernel_space(&mmu, &tables);

        let kva = VirtualAddress::new(0x0040_0000);
        kernel.map(PhysicalAddress::new(0x7000), kva, PageFlags::kernel_rw(), false, &tables).unwrap();
        // The directory pages have to stay reachable through the kernel area.
        for page in 0..32 {
            let a = page * PAGE_SIZE;
            kernel
                .map(PhysicalAddress::new(a), VirtualAddress::new(a), PageFlags::kernel_rw(), false, &tables)
                .unwrap();
        }

        let user = VirtualAddressSpace::user(&kernel, (), &tables).unwrap();
        assert!(!user.is_kernel_address_space());
        assert_eq!(user.get_physical_address(kva), Some(PhysicalAddress::new(0x7000)));

        let uva = VirtualAddress::new(0x8000_0000);
        user.map(PhysicalAddress::new(0x8000), uva, PageFlags::kernel_rw(), false, &tables).unwrap();
        assert_eq!(user.get_physical_address(uva), Some(PhysicalAddress::new(0x8000)));
        assert_eq!(kernel.get_physical_address(uva), None);

        let pde = unsafe { PageTable::at(&mmu, user.directory()) }.get(L2Index::of(uva).as_usize());
        assert!(pde.user_accessible() && pde.writable());
        let kpde = unsafe { PageTable::at(&mmu, user.directory()) }.get(L2Index::of(kva).as_usize());
        assert!(!kpde.user_accessible());

        user.destroy(&tables);
        // One user table plus both directories.
        assert_eq!(tables.freed.load(Ordering::Relaxed), 3);
        assert_eq!(kernel.get_physical_address(kva), Some(PhysicalAddress::new(0x7000)));
    }

    #[test]
    #[should_panic(expected = "illegal state")]
    fn kernel_space_cannot_be_destroyed() {
        let mmu = SoftMmu::new(PhysicalAddress::zero(), RAM);
        let tables = BumpTables::new(&mmu, 0, 16 * PAGE_SIZE);
        kernel_space(&mmu, &tables).destroy(&tables);
    }

    #[test]
    fn installing_over_an_existing_table_is_refused() {
        let mmu = SoftMmu::new(PhysicalAddress::zero(), RAM);
        let tables = BumpTables::new(&mmu, 0, 16 * PAGE_SIZE);
        let space = kernel_space(&mmu, &tables);

        let index = L2Index::new(3);
        let frame = tables.allocate_page_table().unwrap();
        assert!(space.install_page_table(index, frame));
        let other = tables.allocate_page_table().unwrap();
        assert!(!space.install_page_table(index, other));
        let pde = unsafe { PageTable::at(&mmu, space.directory()) }.get(3);
        assert_eq!(PhysicalAddress::from(pde.address()), frame.phys);
    }
}
