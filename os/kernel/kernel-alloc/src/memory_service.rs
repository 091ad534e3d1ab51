//! # Memory Service
//!
//! The kernel-facing façade over the frame allocator, the paging area and
//! the address spaces. Everything outside of memory management goes through
//! here: mapping pages, device memory and contiguous frames, creating and
//! switching address spaces, and servicing page faults.
//!
//! Addresses in the kernel area are always mapped through the kernel address
//! space, whose page tables every process shares. Everything else goes to the
//! current address space.
//!
//! The kernel area gets a page table for every directory entry before the
//! first process address space is created. Process directories copy the
//! kernel entries once, so a kernel table added later would be missing
//! from them.

use crate::free_list::FreeListHeap;
use crate::page_frame::PageFrameAllocator;
use crate::paging_area::PagingAreaManager;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::fault::KernelFault;
use kernel_info::memory::{
    ISA_DMA_BOUNDARY, KERNEL_AREA, KERNEL_BASE, KERNEL_STACK_SIZE, LOWER_MEMORY_END, PAGE_SIZE, USER_AREA,
    USER_HEAP_END,
};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{
    KERNEL_DIRECTORY_ENTRIES, L2Index, Mmu, PageFaultError, PageFlags, PageTableAlloc, PageTableFrame,
    VirtualAddressSpace, VmmError,
};

/// An address space whose heap hands out virtual ranges of its own.
pub type AddressSpace<'m, M> = VirtualAddressSpace<'m, M, FreeListHeap<'m, M>>;

/// A snapshot of the memory counters.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryStatus {
    pub free_physical_memory: u64,
    pub total_physical_memory: u64,
    /// Page-table pages ready for the fault path.
    pub paging_pool_pages: usize,
    pub address_spaces: usize,
}

pub struct MemoryService<'m, M: Mmu> {
    mmu: &'m M,
    frames: PageFrameAllocator<'m, M>,
    paging_area: PagingAreaManager,
    kernel_space: Arc<AddressSpace<'m, M>>,
    /// Process address spaces.
    spaces: SpinLock<Vec<Arc<AddressSpace<'m, M>>>>,
    current: SpinLock<Arc<AddressSpace<'m, M>>>,
    /// Every kernel directory entry has a page table.
    kernel_tables_installed: AtomicBool,
}

/// Flags for a page at `va`: user accessible outside of the kernel area.
fn flags_for(va: VirtualAddress, flags: PageFlags) -> PageFlags {
    if KERNEL_AREA.contains(va.as_u32()) {
        flags
    } else {
        flags.with_user_accessible(true)
    }
}

impl<'m, M: Mmu> MemoryService<'m, M> {
    /// Take over the managers built during bootstrap. `kernel_space` is the
    /// active address space.
    #[must_use]
    pub fn new(
        mmu: &'m M,
        frames: PageFrameAllocator<'m, M>,
        paging_area: PagingAreaManager,
        kernel_space: AddressSpace<'m, M>,
    ) -> Self {
        let kernel_space = Arc::new(kernel_space);
        Self {
            mmu,
            frames,
            paging_area,
            current: SpinLock::new(kernel_space.clone()),
            kernel_space,
            spaces: SpinLock::new(Vec::new()),
            kernel_tables_installed: AtomicBool::new(false),
        }
    }

    fn try_allocate_page_table(&self) -> Option<PageTableFrame> {
        let virt = self.paging_area.allocate_block()?;
        let Some(phys) = self.kernel_space.get_physical_address(virt) else {
            log::error!("paging area page {virt} has no frame");
            KernelFault::PagingError("paging area page is not backed").fire();
        };
        unsafe { self.mmu.zero_page(virt) };
        Some(PageTableFrame { virt, phys })
    }

    /// A zeroed page for a page table or directory.
    ///
    /// # Panics
    /// Fires [`KernelFault::OutOfPagingMemory`] if the pool is empty.
    #[must_use]
    pub fn allocate_page_table(&self) -> PageTableFrame {
        self.try_allocate_page_table().unwrap_or_else(|| {
            KernelFault::OutOfPagingMemory("paging area pool is empty").fire()
        })
    }

    /// Release a page obtained from [`allocate_page_table`](Self::allocate_page_table):
    /// its frame goes back to the frame allocator, its page to the paging area.
    pub fn free_page_table(&self, table: PageTableFrame) {
        let phys = self.kernel_space.unmap(table.virt).unwrap_or(table.phys);
        self.frames.free_block(phys);
        self.paging_area.free_block(table.virt);
    }

    fn space_for(&self, va: VirtualAddress) -> Arc<AddressSpace<'m, M>> {
        if KERNEL_AREA.contains(va.as_u32()) {
            self.kernel_space.clone()
        } else {
            self.current_address_space()
        }
    }

    /// Back `count` pages from `virt` with fresh frames.
    ///
    /// Returns `Ok(false)` if `abort_if_locked` was set and the address space
    /// was busy; the pages mapped up to then stay mapped.
    ///
    /// # Errors
    /// [`VmmError::OutOfPagingMemory`] if a page table was needed and the
    /// pool is empty.
    ///
    /// # Panics
    /// Fires [`KernelFault::OutOfMemory`] if physical memory is exhausted and
    /// [`KernelFault::PagingError`] if a page is already mapped.
    pub fn map(
        &self,
        virt: VirtualAddress,
        count: u32,
        flags: PageFlags,
        abort_if_locked: bool,
    ) -> Result<bool, VmmError> {
        let virt = virt.align_down::<Size4K>();
        for page in 0..count {
            let va = virt + page * PAGE_SIZE;
            let Some(frame) = self.frames.allocate_block() else {
                KernelFault::OutOfMemory("no frame left to map").fire();
            };

            match self.space_for(va).map(frame, va, flags, abort_if_locked, self) {
                Ok(true) => {}
                Ok(false) => {
                    self.frames.free_block(frame);
                    return Ok(false);
                }
                Err(e) => {
                    self.frames.free_block(frame);
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    /// Map `count` pages from `virt` onto the frames from `phys`, replacing
    /// whatever was mapped there. The frames gain a reference.
    ///
    /// # Errors
    /// [`VmmError::OutOfPagingMemory`] if a page table was needed and the
    /// pool is empty.
    pub fn map_physical(
        &self,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        count: u32,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        let (phys, virt) = (phys.align_down::<Size4K>(), virt.align_down::<Size4K>());
        for page in 0..count {
            let (pa, va) = (phys + page * PAGE_SIZE, virt + page * PAGE_SIZE);
            self.unmap(va, 1, 0);
            self.frames.allocate_block_at_address(pa);
            if let Err(e) = self.space_for(va).map(pa, va, flags, false, self) {
                self.frames.free_block(pa);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Map `count` pages from `virt` onto frames the caller already holds a
    /// reference to, dropping whatever was mapped there.
    fn map_owned(
        &self,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        count: u32,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        for page in 0..count {
            let (pa, va) = (phys + page * PAGE_SIZE, virt + page * PAGE_SIZE);
            self.unmap(va, 1, 0);
            self.space_for(va).map(pa, va, flags, false, self)?;
        }
        Ok(())
    }

    /// Unmap `count` pages from `virt` and drop their frames.
    ///
    /// Gives up after `break_count` consecutive pages that were not mapped;
    /// `0` never gives up. Returns the last frame that was mapped.
    ///
    /// # Panics
    /// Fires [`KernelFault::InvalidArgument`] if `virt` is not page aligned.
    pub fn unmap(&self, virt: VirtualAddress, count: u32, break_count: u32) -> Option<PhysicalAddress> {
        if !virt.is_aligned::<Size4K>() {
            KernelFault::InvalidArgument("unmap of an unaligned address").fire();
        }

        let mut last = None;
        let mut misses = 0;
        for page in 0..count {
            let Some(va) = virt.checked_add(page * PAGE_SIZE) else {
                break;
            };
            if let Some(pa) = self.space_for(va).unmap(va) {
                self.frames.free_block(pa);
                last = Some(pa);
                misses = 0;
            } else {
                misses += 1;
                if break_count != 0 && misses >= break_count {
                    break;
                }
            }
        }
        last
    }

    /// Map `count` pages of device memory at `phys` uncached, into a range
    /// taken from the kernel heap or the heap of the current address space.
    ///
    /// Returns the address of `phys` in that range.
    ///
    /// # Errors
    /// [`VmmError::OutOfPagingMemory`] if a page table was needed and the
    /// pool is empty.
    ///
    /// # Panics
    /// Fires [`KernelFault::OutOfMemory`] if the heap has no such range.
    pub fn map_io(&self, phys: PhysicalAddress, count: u32, kernel_heap: bool) -> Result<VirtualAddress, VmmError> {
        let current = self.current_address_space();
        let heap = if kernel_heap {
            self.kernel_space.heap()
        } else {
            current.heap()
        };
        let Some(virt) = count
            .checked_mul(PAGE_SIZE)
            .and_then(|size| heap.allocate(size, PAGE_SIZE))
        else {
            KernelFault::OutOfMemory("no virtual range for device memory").fire();
        };

        log::debug!("mapping {count} pages of device memory at {phys} to {virt}");
        self.map_physical(phys, virt, count, flags_for(virt, PageFlags::kernel_io()))?;
        Ok(virt + phys.offset::<Size4K>())
    }

    /// Map `count` fresh, physically contiguous frames from 16 MiB up,
    /// uncached, into a range taken from the kernel heap or the heap of the
    /// current address space. For devices that need a DMA buffer.
    ///
    /// # Errors
    /// [`VmmError::OutOfPagingMemory`] if a page table was needed and the
    /// pool is empty.
    ///
    /// # Panics
    /// Fires [`KernelFault::OutOfMemory`] if there is no such run of frames
    /// or the heap has no range for it.
    pub fn map_io_contiguous(&self, count: u32, kernel_heap: bool) -> Result<VirtualAddress, VmmError> {
        let Some(phys) = self.allocate_physical_memory(count, PhysicalAddress::new(ISA_DMA_BOUNDARY)) else {
            KernelFault::OutOfMemory("no contiguous frames for device memory").fire();
        };

        let current = self.current_address_space();
        let heap = if kernel_heap {
            self.kernel_space.heap()
        } else {
            current.heap()
        };
        let Some(virt) = heap.allocate(count * PAGE_SIZE, PAGE_SIZE) else {
            self.free_physical_memory(phys, count);
            KernelFault::OutOfMemory("no virtual range for device memory").fire();
        };

        log::debug!("mapping {count} fresh frames at {phys} to {virt}");
        self.map_owned(phys, virt, count, flags_for(virt, PageFlags::kernel_io()))?;
        Ok(virt)
    }

    /// `count` contiguous pages of conventional memory below 1 MiB, mapped
    /// into the kernel heap. `None` if there is no such run.
    ///
    /// # Errors
    /// [`VmmError::OutOfPagingMemory`] if a page table was needed and the
    /// pool is empty.
    pub fn allocate_bios_memory(&self, count: u32) -> Result<Option<VirtualAddress>, VmmError> {
        self.allocate_low_memory(count, PhysicalAddress::zero(), LOWER_MEMORY_END, PageFlags::kernel_rw())
    }

    /// `count` contiguous pages the ISA DMA controller can reach (below
    /// 16 MiB), mapped uncached into the kernel heap. `None` if there is no
    /// such run.
    ///
    /// # Errors
    /// [`VmmError::OutOfPagingMemory`] if a page table was needed and the
    /// pool is empty.
    pub fn allocate_isa_memory(&self, count: u32) -> Result<Option<VirtualAddress>, VmmError> {
        self.allocate_low_memory(count, PhysicalAddress::new(KERNEL_BASE), ISA_DMA_BOUNDARY, PageFlags::kernel_io())
    }

    fn allocate_low_memory(
        &self,
        count: u32,
        start: PhysicalAddress,
        limit: u32,
        flags: PageFlags,
    ) -> Result<Option<VirtualAddress>, VmmError> {
        let Some(size) = count.checked_mul(PAGE_SIZE) else {
            return Ok(None);
        };
        let Some(phys) = self.allocate_physical_memory(count, start) else {
            return Ok(None);
        };
        if phys.as_u64() + u64::from(size) > u64::from(limit) {
            log::debug!("no {count} contiguous frames below {limit:#x}");
            self.free_physical_memory(phys, count);
            return Ok(None);
        }

        let Some(virt) = self.kernel_space.heap().allocate(size, PAGE_SIZE) else {
            self.free_physical_memory(phys, count);
            return Ok(None);
        };
        self.map_owned(phys, virt, count, flags)?;
        Ok(Some(virt))
    }

    /// `count` physically contiguous frames at or above `start`, or `None`.
    pub fn allocate_physical_memory(&self, count: u32, start: PhysicalAddress) -> Option<PhysicalAddress> {
        if count == 0 {
            return None;
        }

        let mut search = start;
        'search: loop {
            let first = self.frames.allocate_block_after_address(search)?;
            for page in 1..count {
                let want = first.checked_add(page * PAGE_SIZE);
                let got = want.and_then(|want| self.frames.allocate_block_after_address(want));
                if got.is_some() && got == want {
                    continue;
                }

                // Not contiguous; roll back and search past the gap.
                if let Some(got) = got {
                    self.frames.free_block(got);
                }
                for taken in 0..page {
                    self.frames.free_block(first + taken * PAGE_SIZE);
                }
                search = want?.checked_add(PAGE_SIZE)?;
                continue 'search;
            }
            return Some(first);
        }
    }

    /// Give back frames from [`allocate_physical_memory`](Self::allocate_physical_memory).
    pub fn free_physical_memory(&self, address: PhysicalAddress, count: u32) {
        for page in 0..count {
            self.frames.free_block(address + page * PAGE_SIZE);
        }
    }

    /// `size` bytes at `align` from the kernel heap.
    #[must_use]
    pub fn allocate_kernel_memory(&self, size: u32, align: u32) -> Option<VirtualAddress> {
        self.kernel_space.heap().allocate(size, align)
    }

    /// Move a kernel allocation to one of `new_size` bytes, keeping its
    /// contents. `None` leaves the old allocation in place.
    #[must_use]
    pub fn reallocate_kernel_memory(
        &self,
        address: VirtualAddress,
        old_size: u32,
        new_size: u32,
        align: u32,
    ) -> Option<VirtualAddress> {
        self.reallocate_in(self.kernel_space.heap(), address, old_size, new_size, align)
    }

    /// Give back memory from [`allocate_kernel_memory`](Self::allocate_kernel_memory).
    pub fn free_kernel_memory(&self, address: VirtualAddress, size: u32, align: u32) {
        self.kernel_space.heap().free(address, size, align);
    }

    /// `size` bytes at `align` from the heap of the current address space.
    #[must_use]
    pub fn allocate_user_memory(&self, size: u32, align: u32) -> Option<VirtualAddress> {
        self.current_address_space().heap().allocate(size, align)
    }

    /// [`reallocate_kernel_memory`](Self::reallocate_kernel_memory) for the
    /// heap of the current address space.
    #[must_use]
    pub fn reallocate_user_memory(
        &self,
        address: VirtualAddress,
        old_size: u32,
        new_size: u32,
        align: u32,
    ) -> Option<VirtualAddress> {
        let current = self.current_address_space();
        self.reallocate_in(current.heap(), address, old_size, new_size, align)
    }

    /// Give back memory from [`allocate_user_memory`](Self::allocate_user_memory).
    pub fn free_user_memory(&self, address: VirtualAddress, size: u32, align: u32) {
        self.current_address_space().heap().free(address, size, align);
    }

    fn reallocate_in(
        &self,
        heap: &FreeListHeap<'m, M>,
        address: VirtualAddress,
        old_size: u32,
        new_size: u32,
        align: u32,
    ) -> Option<VirtualAddress> {
        let moved = heap.allocate(new_size, align)?;
        self.copy(address, moved, old_size.min(new_size));
        heap.free(address, old_size, align);
        Some(moved)
    }

    /// Copy `len` bytes between mapped ranges, a page piece at a time.
    fn copy(&self, from: VirtualAddress, to: VirtualAddress, len: u32) {
        let mut done = 0;
        while done < len {
            let (src, dst) = (from + done, to + done);
            let chunk = (len - done)
                .min(PAGE_SIZE - src.offset::<Size4K>())
                .min(PAGE_SIZE - dst.offset::<Size4K>());
            // SAFETY: both ranges are live heap allocations of at least `len`
            // bytes; the heap never hands out overlapping ranges.
            unsafe {
                ptr::copy_nonoverlapping(
                    self.mmu.virt_to_ptr::<u8>(src),
                    self.mmu.virt_to_ptr::<u8>(dst),
                    chunk as usize,
                );
            }
            done += chunk;
        }
    }

    /// A page-aligned kernel stack of [`KERNEL_STACK_SIZE`] bytes, every
    /// page backed. Returns its lowest address; the stack grows down from
    /// `base + KERNEL_STACK_SIZE`.
    ///
    /// # Errors
    /// [`VmmError::OutOfPagingMemory`] if a page table was needed and the
    /// pool is empty.
    ///
    /// # Panics
    /// Fires [`KernelFault::OutOfMemory`] if the kernel heap is exhausted.
    pub fn allocate_kernel_stack(&self) -> Result<VirtualAddress, VmmError> {
        let Some(base) = self.kernel_space.heap().allocate(KERNEL_STACK_SIZE, PAGE_SIZE) else {
            KernelFault::OutOfMemory("no room for a kernel stack").fire();
        };

        // A fault on a kernel stack cannot be serviced on that stack.
        for page in 0..KERNEL_STACK_SIZE / PAGE_SIZE {
            let va = base + page * PAGE_SIZE;
            if self.kernel_space.get_physical_address(va).is_none() {
                self.map(va, 1, PageFlags::kernel_rw(), false)?;
            }
        }
        log::debug!("kernel stack at {base}");
        Ok(base)
    }

    /// Give back a stack from [`allocate_kernel_stack`](Self::allocate_kernel_stack).
    ///
    /// The pages stay mapped; the heap keeps its bookkeeping in them.
    pub fn free_kernel_stack(&self, base: VirtualAddress) {
        self.kernel_space.heap().free(base, KERNEL_STACK_SIZE, PAGE_SIZE);
    }

    /// Translation of `va` in the current address space.
    #[must_use]
    pub fn get_physical_address(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.current_address_space().get_physical_address(va)
    }

    /// A new process address space with an empty user area.
    ///
    /// The first call gives the kernel area all of its page tables, see
    /// [`install_kernel_page_tables`](Self::install_kernel_page_tables).
    ///
    /// # Errors
    /// [`VmmError::NoDirectory`] if the paging area cannot supply the directory.
    pub fn create_address_space(&self) -> Result<Arc<AddressSpace<'m, M>>, VmmError> {
        if !self.kernel_tables_installed.load(Ordering::Acquire) {
            self.install_kernel_page_tables();
        }
        // Directory and shadow.
        if self.paging_area.pool_len() < 2 {
            self.refill_paging_area();
        }

        let heap = FreeListHeap::new(
            self.mmu,
            VirtualAddress::new(USER_AREA.start),
            VirtualAddress::new(USER_HEAP_END),
        );
        let space = Arc::new(VirtualAddressSpace::user(&self.kernel_space, heap, self)?);
        self.spaces.lock().push(space.clone());
        log::debug!("created address space at {}", space.physical_directory());
        Ok(space)
    }

    /// Activate `space` on the executing CPU.
    pub fn switch_address_space(&self, space: &Arc<AddressSpace<'m, M>>) {
        let mut current = self.current.lock();
        if Arc::ptr_eq(&current, space) {
            return;
        }
        unsafe { space.activate() };
        *current = space.clone();
    }

    /// Release a process address space and its page tables.
    ///
    /// Frames still mapped in its user area are not freed; unmap them first.
    ///
    /// # Panics
    /// Fires [`KernelFault::IllegalState`] for the kernel or the current
    /// address space, or one still referenced elsewhere.
    pub fn destroy_address_space(&self, space: Arc<AddressSpace<'m, M>>) {
        if Arc::ptr_eq(&space, &self.kernel_space) {
            KernelFault::IllegalState("the kernel address space cannot be destroyed").fire();
        }
        if Arc::ptr_eq(&space, &self.current.lock()) {
            KernelFault::IllegalState("the current address space cannot be destroyed").fire();
        }

        self.spaces.lock().retain(|s| !Arc::ptr_eq(s, &space));
        match Arc::try_unwrap(space) {
            Ok(space) => space.destroy(self),
            Err(_) => KernelFault::IllegalState("address space is still in use").fire(),
        }
    }

    /// Back the page containing `va` with a fresh frame.
    ///
    /// A page that is already mapped only has its stale TLB entry dropped.
    /// Never waits for the address-space lock; returns `Ok(false)` if it
    /// is held.
    ///
    /// # Errors
    /// [`VmmError::OutOfPagingMemory`] if a page table was needed and the
    /// pool is empty.
    ///
    /// # Panics
    /// Fires [`KernelFault::NullPointer`] for an access to the first page,
    /// and [`KernelFault::PagingError`] for a protection violation or a user
    /// access to the kernel area.
    pub fn handle_page_fault(&self, va: VirtualAddress, error: PageFaultError) -> Result<bool, VmmError> {
        let page = va.align_down::<Size4K>();
        log::trace!("page fault at {va} ({:#x})", error.into_bits());

        if page.as_u32() == 0 {
            KernelFault::NullPointer("page fault in the first page").fire();
        }
        if error.protection_violation() || (error.user() && KERNEL_AREA.contains(page.as_u32())) {
            log::error!("access to {va} denied ({:#x})", error.into_bits());
            KernelFault::PagingError("privilege level not sufficient").fire();
        }

        if self.space_for(page).get_physical_address(page).is_some() {
            self.mmu.invalidate_page(page);
            return Ok(true);
        }
        self.map(page, 1, flags_for(page, PageFlags::kernel_rw()), true)
    }

    /// Top up the paging-area pool, backing each new page with a frame.
    /// Returns the number of pages added.
    pub fn refill_paging_area(&self) -> usize {
        self.frames.reserve_spare_block();
        self.paging_area.refill_pool_with(|page| {
            let Some(frame) = self.frames.allocate_block() else {
                log::warn!("no frame left to back the paging area");
                return false;
            };
            match self
                .kernel_space
                .map(frame, page, PageFlags::kernel_rw(), false, self)
            {
                Ok(_) => true,
                Err(e) => {
                    log::warn!("cannot back paging area page {page}: {e}");
                    self.frames.free_block(frame);
                    false
                }
            }
        })
    }

    /// Give the kernel area a page table for every directory entry, so
    /// address spaces created later share all of them. Idempotent.
    ///
    /// # Panics
    /// Fires [`KernelFault::OutOfPagingMemory`] if the pool cannot be refilled.
    pub fn install_kernel_page_tables(&self) {
        let mut installed = 0;
        for i in KERNEL_DIRECTORY_ENTRIES {
            #[allow(clippy::cast_possible_truncation)]
            let index = L2Index::new(i as u16);
            if self.kernel_space.has_page_table(index) {
                continue;
            }
            if self.paging_area.pool_len() == 0 {
                self.refill_paging_area();
            }

            let table = self.allocate_page_table();
            if self.kernel_space.install_page_table(index, table) {
                installed += 1;
            } else {
                self.free_page_table(table);
            }
        }
        self.kernel_tables_installed.store(true, Ordering::Release);
        log::info!("installed {installed} kernel page tables");
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStatus {
        MemoryStatus {
            free_physical_memory: self.frames.free_memory(),
            total_physical_memory: self.frames.total_memory(),
            paging_pool_pages: self.paging_area.pool_len(),
            address_spaces: self.spaces.lock().len() + 1,
        }
    }

    #[must_use]
    pub fn current_address_space(&self) -> Arc<AddressSpace<'m, M>> {
        self.current.lock().clone()
    }

    #[must_use]
    pub const fn kernel_address_space(&self) -> &Arc<AddressSpace<'m, M>> {
        &self.kernel_space
    }

    #[must_use]
    pub const fn frames(&self) -> &PageFrameAllocator<'m, M> {
        &self.frames
    }

    #[must_use]
    pub const fn paging_area(&self) -> &PagingAreaManager {
        &self.paging_area
    }

    #[must_use]
    pub const fn mmu(&self) -> &'m M {
        self.mmu
    }
}

impl<M: Mmu> PageTableAlloc for MemoryService<'_, M> {
    fn allocate_page_table(&self) -> Option<PageTableFrame> {
        self.try_allocate_page_table()
    }

    fn free_page_table(&self, frame: PageTableFrame) {
        Self::free_page_table(self, frame);
    }
}
