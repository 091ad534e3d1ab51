//! # Initial Mapping
//!
//! Before any allocator exists, the page directory and the first page tables
//! are carved by hand from the bootstrap region. Paging is still off, so the
//! region is written through its physical addresses.
//!
//! ```text
//!  bootstrap region (physical)
//!  ┌──────────┬────────┬─────┬────────┬───────────────┬────────────────────┐
//!  │ directory│ table  │ ... │ (pool) │               │ kernel heap slice  │
//!  └──────────┴────────┴─────┴────────┴───────────────┴────────────────────┘
//!  ◄────────── paging area slice ──────────────────────►◄──── 128 KiB ──────►
//!              mapped at the paging window base              mapped at the heap base
//! ```
//!
//! Every page table the 16 MiB paging window needs is installed here, so
//! that backing more of the window later never needs a page table of its own.

use crate::BootstrapError;
use kernel_info::boot::KernelImage;
use kernel_info::memory::{
    INITIAL_KERNEL_HEAP_SIZE, INITIAL_PAGING_AREA_SIZE, KERNEL_HEAP_END, PAGE_SIZE,
    PAGING_AREA_SIZE,
};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::{L1Index, L2Index, Mmu, PageEntry, PageFlags, PageTable, PageTableFrame};

/// Where the bootstrap puts things.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BootLayout {
    pub kernel: KernelImage,
    /// First page boundary past the kernel image.
    pub kernel_end: PhysicalAddress,
    /// Physical start of the bootstrap region.
    pub region: PhysicalAddress,
    pub paging_window: VirtualAddress,
    pub heap_start: VirtualAddress,
}

impl BootLayout {
    /// # Errors
    /// [`BootstrapError::Misaligned`] if `region` is not page aligned, and
    /// [`BootstrapError::KernelTooLarge`] if the windows do not fit below
    /// the heap end.
    pub fn new(kernel: KernelImage, region: PhysicalAddress) -> Result<Self, BootstrapError> {
        if !region.is_aligned::<Size4K>() {
            return Err(BootstrapError::Misaligned(region));
        }
        let kernel_end = kernel
            .end
            .align_up::<Size4K>()
            .ok_or(BootstrapError::KernelTooLarge)?;
        let paging_window = VirtualAddress::new(kernel_end.as_u32());
        let heap_start = paging_window
            .checked_add(PAGING_AREA_SIZE)
            .filter(|h| u64::from(h.as_u32()) + u64::from(INITIAL_KERNEL_HEAP_SIZE) <= u64::from(KERNEL_HEAP_END))
            .ok_or(BootstrapError::KernelTooLarge)?;

        Ok(Self {
            kernel,
            kernel_end,
            region,
            paging_window,
            heap_start,
        })
    }

    /// Physical start of the heap slice.
    #[must_use]
    pub fn heap_region(&self) -> PhysicalAddress {
        self.region + INITIAL_PAGING_AREA_SIZE
    }
}

/// Pages handed out front to back from a fixed range, zeroed.
pub struct BootstrapArena<'a, M: Mmu> {
    mmu: &'a M,
    base: PhysicalAddress,
    size: u32,
    offset: u32,
}

impl<'a, M: Mmu> BootstrapArena<'a, M> {
    #[must_use]
    pub const fn new(mmu: &'a M, base: PhysicalAddress, size: u32) -> Self {
        Self {
            mmu,
            base,
            size,
            offset: 0,
        }
    }

    /// The next page of the arena.
    ///
    /// # Errors
    /// [`BootstrapError::ArenaExhausted`] once the arena is used up.
    pub fn carve_page(&mut self) -> Result<PhysicalAddress, BootstrapError> {
        if self.offset + PAGE_SIZE > self.size {
            return Err(BootstrapError::ArenaExhausted(self.size / PAGE_SIZE));
        }
        let page = self.base + self.offset;
        self.offset += PAGE_SIZE;
        unsafe { self.mmu.zero_page(VirtualAddress::new(page.as_u32())) };
        Ok(page)
    }

    #[must_use]
    pub const fn used_pages(&self) -> u32 {
        self.offset / PAGE_SIZE
    }
}

/// The directory and page tables built before paging.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InitialMapping {
    pub layout: BootLayout,
    /// The page directory, at the paging window base.
    pub directory: PageTableFrame,
    /// Pages of the paging area slice holding the directory and the tables.
    pub used_pages: u32,
}

impl InitialMapping {
    /// Where a page table carved during bootstrap is reachable once paging is on.
    #[must_use]
    pub fn table_virt(&self, table: PhysicalAddress) -> Option<VirtualAddress> {
        let offset = table.as_u32().checked_sub(self.layout.region.as_u32())?;
        (offset < self.used_pages * PAGE_SIZE).then(|| self.layout.paging_window + offset)
    }
}

struct Mapper<'a, M: Mmu> {
    mmu: &'a M,
    arena: BootstrapArena<'a, M>,
    directory: PhysicalAddress,
}

impl<M: Mmu> Mapper<'_, M> {
    fn at(&self, table: PhysicalAddress) -> &PageTable {
        unsafe { PageTable::at(self.mmu, VirtualAddress::new(table.as_u32())) }
    }

    fn table(&mut self, index: L2Index) -> Result<PhysicalAddress, BootstrapError> {
        let entry = self.at(self.directory).get(index.as_usize());
        if entry.present() {
            return Ok(entry.address().into());
        }
        let table = self.arena.carve_page()?;
        self.at(self.directory)
            .set(index.as_usize(), PageEntry::mapping(table, PageFlags::kernel_rw()));
        Ok(table)
    }

    fn map(&mut self, virt: VirtualAddress, phys: PhysicalAddress) -> Result<(), BootstrapError> {
        let table = self.table(L2Index::of(virt))?;
        let i = L1Index::of(virt).as_usize();
        if self.at(table).get(i).present() {
            return Err(BootstrapError::AlreadyMapped(virt));
        }
        self.at(table)
            .set(i, PageEntry::mapping(phys, PageFlags::kernel_rw()));
        Ok(())
    }

    fn map_range(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: u32,
    ) -> Result<(), BootstrapError> {
        for offset in (0..size).step_by(PAGE_SIZE as usize) {
            self.map(virt + offset, phys + offset)?;
        }
        Ok(())
    }
}

/// Build the page directory for the kernel image and the first slices of the
/// paging area and the kernel heap. Paging must still be off.
///
/// # Errors
/// [`BootstrapError`] if the layout is unusable or the paging area slice
/// cannot hold all page tables.
pub fn create_initial_mapping<M: Mmu>(
    mmu: &M,
    kernel: KernelImage,
    region: PhysicalAddress,
) -> Result<InitialMapping, BootstrapError> {
    debug_assert!(!mmu.paging_enabled());
    let layout = BootLayout::new(kernel, region)?;

    let mut arena = BootstrapArena::new(mmu, region, INITIAL_PAGING_AREA_SIZE);
    let directory = arena.carve_page()?;
    let mut mapper = Mapper {
        mmu,
        arena,
        directory,
    };

    // Identity map the kernel image.
    let image = kernel.start.align_down::<Size4K>();
    mapper.map_range(
        VirtualAddress::new(image.as_u32()),
        image,
        layout.kernel_end.as_u32() - image.as_u32(),
    )?;

    mapper.map_range(layout.paging_window, region, INITIAL_PAGING_AREA_SIZE)?;
    mapper.map_range(layout.heap_start, layout.heap_region(), INITIAL_KERNEL_HEAP_SIZE)?;

    let first = L2Index::of(layout.paging_window).as_usize();
    let last = L2Index::of(layout.paging_window + (PAGING_AREA_SIZE - 1)).as_usize();
    for i in first..=last {
        #[allow(clippy::cast_possible_truncation)]
        mapper.table(L2Index::new(i as u16))?;
    }

    let used_pages = mapper.arena.used_pages();
    log::debug!(
        "initial mapping: directory at {directory}, {} page tables, paging window at {}, heap at {}",
        used_pages - 1,
        layout.paging_window,
        layout.heap_start
    );

    Ok(InitialMapping {
        layout,
        directory: PageTableFrame {
            virt: layout.paging_window,
            phys: directory,
        },
        used_pages,
    })
}
