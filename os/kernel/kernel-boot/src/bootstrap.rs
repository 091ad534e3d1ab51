//! # Bootstrap
//!
//! [`enter`] runs exactly once, with paging off, and leaves the kernel with
//! paging on and a [`KernelContext`]:
//!
//! 1. Find the memory limit and a bootstrap region above the kernel image.
//! 2. Build the initial mapping by hand inside that region.
//! 3. Enable paging.
//! 4. Put the kernel heap over its freshly mapped slice.
//! 5. Build the frame allocator, the paging area and the kernel address
//!    space on top of the bootstrap mapping, and reserve everything the
//!    frame allocator must never hand out.
//!
//! Any failure here is fatal; there is nothing to fall back to.

use crate::context::KernelContext;
use crate::initial_mapping::{InitialMapping, create_initial_mapping};
use crate::memory_map;
use kernel_alloc::{BlockMemoryManager, FreeListHeap, MemoryService, PageFrameAllocator, PagingAreaManager};
use kernel_info::boot::BootInfo;
use kernel_info::fault::KernelFault;
use kernel_info::memory::{
    BOOTSTRAP_REGION_SIZE, ENTRIES_PER_TABLE, INITIAL_PAGING_AREA_SIZE, KERNEL_HEAP_END, LOWER_MEMORY_END, PAGE_SIZE,
    PAGING_AREA_SIZE,
};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_sync::SyncOnceCell;
use kernel_vmem::{Mmu, PageEntry, PageTable, VirtualAddressSpace};

/// Bring up memory management.
///
/// The kernel heap is placed in `heap_slot`, which lets the kernel image use
/// the same heap as its global allocator.
///
/// # Panics
/// Fires [`KernelFault::OutOfMemory`] if there is no bootstrap region or the
/// initial mapping does not fit it, and [`KernelFault::IllegalState`] if
/// paging is already on or `heap_slot` is taken.
pub fn enter<'h, 'm: 'h, M: Mmu>(
    mmu: &'m M,
    boot: &BootInfo<'_>,
    heap_slot: &'h SyncOnceCell<FreeListHeap<'m, M>>,
) -> KernelContext<'h, M> {
    if mmu.paging_enabled() {
        KernelFault::IllegalState("bootstrap entered with paging enabled").fire();
    }

    let memory_end = memory_map::memory_end(boot.memory_map);
    let kernel_end = boot.kernel.end.align_up::<Size4K>();
    let Some(region) = kernel_end.and_then(|end| {
        memory_map::find_region(boot.memory_map, end.as_u64(), BOOTSTRAP_REGION_SIZE)
    }) else {
        KernelFault::OutOfMemory("no bootstrap region above the kernel image").fire();
    };
    log::info!("physical memory ends at {memory_end:#x}, bootstrap region at {region}");

    let mapping = match create_initial_mapping(mmu, boot.kernel, region) {
        Ok(mapping) => mapping,
        Err(e) => {
            log::error!("initial mapping failed: {e}");
            KernelFault::OutOfMemory("initial mapping does not fit the bootstrap region").fire();
        }
    };

    unsafe { enable_paging(mmu, &mapping) };
    log::info!("paging enabled");

    let heap = place_kernel_heap(mmu, &mapping, heap_slot);
    let kernel_space = kernel_address_space(mmu, &mapping, heap);
    let frames = frame_allocator(mmu, boot, &mapping, heap, memory_end);
    // The page-fault path may need an allocation table while the heap is locked.
    frames.reserve_spare_block();
    let paging_area = PagingAreaManager::new(
        mapping.layout.paging_window,
        PAGING_AREA_SIZE,
        INITIAL_PAGING_AREA_SIZE / PAGE_SIZE,
        mapping.used_pages,
    );

    let memory = MemoryService::new(mmu, frames, paging_area, kernel_space);
    let stats = memory.stats();
    log::info!(
        "memory management up: {} of {} KiB free, {} page tables pooled",
        stats.free_physical_memory / 1024,
        stats.total_physical_memory / 1024,
        stats.paging_pool_pages
    );

    KernelContext {
        memory,
        kernel_heap: heap,
        layout: mapping.layout,
        memory_end,
    }
}

/// Load the initial directory and turn paging on.
///
/// # Safety
/// `mapping` must identity map the running kernel.
pub unsafe fn enable_paging<M: Mmu>(mmu: &M, mapping: &InitialMapping) {
    unsafe {
        mmu.load_directory(mapping.directory.phys);
        mmu.enable_paging();
    }
}

/// Create the kernel heap over `[heap_start, KERNEL_HEAP_END)` in `slot`.
///
/// # Panics
/// Fires [`KernelFault::IllegalState`] if the slot already holds a heap.
pub fn place_kernel_heap<'h, 'm: 'h, M: Mmu>(
    mmu: &'m M,
    mapping: &InitialMapping,
    slot: &'h SyncOnceCell<FreeListHeap<'m, M>>,
) -> &'h FreeListHeap<'m, M> {
    let heap = FreeListHeap::new(
        mmu,
        mapping.layout.heap_start,
        VirtualAddress::new(KERNEL_HEAP_END),
    );
    match slot.set(heap) {
        Ok(heap) => heap,
        Err(_) => KernelFault::IllegalState("the kernel heap is already in place").fire(),
    }
}

/// Wrap the initial directory, with a shadow directory from the kernel heap.
///
/// # Panics
/// Fires [`KernelFault::OutOfMemory`] if the heap has no page for the shadow.
pub fn kernel_address_space<'h, M: Mmu>(
    mmu: &'h M,
    mapping: &InitialMapping,
    heap: &'h FreeListHeap<'h, M>,
) -> VirtualAddressSpace<'h, M, FreeListHeap<'h, M>> {
    let Some(shadow) = heap.allocate_block() else {
        KernelFault::OutOfMemory("no page for the kernel shadow directory").fire();
    };
    unsafe { mmu.zero_page(shadow) };

    let directory = unsafe { PageTable::at(mmu, mapping.directory.virt) };
    let shadow_table = unsafe { PageTable::at(mmu, shadow) };
    for i in 0..ENTRIES_PER_TABLE {
        let entry = directory.get(i);
        if !entry.present() {
            continue;
        }
        let Some(virt) = mapping.table_virt(entry.address().into()) else {
            KernelFault::PagingError("bootstrap page table outside of the paging area").fire();
        };
        shadow_table.set(i, PageEntry::with_address(virt.as_memory_address(), entry.flags()));
    }

    unsafe {
        VirtualAddressSpace::kernel(
            mmu,
            mapping.directory.phys,
            mapping.directory.virt,
            shadow,
            heap,
        )
    }
}

/// The frame allocator over `[0, memory_end)`, with its metadata on the
/// kernel heap and every frame in use or off limits marked.
pub fn frame_allocator<'h, M: Mmu>(
    mmu: &'h M,
    boot: &BootInfo<'_>,
    mapping: &InitialMapping,
    heap: &'h FreeListHeap<'h, M>,
    memory_end: u64,
) -> PageFrameAllocator<'h, M> {
    let Some(last) = memory_end
        .checked_sub(1)
        .and_then(|last| u32::try_from(last).ok())
    else {
        KernelFault::OutOfMemory("the memory map reports no memory").fire();
    };

    let metadata: &'h dyn BlockMemoryManager<Address = VirtualAddress> = heap;
    let frames = PageFrameAllocator::new(
        mmu,
        metadata,
        PhysicalAddress::new(0),
        PhysicalAddress::new(last),
        PAGE_SIZE,
        mapping.layout.kernel_end,
    );

    let reserve = |start: u64, end: u64| {
        // `end` is exclusive; everything at or past 4 GiB is unmanaged anyway.
        let (Ok(start), Some(last)) = (u32::try_from(start), end.checked_sub(1)) else {
            return;
        };
        let last = u32::try_from(last).unwrap_or(u32::MAX);
        if start <= last {
            log::debug!("reserving [{start:#010x}, {last:#010x}]");
            frames.set_memory(PhysicalAddress::new(start), PhysicalAddress::new(last), 0, true);
        }
    };

    reserve(0, u64::from(LOWER_MEMORY_END));
    reserve(boot.kernel.start.as_u64(), mapping.layout.kernel_end.as_u64());
    for entry in boot.memory_map.iter().filter(|e| !e.is_available()) {
        reserve(entry.address, entry.end().min(memory_end));
    }
    memory_map::for_each_hole(boot.memory_map, memory_end, reserve);

    // Frames behind the mapped slices stay referenced by their mappings.
    frames.set_memory(
        mapping.layout.region,
        mapping.layout.region + (BOOTSTRAP_REGION_SIZE - 1),
        1,
        false,
    );
    frames
}
