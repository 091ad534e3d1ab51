use kernel_alloc::FreeListHeap;
use kernel_boot::{KernelContext, create_initial_mapping, enable_paging, enter};
use kernel_info::boot::{BootInfo, KernelImage, MemoryKind, MemoryMapEntry};
use kernel_info::memory::{
    BOOTSTRAP_REGION_SIZE, INITIAL_KERNEL_HEAP_SIZE, INITIAL_PAGING_AREA_SIZE, ISA_DMA_BOUNDARY, KERNEL_AREA,
    KERNEL_STACK_SIZE, PAGE_SIZE, PAGING_AREA_POOL_CAPACITY, USER_AREA,
};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::SyncOnceCell;
use kernel_vmem::soft::SoftMmu;
use kernel_vmem::{L1Index, L2Index, Mmu, PageEntry, PageFaultError, PageFlags, VmmError};
use std::sync::Arc;

const MIB: u32 = 1024 * 1024;
const RAM: u32 = 64 * MIB;

fn memory_map() -> [MemoryMapEntry; 1] {
    [MemoryMapEntry::new(
        u64::from(2 * MIB),
        u64::from(62 * MIB),
        MemoryKind::Available,
    )]
}

fn kernel() -> KernelImage {
    KernelImage {
        start: PhysicalAddress::new(MIB),
        end: PhysicalAddress::new(MIB + MIB / 2),
    }
}

fn ram() -> SoftMmu {
    SoftMmu::new(PhysicalAddress::new(0), RAM)
}

fn boot<'h, 'm: 'h>(
    mmu: &'m SoftMmu,
    map: &[MemoryMapEntry],
    slot: &'h SyncOnceCell<FreeListHeap<'m, SoftMmu>>,
) -> KernelContext<'h, SoftMmu> {
    let info = BootInfo {
        memory_map: map,
        kernel: kernel(),
    };
    enter(mmu, &info, slot)
}

/// The page-table entry behind `va` in the loaded directory.
fn leaf(mmu: &SoftMmu, va: VirtualAddress) -> PageEntry {
    let read = |table: PhysicalAddress, index: usize| unsafe {
        PageEntry::from_bits(mmu.phys_ptr(table + u32::try_from(index * 4).unwrap()).cast::<u32>().read())
    };
    let pde = read(mmu.directory(), L2Index::of(va).as_usize());
    assert!(pde.present(), "{va} has no page table");
    read(pde.address().into(), L1Index::of(va).as_usize())
}

#[test]
fn initial_mapping_identity_maps_the_kernel() {
    let mmu = ram();
    let map = memory_map();
    let region = kernel_boot::memory_map::find_region(&map, 0x18_0000, BOOTSTRAP_REGION_SIZE).unwrap();
    assert!(region.as_u32() >= 2 * MIB);
    assert!(region.as_u32() + BOOTSTRAP_REGION_SIZE <= RAM);

    let mapping = create_initial_mapping(&mmu, kernel(), region).unwrap();
    unsafe { enable_paging(&mmu, &mapping) };
    assert!(mmu.paging_enabled());

    for page in (MIB..MIB + MIB / 2).step_by(PAGE_SIZE as usize) {
        assert_eq!(
            mmu.walk(VirtualAddress::new(page)),
            Some(PhysicalAddress::new(page))
        );
    }
    assert_eq!(mmu.walk(VirtualAddress::new(MIB - PAGE_SIZE)), None);

    let layout = mapping.layout;
    assert_eq!(mmu.walk(layout.paging_window), Some(region));
    assert_eq!(
        mmu.walk(layout.heap_start),
        Some(region + INITIAL_PAGING_AREA_SIZE)
    );
    // Only the first slice of the paging window is backed.
    assert_eq!(
        mmu.walk(layout.paging_window + INITIAL_PAGING_AREA_SIZE),
        None
    );
}

#[test]
fn enter_builds_the_managers_on_the_bootstrap_mapping() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);

    assert!(mmu.paging_enabled());
    assert_eq!(ctx.memory_end, u64::from(RAM));
    assert_eq!(ctx.layout.region, PhysicalAddress::new(2 * MIB));
    assert_eq!(mmu.directory(), ctx.memory.kernel_address_space().physical_directory());

    // One directory and five tables leave two pooled pages.
    let stats = ctx.memory.stats();
    assert_eq!(stats.paging_pool_pages, 2);
    assert_eq!(stats.address_spaces, 1);

    // [0, 2 MiB) is reserved, the bootstrap region is in use.
    let reserved = 2 * MIB / PAGE_SIZE;
    let bootstrap = BOOTSTRAP_REGION_SIZE / PAGE_SIZE;
    assert_eq!(stats.total_physical_memory, u64::from(RAM));
    assert_eq!(
        stats.free_physical_memory,
        u64::from((RAM / PAGE_SIZE - reserved - bootstrap) * PAGE_SIZE)
    );
    let frames = ctx.memory.frames();
    assert!(frames.block_state(PhysicalAddress::new(0x000B_8000)).unwrap().is_reserved());
    assert!(frames.block_state(PhysicalAddress::new(MIB)).unwrap().is_reserved());
    assert_eq!(
        frames.block_state(PhysicalAddress::new(2 * MIB)).unwrap().use_count(),
        1
    );

    // Shadow directory, frame reference table, one allocation table and the
    // spare for the fault path.
    assert_eq!(
        ctx.kernel_heap.free_memory(),
        ctx.kernel_heap.total_memory() - 4 * u64::from(PAGE_SIZE)
    );
    assert!(frames.has_spare_block());
}

#[test]
#[should_panic(expected = "illegal state")]
fn the_heap_slot_can_only_be_filled_once() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let _ = slot.set(FreeListHeap::new(
        &mmu,
        VirtualAddress::new(0x0100_0000),
        VirtualAddress::new(0x0200_0000),
    ));
    let _ctx = boot(&mmu, &map, &slot);
}

#[test]
#[should_panic(expected = "out of memory")]
fn no_region_above_the_kernel_is_fatal() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = [MemoryMapEntry::new(0, u64::from(MIB), MemoryKind::Available)];
    let _ctx = boot(&mmu, &map, &slot);
}

#[test]
fn mapped_pages_are_backed_by_fresh_frames() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;
    let free = memory.stats().free_physical_memory;

    // 32 MiB has no page table yet; the pool supplies one.
    let virt = VirtualAddress::new(32 * MIB);
    assert_eq!(memory.map(virt, 4, PageFlags::kernel_rw(), false), Ok(true));
    assert_eq!(memory.stats().paging_pool_pages, 1);

    for page in 0..4 {
        let frame = memory.get_physical_address(virt + page * PAGE_SIZE).unwrap();
        assert!(frame.as_u32() >= 16 * MIB, "{frame}");
    }
    unsafe { mmu.virt_to_ptr::<u32>(virt + 3 * PAGE_SIZE).write(0xC0FF_EE00) };
    assert_eq!(memory.stats().free_physical_memory, free - 4 * u64::from(PAGE_SIZE));

    let last = mmu.walk(virt + 3 * PAGE_SIZE);
    assert_eq!(memory.unmap(virt, 4, 0), last);
    assert_eq!(mmu.walk(virt + 3 * PAGE_SIZE), None);
    assert_eq!(memory.get_physical_address(virt), None);
    assert_eq!(memory.stats().free_physical_memory, free);
    assert_eq!(memory.unmap(virt, 4, 0), None);
}

#[test]
#[should_panic(expected = "page is already mapped")]
fn mapping_a_page_twice_is_fatal() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let virt = VirtualAddress::new(ctx.layout.heap_start.as_u32() + 4 * MIB);
    let flags = PageFlags::kernel_rw();
    ctx.memory.map(virt, 1, flags, false).unwrap();
    let _ = ctx.memory.map(virt, 1, flags, false);
}

#[test]
fn unmap_gives_up_after_a_run_of_holes() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;
    let flags = PageFlags::kernel_rw();

    let virt = VirtualAddress::new(ctx.layout.heap_start.as_u32() + MIB);
    memory.map(virt, 1, flags, false).unwrap();
    memory.map(virt + 4 * PAGE_SIZE, 1, flags, false).unwrap();
    let second = memory.get_physical_address(virt + 4 * PAGE_SIZE);

    // Three holes in a row stop the walk before the second page.
    assert!(memory.unmap(virt, 8, 3).is_some());
    assert_eq!(memory.get_physical_address(virt + 4 * PAGE_SIZE), second);
    assert_eq!(memory.unmap(virt, 8, 0), second);
}

#[test]
#[should_panic(expected = "invalid argument")]
fn unaligned_unmap_is_fatal() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    ctx.memory.unmap(VirtualAddress::new(32 * MIB + 8), 1, 0);
}

#[test]
fn refilled_pool_pages_are_backed() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;

    assert_eq!(memory.refill_paging_area(), PAGING_AREA_POOL_CAPACITY - 2);
    assert_eq!(memory.stats().paging_pool_pages, PAGING_AREA_POOL_CAPACITY);

    let table = memory.allocate_page_table();
    assert!(memory.paging_area().contains(table.virt));
    assert_eq!(memory.get_physical_address(table.virt), Some(table.phys));
    assert_eq!(
        memory.frames().block_state(table.phys).unwrap().use_count(),
        1
    );

    memory.free_page_table(table);
    assert_eq!(memory.get_physical_address(table.virt), None);
    assert_eq!(
        memory.frames().block_state(table.phys).unwrap().use_count(),
        0
    );
}

#[test]
#[should_panic(expected = "out of paging memory")]
fn an_empty_pool_is_fatal_for_page_table_allocation() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    for _ in 0..3 {
        let _ = ctx.memory.allocate_page_table();
    }
}

#[test]
fn a_missing_page_table_with_an_empty_pool_is_reported() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;
    let _a = memory.allocate_page_table();
    let _b = memory.allocate_page_table();
    let free = memory.stats().free_physical_memory;

    let virt = VirtualAddress::new(40 * MIB);
    assert_eq!(
        memory.map(virt, 1, PageFlags::kernel_rw(), false),
        Err(VmmError::OutOfPagingMemory(virt))
    );
    assert_eq!(memory.stats().free_physical_memory, free);
}

#[test]
fn device_memory_is_mapped_uncached_into_the_kernel_heap() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;

    let apic = PhysicalAddress::new(0xFEE0_0020);
    let virt = memory.map_io(apic, 1, true).unwrap();
    assert!(virt >= ctx.kernel_heap.start() && virt < ctx.kernel_heap.end());
    assert_eq!(virt.as_u32() & 0xFFF, 0x20);
    assert_eq!(memory.get_physical_address(virt), Some(apic));
}

#[test]
fn mapped_frames_keep_their_reference() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;

    let frame = PhysicalAddress::new(48 * MIB);
    let virt = VirtualAddress::new(ctx.layout.heap_start.as_u32() + 2 * MIB);
    memory
        .map_physical(frame, virt, 2, PageFlags::kernel_rw())
        .unwrap();
    assert_eq!(memory.get_physical_address(virt + PAGE_SIZE), Some(frame + PAGE_SIZE));
    assert_eq!(memory.frames().block_state(frame).unwrap().use_count(), 1);

    // Remapping replaces the stale mapping and releases its frame.
    let other = PhysicalAddress::new(50 * MIB);
    memory
        .map_physical(other, virt, 1, PageFlags::kernel_rw())
        .unwrap();
    assert_eq!(memory.get_physical_address(virt), Some(other));
    assert_eq!(memory.frames().block_state(frame).unwrap().use_count(), 0);
}

#[test]
fn contiguous_frames_skip_over_gaps() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;
    let frames = memory.frames();

    let _ = frames.allocate_block_at_address(PhysicalAddress::new(16 * MIB + PAGE_SIZE));
    let run = memory
        .allocate_physical_memory(4, PhysicalAddress::new(16 * MIB))
        .unwrap();
    assert_eq!(run, PhysicalAddress::new(16 * MIB + 2 * PAGE_SIZE));
    for page in 0..4 {
        assert_eq!(frames.block_state(run + page * PAGE_SIZE).unwrap().use_count(), 1);
    }
    assert_eq!(
        frames.block_state(PhysicalAddress::new(16 * MIB)).unwrap().use_count(),
        0
    );

    memory.free_physical_memory(run, 4);
    assert_eq!(frames.block_state(run).unwrap().use_count(), 0);
    assert_eq!(memory.allocate_physical_memory(4, PhysicalAddress::new(RAM)), None);
}

#[test]
fn page_faults_are_served_from_the_pool_and_the_frame_allocator() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;

    // Past the heap slice, in a directory entry without a page table.
    let fault = VirtualAddress::new(ctx.layout.heap_start.as_u32() + 3 * MIB + 0x1234);
    let pool = memory.stats().paging_pool_pages;
    assert_eq!(memory.handle_page_fault(fault, PageFaultError::missing_page()), Ok(true));
    let frame = memory.get_physical_address(fault).unwrap();
    assert_eq!(frame.as_u32() & 0xFFF, 0x234);
    assert_eq!(memory.stats().paging_pool_pages, pool - 1);
}

#[test]
fn address_spaces_share_the_kernel_area() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;
    memory.refill_paging_area();

    let kernel_page = VirtualAddress::new(ctx.layout.heap_start.as_u32() + MIB);
    memory
        .map(kernel_page, 1, PageFlags::kernel_rw(), false)
        .unwrap();

    let space = memory.create_address_space().unwrap();
    assert_eq!(memory.stats().address_spaces, 2);
    assert_eq!(
        space.get_physical_address(kernel_page),
        memory.get_physical_address(kernel_page)
    );

    memory.switch_address_space(&space);
    assert_eq!(mmu.directory(), space.physical_directory());
    assert!(Arc::ptr_eq(&memory.current_address_space(), &space));

    // Process memory stays private.
    let user_page = VirtualAddress::new(KERNEL_AREA.end + 1);
    memory
        .map(user_page, 2, PageFlags::kernel_rw().with_user_accessible(true), false)
        .unwrap();
    assert!(memory.get_physical_address(user_page).is_some());
    assert_eq!(
        memory.kernel_address_space().get_physical_address(user_page),
        None
    );

    // Device memory from the process heap lands in the user area.
    let io = memory
        .map_io(PhysicalAddress::new(0xFEC0_0000), 1, false)
        .unwrap();
    assert_eq!(io, user_page);
    assert_eq!(memory.get_physical_address(io), Some(PhysicalAddress::new(0xFEC0_0000)));

    memory.unmap(user_page, 2, 0);
    let kernel_space = memory.kernel_address_space().clone();
    memory.switch_address_space(&kernel_space);
    let pool = memory.stats().paging_pool_pages;
    memory.destroy_address_space(space);
    assert_eq!(memory.stats().address_spaces, 1);
    // Directory, shadow and the user page table go back to the window, not
    // the pool.
    assert_eq!(memory.stats().paging_pool_pages, pool);
    assert_eq!(mmu.directory(), kernel_space.physical_directory());
}

#[test]
#[should_panic(expected = "illegal state")]
fn the_current_address_space_cannot_be_destroyed() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;

    let space = memory.create_address_space().unwrap();
    memory.switch_address_space(&space);
    memory.destroy_address_space(space);
}

#[test]
#[should_panic(expected = "illegal state")]
fn the_kernel_address_space_cannot_be_destroyed() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let kernel_space = ctx.memory.kernel_address_space().clone();
    ctx.memory.destroy_address_space(kernel_space);
}

#[test]
fn kernel_page_tables_cover_the_whole_kernel_area() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;

    memory.install_kernel_page_tables();
    let kernel_space = memory.kernel_address_space();
    for i in kernel_vmem::KERNEL_DIRECTORY_ENTRIES {
        let index = L2Index::new(u16::try_from(i).unwrap());
        assert!(kernel_space.has_page_table(index), "{i}");
    }

    let space = memory.create_address_space().unwrap();
    let late = VirtualAddress::new(KERNEL_AREA.end + 1 - PAGE_SIZE);
    memory
        .map(late, 1, PageFlags::kernel_rw(), false)
        .unwrap();
    assert_eq!(
        space.get_physical_address(late),
        memory.get_physical_address(late)
    );
}

#[test]
fn process_spaces_see_kernel_mappings_made_after_their_creation() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;

    let space = memory.create_address_space().unwrap();
    memory.switch_address_space(&space);

    // 8 MiB into the heap, in a directory entry without a page table at boot.
    let grown = VirtualAddress::new(ctx.layout.heap_start.as_u32() + 8 * MIB);
    memory
        .map(grown, 1, PageFlags::kernel_rw(), false)
        .unwrap();
    let frame = memory.kernel_address_space().get_physical_address(grown);
    assert!(frame.is_some());
    assert_eq!(space.get_physical_address(grown), frame);
    assert_eq!(mmu.walk(grown), frame);
    unsafe { mmu.virt_to_ptr::<u32>(grown).write(0x5EED) };

    // A fault on it can only come from a stale TLB entry.
    let invalidations = mmu.invalidations();
    assert_eq!(
        memory.handle_page_fault(grown + 8, PageFaultError::missing_page()),
        Ok(true)
    );
    assert_eq!(mmu.invalidations(), invalidations + 1);
    assert_eq!(memory.get_physical_address(grown), frame);
    assert_eq!(unsafe { mmu.virt_to_ptr::<u32>(grown).read() }, 0x5EED);
}

#[test]
#[should_panic(expected = "null pointer access")]
fn a_fault_in_the_first_page_is_a_null_pointer_access() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let _ = ctx
        .memory
        .handle_page_fault(VirtualAddress::new(0x10), PageFaultError::missing_page());
}

#[test]
#[should_panic(expected = "privilege level not sufficient")]
fn a_protection_violation_is_fatal() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let error = PageFaultError::new()
        .with_protection_violation(true)
        .with_write(true);
    let _ = ctx.memory.handle_page_fault(ctx.layout.heap_start, error);
}

#[test]
#[should_panic(expected = "privilege level not sufficient")]
fn user_faults_in_the_kernel_area_are_fatal() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let virt = VirtualAddress::new(ctx.layout.heap_start.as_u32() + 3 * MIB);
    let _ = ctx
        .memory
        .handle_page_fault(virt, PageFaultError::new().with_user(true));
}

#[test]
fn bios_memory_comes_from_below_one_mebibyte() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;
    let frames = memory.frames();

    // All of low memory is reserved at boot.
    let free = memory.stats().free_physical_memory;
    assert_eq!(memory.allocate_bios_memory(2), Ok(None));
    assert_eq!(memory.stats().free_physical_memory, free);

    // Conventional memory handed back for real-mode buffers.
    frames.set_memory(PhysicalAddress::new(0x1000), PhysicalAddress::new(0x9_FFFF), 0, false);
    let virt = memory.allocate_bios_memory(2).unwrap().unwrap();
    assert!(virt >= ctx.kernel_heap.start() && virt < ctx.kernel_heap.end());
    for page in 0..2 {
        let frame = PhysicalAddress::new(0x1000 + page * PAGE_SIZE);
        assert_eq!(memory.get_physical_address(virt + page * PAGE_SIZE), Some(frame));
        assert_eq!(frames.block_state(frame).unwrap().use_count(), 1);
    }
    assert!(!leaf(&mmu, virt).cache_disable());

    unsafe { mmu.virt_to_ptr::<u32>(virt + PAGE_SIZE).write(0xB105) };
    let low = mmu.phys_ptr(PhysicalAddress::new(0x2000)).cast::<u32>();
    assert_eq!(unsafe { low.read() }, 0xB105);
}

#[test]
fn isa_memory_is_uncached_and_below_sixteen_mebibytes() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;

    let virt = memory.allocate_isa_memory(4).unwrap().unwrap();
    // The first free frame above the kernel is right behind the bootstrap region.
    let first = PhysicalAddress::new(2 * MIB + BOOTSTRAP_REGION_SIZE);
    for page in 0..4 {
        let va = virt + page * PAGE_SIZE;
        assert_eq!(memory.get_physical_address(va), Some(first + page * PAGE_SIZE));
        assert_eq!(
            memory.frames().block_state(first + page * PAGE_SIZE).unwrap().use_count(),
            1
        );
        assert!(leaf(&mmu, va).cache_disable());
    }

    // A run that would cross the DMA boundary is given back.
    let free = memory.stats().free_physical_memory;
    assert_eq!(memory.allocate_isa_memory(ISA_DMA_BOUNDARY / PAGE_SIZE), Ok(None));
    assert_eq!(memory.stats().free_physical_memory, free);
}

#[test]
fn contiguous_device_memory_gets_fresh_frames() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;

    let virt = memory.map_io_contiguous(4, true).unwrap();
    assert!(virt >= ctx.kernel_heap.start() && virt < ctx.kernel_heap.end());
    let first = memory.get_physical_address(virt).unwrap();
    assert!(first.as_u32() >= 16 * MIB, "{first}");
    for page in 0..4 {
        let va = virt + page * PAGE_SIZE;
        assert_eq!(memory.get_physical_address(va), Some(first + page * PAGE_SIZE));
        // Owned by the mapping alone.
        assert_eq!(
            memory.frames().block_state(first + page * PAGE_SIZE).unwrap().use_count(),
            1
        );
        assert!(leaf(&mmu, va).cache_disable());
    }

    memory.unmap(virt, 4, 0);
    assert_eq!(memory.frames().block_state(first).unwrap().use_count(), 0);
}

#[test]
fn kernel_memory_keeps_its_contents_when_reallocated() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;
    let before = ctx.kernel_heap.free_memory();

    let old = memory.allocate_kernel_memory(2 * PAGE_SIZE, 8).unwrap();
    unsafe {
        mmu.virt_to_ptr::<u32>(old).write(0x0BAD_CAFE);
        mmu.virt_to_ptr::<u32>(old + PAGE_SIZE + 4).write(0x600D_F00D);
    }

    let new = memory
        .reallocate_kernel_memory(old, 2 * PAGE_SIZE, 3 * PAGE_SIZE, 8)
        .unwrap();
    assert_ne!(new, old);
    assert_eq!(unsafe { mmu.virt_to_ptr::<u32>(new).read() }, 0x0BAD_CAFE);
    assert_eq!(
        unsafe { mmu.virt_to_ptr::<u32>(new + PAGE_SIZE + 4).read() },
        0x600D_F00D
    );
    assert_eq!(ctx.kernel_heap.free_memory(), before - u64::from(3 * PAGE_SIZE));

    memory.free_kernel_memory(new, 3 * PAGE_SIZE, 8);
    assert_eq!(ctx.kernel_heap.free_memory(), before);
}

#[test]
fn user_memory_comes_from_the_current_address_space() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;
    let space = memory.create_address_space().unwrap();
    memory.switch_address_space(&space);
    memory.refill_paging_area();

    // The process touches its heap before anything is mapped there.
    let start = VirtualAddress::new(USER_AREA.start);
    let error = PageFaultError::new().with_user(true).with_write(true);
    assert_eq!(memory.handle_page_fault(start, error), Ok(true));
    assert!(leaf(&mmu, start).user_accessible());

    let old = memory.allocate_user_memory(64, 8).unwrap();
    assert_eq!(old, start);
    unsafe { mmu.virt_to_ptr::<u64>(old + 56).write(0x0123_4567_89AB_CDEF) };
    let new = memory.reallocate_user_memory(old, 64, 128, 8).unwrap();
    assert!(USER_AREA.contains(new.as_u32()));
    assert_eq!(
        unsafe { mmu.virt_to_ptr::<u64>(new + 56).read() },
        0x0123_4567_89AB_CDEF
    );

    memory.free_user_memory(new, 128, 8);
    let heap = space.heap();
    assert_eq!(heap.free_memory(), heap.total_memory());
}

#[test]
fn kernel_stacks_are_backed_before_use() {
    let mmu = ram();
    let slot = SyncOnceCell::new();
    let map = memory_map();
    let ctx = boot(&mmu, &map, &slot);
    let memory = &ctx.memory;
    let heap_start = ctx.layout.heap_start;
    let flags = PageFlags::kernel_rw();

    // Back the heap pages the free list writes to past its initial slice.
    let slice_end = heap_start + INITIAL_KERNEL_HEAP_SIZE;
    memory.map(slice_end, 1, flags, false).unwrap();
    memory.map(slice_end + KERNEL_STACK_SIZE, 1, flags, false).unwrap();
    memory.map(slice_end + 2 * KERNEL_STACK_SIZE, 1, flags, false).unwrap();

    // Fill the rest of the slice so the stack lands right behind it.
    let used = u32::try_from(ctx.kernel_heap.total_memory() - ctx.kernel_heap.free_memory()).unwrap();
    let filler = memory
        .allocate_kernel_memory(INITIAL_KERNEL_HEAP_SIZE - used, PAGE_SIZE)
        .unwrap();

    let stack = memory.allocate_kernel_stack().unwrap();
    assert_eq!(stack, slice_end);
    for page in 0..KERNEL_STACK_SIZE / PAGE_SIZE {
        assert!(memory.get_physical_address(stack + page * PAGE_SIZE).is_some(), "{page}");
    }
    unsafe { mmu.virt_to_ptr::<u32>(stack + (KERNEL_STACK_SIZE - 4)).write(0x57AC) };

    let second = memory.allocate_kernel_stack().unwrap();
    assert!(second.as_u32() >= stack.as_u32() + KERNEL_STACK_SIZE);
    assert_eq!(second.as_u32() % PAGE_SIZE, 0);

    memory.free_kernel_stack(stack);
    // The pages stay mapped for the heap.
    assert!(memory.get_physical_address(stack + PAGE_SIZE).is_some());
    assert_eq!(memory.allocate_kernel_stack().unwrap(), stack);
    memory.free_kernel_memory(filler, INITIAL_KERNEL_HEAP_SIZE - used, PAGE_SIZE);
}
