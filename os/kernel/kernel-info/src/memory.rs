//! # Memory Layout
//!
//! Two-level 32-bit paging splits the 4 GiB address space at 2 GiB: the lower
//! half is the kernel area shared by every address space, the upper half
//! belongs to the process.

use kernel_memory_addresses::{PageSize, Size4K};

/// Size of a page frame and of every page table and directory.
pub const PAGE_SIZE: u32 = Size4K::SIZE;

/// Number of entries in a page table or page directory.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Where the boot loader places the kernel image; the kernel runs identity mapped.
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const KERNEL_BASE: u32 = 0x0010_0000; // 1 MiB

/// Everything below this address is left to the BIOS and legacy devices.
pub const LOWER_MEMORY_END: u32 = 0x0010_0000; // 1 MiB

/// Frames below this address are reachable by ISA DMA controllers.
pub const ISA_DMA_BOUNDARY: u32 = 0x0100_0000; // 16 MiB

/// Size of the virtual window that holds page tables and directories.
pub const PAGING_AREA_SIZE: u32 = 16 * 1024 * 1024;

/// The kernel heap grows up to (excluding) this address.
pub const KERNEL_HEAP_END: u32 = 0x8000_0000;

/// Process heaps span the user area up to (excluding) this address.
pub const USER_HEAP_END: u32 = 0xFFFF_F000;

/// Part of the paging area backed by the bootstrap region.
pub const INITIAL_PAGING_AREA_SIZE: u32 = 32 * 1024;

/// Part of the kernel heap backed by the bootstrap region.
pub const INITIAL_KERNEL_HEAP_SIZE: u32 = 128 * 1024;

/// Size of a kernel stack; stacks are page aligned and fully backed.
pub const KERNEL_STACK_SIZE: u32 = 16 * 1024;

/// Number of pre-allocated page-table pages the paging-area manager keeps on hand.
pub const PAGING_AREA_POOL_CAPACITY: usize = 128;

/// An inclusive range of virtual addresses.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryArea {
    pub start: u32,
    pub end: u32,
}

impl MemoryArea {
    #[must_use]
    pub const fn contains(&self, address: u32) -> bool {
        address >= self.start && address <= self.end
    }

    /// Size in bytes; a full 4 GiB area does not fit `u32`.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end as u64 - self.start as u64 + 1
    }

    /// Number of page-directory entries covering the area.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn directory_entries(&self) -> usize {
        (self.size() / (PAGE_SIZE as u64 * ENTRIES_PER_TABLE as u64)) as usize
    }
}

/// Shared by all address spaces; its page tables are owned by the kernel.
pub const KERNEL_AREA: MemoryArea = MemoryArea {
    start: 0x0000_0000,
    end: 0x7FFF_FFFF,
};

/// Private to each process.
pub const USER_AREA: MemoryArea = MemoryArea {
    start: 0x8000_0000,
    end: 0xFFFF_FFFF,
};

/// Size of the bootstrap region the boot code has to find above the kernel image.
pub const BOOTSTRAP_REGION_SIZE: u32 = INITIAL_PAGING_AREA_SIZE + INITIAL_KERNEL_HEAP_SIZE;

const _: () = {
    assert!(KERNEL_BASE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_BASE >= LOWER_MEMORY_END);
    assert!(ISA_DMA_BOUNDARY > KERNEL_BASE);
    assert!(INITIAL_PAGING_AREA_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(INITIAL_KERNEL_HEAP_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(INITIAL_PAGING_AREA_SIZE < PAGING_AREA_SIZE);
    assert!(PAGING_AREA_SIZE.is_multiple_of(PAGE_SIZE * ENTRIES_PER_TABLE as u32));
    assert!(KERNEL_HEAP_END == KERNEL_AREA.end + 1);
    assert!(USER_AREA.start == KERNEL_AREA.end + 1);
    assert!(USER_HEAP_END.is_multiple_of(PAGE_SIZE) && USER_HEAP_END > USER_AREA.start);
    assert!(KERNEL_AREA.directory_entries() == ENTRIES_PER_TABLE / 2);
};
