//! # Page Frame Allocator
//!
//! Physical frames with a placement policy. Frames are taken, in this order,
//!
//! 1. at or above [`ISA_DMA_BOUNDARY`], keeping DMA-capable memory for devices,
//! 2. at or above the end of the kernel image,
//! 3. from the start of memory.
//!
//! The last tier only matters during early boot, before the low megabyte is
//! reserved.

use crate::block::BlockMemoryManager;
use crate::table::{AllocationTableEntry, TableMemoryManager};
use kernel_info::memory::ISA_DMA_BOUNDARY;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::Mmu;

pub struct PageFrameAllocator<'m, M: Mmu> {
    table: TableMemoryManager<'m, M, PhysicalAddress>,
    kernel_end: PhysicalAddress,
}

impl<'m, M: Mmu> PageFrameAllocator<'m, M> {
    /// Manage the frames of `[start, end]`.
    ///
    /// `kernel_end` is the first address past the kernel image.
    pub fn new(
        mmu: &'m M,
        metadata: &'m dyn BlockMemoryManager<Address = VirtualAddress>,
        start: PhysicalAddress,
        end: PhysicalAddress,
        block_size: u32,
        kernel_end: PhysicalAddress,
    ) -> Self {
        Self {
            table: TableMemoryManager::new(mmu, metadata, start, end, block_size),
            kernel_end,
        }
    }

    /// A free frame, or `None` once physical memory is exhausted.
    pub fn allocate_block(&self) -> Option<PhysicalAddress> {
        self.table
            .allocate_block_after_address(PhysicalAddress::new(ISA_DMA_BOUNDARY))
            .or_else(|| self.table.allocate_block_after_address(self.kernel_end))
            .or_else(|| {
                self.table
                    .allocate_block_after_address(self.table.start_address())
            })
    }

    #[inline]
    pub fn allocate_block_after_address(&self, address: PhysicalAddress) -> Option<PhysicalAddress> {
        self.table.allocate_block_after_address(address)
    }

    #[inline]
    pub fn allocate_block_at_address(&self, address: PhysicalAddress) -> PhysicalAddress {
        self.table.allocate_block_at_address(address)
    }

    #[inline]
    pub fn free_block(&self, address: PhysicalAddress) {
        self.table.free_block(address);
    }

    #[inline]
    pub fn set_memory(&self, start: PhysicalAddress, end: PhysicalAddress, use_count: u16, reserved: bool) {
        self.table.set_memory(start, end, use_count, reserved);
    }

    /// See [`TableMemoryManager::reserve_spare_block`].
    #[inline]
    pub fn reserve_spare_block(&self) -> bool {
        self.table.reserve_spare_block()
    }

    #[inline]
    #[must_use]
    pub fn has_spare_block(&self) -> bool {
        self.table.has_spare_block()
    }

    #[inline]
    #[must_use]
    pub fn block_state(&self, address: PhysicalAddress) -> Option<AllocationTableEntry> {
        self.table.block_state(address)
    }

    #[inline]
    #[must_use]
    pub fn free_memory(&self) -> u64 {
        self.table.free_memory()
    }

    #[inline]
    #[must_use]
    pub fn total_memory(&self) -> u64 {
        self.table.total_memory()
    }

    #[inline]
    #[must_use]
    pub fn start_address(&self) -> PhysicalAddress {
        self.table.start_address()
    }

    #[inline]
    #[must_use]
    pub fn end_address(&self) -> PhysicalAddress {
        self.table.end_address()
    }

    #[inline]
    #[must_use]
    pub const fn kernel_end(&self) -> PhysicalAddress {
        self.kernel_end
    }

    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.table.block_size()
    }

    pub fn debug_log(&self) {
        log::debug!("kernel end: {}", self.kernel_end);
        self.table.debug_log();
    }
}

impl<M: Mmu> BlockMemoryManager for PageFrameAllocator<'_, M> {
    type Address = PhysicalAddress;

    fn allocate_block(&self) -> Option<PhysicalAddress> {
        Self::allocate_block(self)
    }

    fn free_block(&self, block: PhysicalAddress) {
        Self::free_block(self, block);
    }

    fn free_memory(&self) -> u64 {
        Self::free_memory(self)
    }

    fn total_memory(&self) -> u64 {
        Self::total_memory(self)
    }

    fn block_size(&self) -> u32 {
        Self::block_size(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::BitmapMemoryManager;
    use kernel_vmem::soft::SoftMmu;

    const META: u32 = 0x0010_0000;

    fn pa(v: u32) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    #[test]
    fn prefers_memory_above_the_dma_boundary() {
        let mmu = SoftMmu::new(pa(META), 16 * 4096);
        let meta = BitmapMemoryManager::new(VirtualAddress::new(META), 16 * 4096, 4096);
        let pfa = PageFrameAllocator::new(&mmu, &meta, pa(0), pa(0x01FF_FFFF), 4096, pa(0x0018_0000));

        let first = pfa.allocate_block().unwrap();
        assert_eq!(first, pa(ISA_DMA_BOUNDARY));
        assert_eq!(pfa.block_state(first).unwrap().use_count(), 1);
    }

    #[test]
    fn falls_back_to_the_kernel_end_and_then_to_the_start() {
        let mmu = SoftMmu::new(pa(META), 16 * 4096);
        let meta = BitmapMemoryManager::new(VirtualAddress::new(META), 16 * 4096, 4096);
        let pfa = PageFrameAllocator::new(&mmu, &meta, pa(0), pa(0x01FF_FFFF), 4096, pa(0x0018_0000));

        // Leave one frame above the boundary, one above the kernel, one below it.
        pfa.set_memory(pa(0x0100_1000), pa(0x01FF_FFFF), 0, true);
        pfa.set_memory(pa(0x0018_1000), pa(0x00FF_FFFF), 0, true);
        pfa.set_memory(pa(0x0000_1000), pa(0x0017_FFFF), 0, true);

        assert_eq!(pfa.allocate_block(), Some(pa(0x0100_0000)));
        assert_eq!(pfa.allocate_block(), Some(pa(0x0018_0000)));
        assert_eq!(pfa.allocate_block(), Some(pa(0)));
        assert_eq!(pfa.allocate_block(), None);
    }
}
