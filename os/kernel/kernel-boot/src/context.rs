use crate::initial_mapping::BootLayout;
use kernel_alloc::{FreeListHeap, MemoryService};
use kernel_vmem::Mmu;

/// What the rest of the kernel gets from the bootstrap, passed around by
/// reference instead of living in globals.
pub struct KernelContext<'h, M: Mmu> {
    pub memory: MemoryService<'h, M>,
    pub kernel_heap: &'h FreeListHeap<'h, M>,
    pub layout: BootLayout,
    /// First address past the highest available memory.
    pub memory_end: u64,
}

impl<M: Mmu> KernelContext<'_, M> {
    /// Log the layout and the allocator state.
    pub fn debug_log(&self) {
        log::debug!("kernel image: [{}, {})", self.layout.kernel.start, self.layout.kernel_end);
        log::debug!("paging window: {}", self.layout.paging_window);
        log::debug!("kernel heap: [{}, {})", self.kernel_heap.start(), self.kernel_heap.end());
        log::debug!("{:?}", self.memory.stats());
        self.memory.frames().debug_log();
        self.kernel_heap.debug_log();
    }
}
