use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Access to memory through the processor's current translation, plus the
/// few control operations paging code needs.
///
/// Before paging is enabled, virtual addresses are physical addresses.
pub trait Mmu: Sync {
    /// Pointer through which the kernel reaches `va` in the active address space.
    ///
    /// Computing the pointer is safe; dereferencing it requires `va` to be
    /// mapped and to hold a `T`.
    fn virt_to_ptr<T>(&self, va: VirtualAddress) -> *mut T;

    /// Load `directory` as the active page directory (CR3).
    ///
    /// # Safety
    /// The directory must map the code and data the kernel is executing from.
    unsafe fn load_directory(&self, directory: PhysicalAddress);

    /// Turn on paging (CR0.PG).
    ///
    /// # Safety
    /// A directory that identity maps the running code must be loaded.
    unsafe fn enable_paging(&self);

    fn paging_enabled(&self) -> bool;

    /// Drop the TLB entry of the page containing `va` on the executing CPU.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Fill the page at `va` with zeros.
    ///
    /// # Safety
    /// `va` must be a mapped, writable page no one else references.
    unsafe fn zero_page(&self, va: VirtualAddress) {
        unsafe {
            self.virt_to_ptr::<u8>(va)
                .write_bytes(0, PAGE_SIZE as usize);
        }
    }
}

/// A page table page, reachable by the kernel at `virt` and by the MMU at `phys`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageTableFrame {
    pub virt: VirtualAddress,
    pub phys: PhysicalAddress,
}

/// Source of page-table pages for [`VirtualAddressSpace`](crate::VirtualAddressSpace).
pub trait PageTableAlloc {
    /// A zeroed page for a page table or directory, or `None` if the paging
    /// area is exhausted.
    fn allocate_page_table(&self) -> Option<PageTableFrame>;

    /// Return a page obtained from [`allocate_page_table`](Self::allocate_page_table).
    fn free_page_table(&self, frame: PageTableFrame);
}
