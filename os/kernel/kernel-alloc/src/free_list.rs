//! # Free-List Heap
//!
//! A first-fit, split-and-coalesce allocator over a range of virtual memory.
//!
//! Free regions carry an in-band header; allocated regions carry nothing, so
//! a page-aligned allocation can later be remapped without corrupting the
//! heap. The caller has to hand the size and alignment back on free.
//!
//! ```text
//! +----------------------+-------------------------+
//! | Node { size, next }  |      rest of region     |
//! +----------------------+-------------------------+
//! ^ region start         ^ region start + 8
//! ```
//!
//! - `size` covers the whole free region, header included.
//! - `next` is the address of the next free region, `0` at the end of the list.
//! - Regions are kept **sorted by address** and neighbors are merged on free.
//! - Every size and address is a multiple of [`GRANULE`].
//!
//! Memory is accessed through the [`Mmu`], so the same heap works on bare
//! metal and in tests. The first node is written on first use, which lets a
//! heap be created for an address space before its memory is mapped.

use crate::block::BlockMemoryManager;
use core::ptr;
use kernel_info::fault::KernelFault;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;
use kernel_vmem::Mmu;

/// Allocation granularity, and the size of a free-region header.
pub const GRANULE: u32 = size_of::<Node>() as u32;

#[repr(C)]
#[derive(Copy, Clone)]
struct Node {
    size: u32,
    next: u32,
}

struct FreeList {
    /// Address of the lowest free region, or `0`.
    head: u32,
    initialized: bool,
    free_bytes: u64,
}

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
const fn align_up(value: u64, align: u64) -> u64 {
    (value + (align - 1)) & !(align - 1)
}

pub struct FreeListHeap<'m, M: Mmu> {
    mmu: &'m M,
    start: u32,
    /// Exclusive.
    end: u32,
    list: SpinLock<FreeList>,
}

impl<'m, M: Mmu> FreeListHeap<'m, M> {
    /// A heap over `[start, end)`. Nothing is touched until the first allocation.
    ///
    /// # Panics
    /// Fires [`KernelFault::InvalidArgument`] if the range is empty, starts at
    /// zero or is not [`GRANULE`]-aligned.
    #[must_use]
    pub fn new(mmu: &'m M, start: VirtualAddress, end: VirtualAddress) -> Self {
        let (start, end) = (start.as_u32(), end.as_u32());
        if start == 0 || end <= start || start % GRANULE != 0 || end % GRANULE != 0 {
            KernelFault::InvalidArgument("malformed heap range").fire();
        }

        Self {
            mmu,
            start,
            end,
            list: SpinLock::new(FreeList {
                head: 0,
                initialized: false,
                free_bytes: u64::from(end - start),
            }),
        }
    }

    fn read(&self, at: u32) -> Node {
        // SAFETY: `at` is the start of a free region inside the heap, so a
        // node was written there; callers hold the list lock.
        unsafe { ptr::read(self.mmu.virt_to_ptr::<Node>(VirtualAddress::new(at))) }
    }

    fn write(&self, at: u32, node: Node) {
        // SAFETY: `at` is granule aligned inside the heap and not handed out;
        // the page must be mapped (or faulted in) before the heap touches it.
        unsafe { ptr::write(self.mmu.virt_to_ptr::<Node>(VirtualAddress::new(at)), node) }
    }

    /// Point `prev` (or the list head, for `0`) at `next`.
    fn link(&self, list: &mut FreeList, prev: u32, next: u32) {
        if prev == 0 {
            list.head = next;
        } else {
            let node = self.read(prev);
            self.write(prev, Node { next, ..node });
        }
    }

    fn ensure_initialized(&self, list: &mut FreeList) {
        if list.initialized {
            return;
        }
        self.write(
            self.start,
            Node {
                size: self.end - self.start,
                next: 0,
            },
        );
        list.head = self.start;
        list.initialized = true;
    }

    /// `size` and `align` as the heap stores them.
    fn normalize(size: u32, align: u32) -> Option<(u32, u32)> {
        if !align.is_power_of_two() {
            return None;
        }
        let size = u32::try_from(align_up(u64::from(size.max(1)), u64::from(GRANULE))).ok()?;
        Some((size, align.max(GRANULE)))
    }

    /// First fit for `size` bytes at `align`; `None` if nothing fits.
    pub fn allocate(&self, size: u32, align: u32) -> Option<VirtualAddress> {
        let (size, align) = Self::normalize(size, align)?;
        self.allocate_in(&mut self.list.lock(), size, align)
    }

    /// [`allocate`](Self::allocate), but `None` if the heap is locked.
    ///
    /// For callers that may run while the heap lock is held further up the
    /// stack of the same CPU, such as a page fault raised by the heap itself.
    pub fn try_allocate(&self, size: u32, align: u32) -> Option<VirtualAddress> {
        let (size, align) = Self::normalize(size, align)?;
        self.allocate_in(&mut *self.list.try_lock()?, size, align)
    }

    fn allocate_in(&self, list: &mut FreeList, size: u32, align: u32) -> Option<VirtualAddress> {
        self.ensure_initialized(list);

        let mut prev = 0;
        let mut current = list.head;
        while current != 0 {
            let node = self.read(current);
            let region_end = u64::from(current) + u64::from(node.size);
            let alloc_start = align_up(u64::from(current), u64::from(align));
            let alloc_end = alloc_start + u64::from(size);

            if alloc_end <= region_end {
                // Both fit u32; they lie within the region.
                #[allow(clippy::cast_possible_truncation)]
                let (alloc_start, alloc_end) = (alloc_start as u32, alloc_end as u32);
                #[allow(clippy::cast_possible_truncation)]
                let tail = (region_end - u64::from(alloc_end)) as u32;

                let after = if tail > 0 {
                    self.write(alloc_end, Node { size: tail, next: node.next });
                    alloc_end
                } else {
                    node.next
                };

                if alloc_start > current {
                    self.write(
                        current,
                        Node {
                            size: alloc_start - current,
                            next: after,
                        },
                    );
                } else {
                    self.link(list, prev, after);
                }

                list.free_bytes -= u64::from(size);
                return Some(VirtualAddress::new(alloc_start));
            }

            prev = current;
            current = node.next;
        }
        None
    }

    /// Give back `[address, address + size)` obtained with the same `size` and `align`.
    ///
    /// # Panics
    /// Fires [`KernelFault::InvalidArgument`] if the range lies outside the
    /// heap or overlaps a free region.
    pub fn free(&self, address: VirtualAddress, size: u32, align: u32) {
        let Some((size, _)) = Self::normalize(size, align) else {
            KernelFault::InvalidArgument("free with a malformed layout").fire();
        };
        let address = address.as_u32();
        if address < self.start
            || address % GRANULE != 0
            || u64::from(address) + u64::from(size) > u64::from(self.end)
        {
            KernelFault::InvalidArgument("free outside of the heap").fire();
        }

        let mut list = self.list.lock();
        if !list.initialized {
            KernelFault::InvalidArgument("free on an unused heap").fire();
        }

        let mut prev = 0;
        let mut current = list.head;
        while current != 0 && current < address {
            prev = current;
            current = self.read(current).next;
        }

        let end = address + size;
        let prev_node = (prev != 0).then(|| self.read(prev));
        if prev_node.is_some_and(|p| prev + p.size > address) || (current != 0 && end > current) {
            KernelFault::InvalidArgument("free of memory that is already free").fire();
        }

        // Merge with the following region.
        let (mut merged_size, mut next) = (size, current);
        if current != 0 && end == current {
            let following = self.read(current);
            merged_size += following.size;
            next = following.next;
        }

        // Merge into the preceding region, or become a region of its own.
        match prev_node {
            Some(p) if prev + p.size == address => {
                self.write(
                    prev,
                    Node {
                        size: p.size + merged_size,
                        next,
                    },
                );
            }
            _ => {
                self.write(address, Node { size: merged_size, next });
                self.link(&mut list, prev, address);
            }
        }

        list.free_bytes += u64::from(size);
    }

    /// Bytes not allocated.
    #[must_use]
    pub fn free_memory(&self) -> u64 {
        self.list.lock().free_bytes
    }

    #[must_use]
    pub const fn total_memory(&self) -> u64 {
        (self.end - self.start) as u64
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        VirtualAddress::new(self.start)
    }

    /// First address past the heap.
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.end)
    }

    #[must_use]
    pub const fn mmu(&self) -> &'m M {
        self.mmu
    }

    /// Log every free region.
    pub fn debug_log(&self) {
        let list = self.list.lock();
        log::debug!(
            "heap [{:#010x}, {:#010x}): {} bytes free",
            self.start,
            self.end,
            list.free_bytes
        );
        let mut current = list.head;
        while current != 0 {
            let node = self.read(current);
            log::trace!("  free {current:#010x}: {} bytes", node.size);
            current = node.next;
        }
    }
}

/// Page-sized blocks carved from the heap.
impl<M: Mmu> BlockMemoryManager for FreeListHeap<'_, M> {
    type Address = VirtualAddress;

    fn allocate_block(&self) -> Option<VirtualAddress> {
        self.allocate(PAGE_SIZE, PAGE_SIZE)
    }

    fn try_allocate_block(&self) -> Option<VirtualAddress> {
        self.try_allocate(PAGE_SIZE, PAGE_SIZE)
    }

    fn free_block(&self, block: VirtualAddress) {
        self.free(block, PAGE_SIZE, PAGE_SIZE);
    }

    fn free_memory(&self) -> u64 {
        Self::free_memory(self)
    }

    fn total_memory(&self) -> u64 {
        Self::total_memory(self)
    }

    fn block_size(&self) -> u32 {
        PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;
    use kernel_vmem::soft::SoftMmu;

    const BASE: u32 = 0x0010_0000;
    const SIZE: u32 = 16 * PAGE_SIZE;

    fn ram() -> SoftMmu {
        SoftMmu::new(PhysicalAddress::new(BASE), SIZE)
    }

    fn heap(mmu: &SoftMmu) -> FreeListHeap<'_, SoftMmu> {
        FreeListHeap::new(mmu, VirtualAddress::new(BASE), VirtualAddress::new(BASE + SIZE))
    }

    #[test]
    fn first_fit_respects_alignment() {
        let mmu = ram();
        let heap = heap(&mmu);

        let a = heap.allocate(3, 1).unwrap();
        assert_eq!(a, VirtualAddress::new(BASE));
        let b = heap.allocate(64, 64).unwrap();
        assert_eq!(b, VirtualAddress::new(BASE + 64));
        // The gap in front of `b` is reused.
        let c = heap.allocate(16, 8).unwrap();
        assert_eq!(c, VirtualAddress::new(BASE + 8));
        assert_eq!(heap.free_memory(), u64::from(SIZE) - 8 - 64 - 16);
    }

    #[test]
    fn frees_coalesce_back_into_one_region() {
        let mmu = ram();
        let heap = heap(&mmu);

        let blocks: Vec<_> = (0..6).map(|_| heap.allocate(1000, 8).unwrap()).collect();
        for i in [3, 0, 5, 1, 4, 2] {
            heap.free(blocks[i], 1000, 8);
        }
        assert_eq!(heap.free_memory(), u64::from(SIZE));
        assert_eq!(heap.allocate(SIZE, 8), Some(VirtualAddress::new(BASE)));
        assert_eq!(heap.allocate(8, 8), None);
    }

    #[test]
    fn page_blocks_are_page_aligned_and_carry_no_header() {
        let mmu = ram();
        let heap = heap(&mmu);

        let _small = heap.allocate(8, 8).unwrap();
        let page = heap.allocate_block().unwrap();
        assert_eq!(page, VirtualAddress::new(BASE + PAGE_SIZE));

        // Scribbling over the block must not disturb the heap.
        unsafe { mmu.zero_page(page) };
        unsafe {
            mmu.virt_to_ptr::<u8>(page)
                .write_bytes(0xAA, PAGE_SIZE as usize);
        }
        heap.free_block(page);
        assert_eq!(heap.free_memory(), u64::from(SIZE) - 8);
        assert_eq!(heap.allocate_block(), Some(page));
    }

    #[test]
    fn try_allocate_gives_up_on_a_held_lock() {
        let mmu = ram();
        let heap = heap(&mmu);

        let held = heap.list.lock();
        assert_eq!(heap.try_allocate(8, 8), None);
        assert_eq!(heap.try_allocate_block(), None);
        drop(held);

        assert_eq!(heap.try_allocate(8, 8), Some(VirtualAddress::new(BASE)));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mmu = ram();
        let heap = heap(&mmu);
        for _ in 0..16 {
            assert!(heap.allocate_block().is_some());
        }
        assert_eq!(heap.allocate(8, 8), None);
        assert_eq!(heap.free_memory(), 0);
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn double_free_is_fatal() {
        let mmu = ram();
        let heap = heap(&mmu);
        let a = heap.allocate(32, 8).unwrap();
        let _b = heap.allocate(32, 8).unwrap();
        heap.free(a, 32, 8);
        heap.free(a, 32, 8);
    }

    #[test]
    fn nothing_is_written_before_the_first_allocation() {
        let mmu = ram();
        // Points past simulated RAM; touching it would fault.
        let heap = FreeListHeap::new(
            &mmu,
            VirtualAddress::new(0x8000_0000),
            VirtualAddress::new(0xFFFF_F000),
        );
        assert_eq!(heap.total_memory(), 0x7FFF_F000);
        assert_eq!(heap.free_memory(), 0x7FFF_F000);
    }
}
