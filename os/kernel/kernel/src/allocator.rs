//! # Kernel Global Allocator
//!
//! Rust's `alloc` collections draw from the same [`FreeListHeap`] that backs
//! the frame allocator's metadata and the kernel's device mappings. The heap
//! lives in [`HEAP`], which the bootstrap fills in; until then every
//! allocation fails.
//!
//! ## Constraints
//! - Only the first slice of the heap is backed when paging comes up. Larger
//!   allocations need the page-fault path to map more of it.
//! - `dealloc` must receive the layout used for `alloc`, as mandated by
//!   `GlobalAlloc`.
//! - The heap's lock does not mask interrupts; do not allocate in interrupt
//!   context.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, null_mut};
use kernel_alloc::FreeListHeap;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SyncOnceCell;
use kernel_vmem::HardwareMmu;

/// The processor's MMU, shared by everything memory management builds.
pub static MMU: HardwareMmu = HardwareMmu;

/// The kernel heap, placed by the bootstrap.
pub static HEAP: SyncOnceCell<FreeListHeap<'static, HardwareMmu>> = SyncOnceCell::new();

/// The kernel’s global allocator.
pub struct KernelAllocator;

#[global_allocator]
static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

/// `(size, align)` as the heap takes them.
fn heap_layout(layout: Layout) -> Option<(u32, u32)> {
    Some((
        u32::try_from(layout.size()).ok()?,
        u32::try_from(layout.align()).ok()?,
    ))
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some((heap, (size, align))) = HEAP.get().zip(heap_layout(layout)) else {
            return null_mut();
        };
        heap.allocate(size, align)
            .map_or(null_mut(), |va| ptr::with_exposed_provenance_mut(va.as_usize()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let (Some(heap), Some((size, align)), Ok(address)) = (
            HEAP.get(),
            heap_layout(layout),
            u32::try_from(ptr.expose_provenance()),
        ) else {
            return;
        };
        heap.free(VirtualAddress::new(address), size, align);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }
}
