//! # Kernel Memory Allocation
//!
//! Block managers for physical frames and paging-area pages, the free-list
//! heap, and the [`MemoryService`] the rest of the kernel talks to.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  MemoryService                      │
//! │    • map / unmap / map_io / page faults             │
//! │    • address space lifecycle                        │
//! └──────┬──────────────────┬──────────────────┬────────┘
//!        │                  │                  │
//! ┌──────▼───────┐  ┌───────▼────────┐  ┌──────▼────────────┐
//! │ PageFrame-   │  │ PagingArea-    │  │ VirtualAddress-   │
//! │ Allocator    │  │ Manager        │  │ Space (kernel-    │
//! │ (tiered)     │  │ (pool of 128)  │  │ vmem)             │
//! └──────┬───────┘  └───────┬────────┘  └──────┬────────────┘
//!        │                  │                  │
//! ┌──────▼───────┐  ┌───────▼────────┐  ┌──────▼────────────┐
//! │ TableMemory- │  │ BitmapMemory-  │  │ FreeListHeap      │
//! │ Manager      │  │ Manager        │  │ (per space)       │
//! └──────────────┘  └────────────────┘  └───────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Block managers ([`BlockMemoryManager`])
//! * [`TableMemoryManager`]: two-level, sharded, reference-counted; the
//!   metadata comes from another block manager and is materialized lazily.
//! * [`PageFrameAllocator`]: physical frames, preferring memory above the
//!   ISA DMA boundary, then above the kernel image.
//! * [`PagingAreaManager`]: page-table pages from a pool of backed pages.
//! * [`BitmapMemoryManager`]: a flat bitmap, first fit.
//! * [`FreeListHeap`]: byte-granular; page-sized blocks through the trait.
//!
//! ### Memory service ([`MemoryService`])
//! Owns the managers and the address spaces once bootstrap is done.
//!
//! ## Failure Model
//!
//! Exhaustion is reported as `None` wherever a caller can do something
//! about it. Broken invariants, like a use count wrapping or a page mapped
//! twice, fire a [`KernelFault`](kernel_info::fault::KernelFault) and halt.
//!
//! ## Testing
//!
//! All managers reach memory through the [`Mmu`](kernel_vmem::Mmu) seam; the
//! tests run them over `kernel_vmem::soft::SoftMmu`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

extern crate alloc;

mod bitmap;
mod block;
mod free_list;
mod memory_service;
mod page_frame;
mod paging_area;
mod table;

pub use crate::bitmap::BitmapMemoryManager;
pub use crate::block::{BlockAddress, BlockMemoryManager};
pub use crate::free_list::{FreeListHeap, GRANULE};
pub use crate::memory_service::{AddressSpace, MemoryService, MemoryStatus};
pub use crate::page_frame::PageFrameAllocator;
pub use crate::paging_area::PagingAreaManager;
pub use crate::table::{
    AllocationTableEntry, MIN_BITMAP_BLOCK_SIZE, ReferenceTableEntry, TableIndex,
    TableMemoryManager,
};
