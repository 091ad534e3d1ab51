//! # Virtual Memory Support
//!
//! 32-bit x86 paging for the kernel's memory-management core.
//!
//! ## What you get
//! - [`PageEntry`] / [`PageFlags`]: the packed 32-bit directory/table entry.
//! - A 4 KiB-aligned [`PageTable`] of atomic entries and the [`L2Index`] /
//!   [`L1Index`] helpers.
//! - The [`Mmu`] seam: pointer translation, CR3/CR0 and `invlpg`.
//!   [`HardwareMmu`] talks to the processor; [`soft::SoftMmu`] simulates it for tests.
//! - [`VirtualAddressSpace`]: map, unmap and translate in one page directory.
//! - [`PageFaultError`]: the error code of a page fault.
//!
//! ## x86 Virtual Address → Physical Address Walk
//!
//! Without PAE, a 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22     | 21‒12 | 11‒0   |
//! | Directory | Table | Offset |
//! ```
//!
//! ```text
//!  CR3 → Page Directory → Page Table → Physical Page
//!            │                │
//!            │                └───► PTE: maps a 4 KiB page
//!            └────────────────────► PDE: points to a page table (PS=1 maps 4 MiB)
//! ```
//!
//! | Level | Table | Entry | Covers |
//! |:------|:------|:------|:-------|
//! | 2 | **Page Directory** | **PDE** | 4 MiB per entry, 4 GiB per directory. Referenced by CR3. |
//! | 1 | **Page Table** | **PTE** | 4 KiB per entry, 4 MiB per table. |
//!
//! Both levels hold 1024 entries of 4 bytes, so every table is exactly one page.
//! The `US` and `RW` bits of both levels are combined: a page is user-accessible
//! only if its directory entry and its table entry both say so.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

mod address_space;
#[cfg(target_arch = "x86")]
mod hardware;
mod mmu;
mod page_entry;
mod page_fault;
mod page_table;
#[cfg(any(test, feature = "soft-mmu"))]
pub mod soft;

pub use crate::address_space::{
    HeapRef, KERNEL_DIRECTORY_ENTRIES, USER_DIRECTORY_ENTRIES, VirtualAddressSpace, VmmError,
};
#[cfg(target_arch = "x86")]
pub use crate::hardware::HardwareMmu;
pub use crate::mmu::{Mmu, PageTableAlloc, PageTableFrame};
pub use crate::page_entry::{PageEntry, PageFlags};
pub use crate::page_fault::PageFaultError;
pub use crate::page_table::{L1Index, L2Index, PageTable};
pub use kernel_info::memory as info;
pub use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
