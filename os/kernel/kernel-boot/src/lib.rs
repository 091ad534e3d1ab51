//! # Memory Bootstrap
//!
//! Brings the kernel from "paging off, no allocator" to a running
//! [`MemoryService`](kernel_alloc::MemoryService).
//!
//! The hard part is the chicken-and-egg problem: the allocators keep their
//! metadata in mapped memory, and mapping memory needs page tables from an
//! allocator. It is broken by a hand-built initial mapping:
//!
//! ```text
//!   boot loader ──► memory map, kernel image
//!                       │
//!                       ▼
//!   find region ──► carve directory + tables ──► enable paging
//!                                                    │
//!                                                    ▼
//!   kernel heap ──► shadow directory, frame allocator metadata
//!                       │
//!                       ▼
//!   frame allocator + paging area + kernel space ──► KernelContext
//! ```
//!
//! The individual phases are public so that the kernel image and the tests
//! can run them separately; [`enter`] runs them all.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod bootstrap;
mod context;
mod initial_mapping;
pub mod memory_map;

pub use crate::bootstrap::{
    enable_paging, enter, frame_allocator, kernel_address_space, place_kernel_heap,
};
pub use crate::context::KernelContext;
pub use crate::initial_mapping::{BootLayout, BootstrapArena, InitialMapping, create_initial_mapping};

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use thiserror::Error;

/// Why the initial mapping could not be built.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum BootstrapError {
    /// The paging area slice has room for this many pages only.
    #[error("bootstrap arena exhausted after {0} pages")]
    ArenaExhausted(u32),
    #[error("bootstrap region {0} is not page aligned")]
    Misaligned(PhysicalAddress),
    /// The paging window and the heap slice do not fit below the heap end.
    #[error("kernel image leaves no room for the paging area and the heap")]
    KernelTooLarge,
    #[error("{0} is mapped twice during bootstrap")]
    AlreadyMapped(VirtualAddress),
}
