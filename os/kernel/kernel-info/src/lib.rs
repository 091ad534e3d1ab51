//! # Kernel Configuration and Boot Interface
//!
//! This crate defines the memory layout constants, the boot interface
//! contracts and the fatal-fault taxonomy shared by the kernel's memory
//! management crates. It serves as the authoritative source for system-wide
//! configuration.
//!
//! ## Architecture
//!
//! The crate is organized into three modules:
//!
//! ### Boot Information ([`boot`])
//! Defines the loader-to-kernel handoff:
//! * **Memory Map**: Multiboot2 memory-map entries and their types
//! * **Kernel Image**: Physical bounds of the loaded image
//!
//! ### Memory Layout ([`memory`])
//! Establishes the kernel's virtual memory architecture:
//! * **Address Space Split**: Kernel area in the lower, user area in the upper half
//! * **Paging Area**: Virtual window holding every page table and directory
//! * **Kernel Heap**: Grows from the end of the paging area up to 2 GiB
//!
//! ### Faults ([`fault`])
//! The error categories that halt the system when a memory-management
//! invariant is broken.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │     Low Memory (< 1 MiB)        │ reserved, never allocated
//! KERNEL_BASE ├─────────────────────────────────┤ 0x0010_0000
//!             │  Kernel Image (identity mapped) │
//!             ├─────────────────────────────────┤ page aligned kernel end
//!             │  Paging Area (16 MiB)           │ page tables and directories
//!             ├─────────────────────────────────┤
//!             │  Kernel Heap                    │
//! USER_AREA   ├─────────────────────────────────┤ 0x8000_0000 = KERNEL_HEAP_END
//!             │  User Space (per process)       │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Page tables of the kernel area are shared by every address space; the
//! user area's tables belong to exactly one process.
//!
//! ## Configuration Management
//!
//! All layout constants are `const` values checked by compile-time
//! assertions, and consumed by the kernel's `build.rs`:
//!
//! ```rust
//! // In build.rs
//! use kernel_info::memory::KERNEL_BASE;
//!
//! println!("cargo:rustc-link-arg=--defsym=KERNEL_BASE={:#x}", KERNEL_BASE);
//! ```
//!
//! ## Safety Guarantees
//!
//! * **No Overlaps**: Compile-time verification of the kernel/user split
//! * **Alignment Requirements**: Page alignment of every window and slice
//! * **No Unsafe Code**: Marked `#![deny(unsafe_code)]`

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod fault;
pub mod memory;
