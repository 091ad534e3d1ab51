//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw 32-bit memory addresses used in paging
//! and memory management code.
//!
//! ## Overview
//!
//! This crate defines a minimal set of types that prevent mixing virtual and
//! physical addresses at compile time while remaining zero-cost wrappers around
//! `u32` values.
//!
//! | Type | Description |
//! |----------|-------------|
//! | [`MemoryAddress`] | A raw 32-bit address, either physical or virtual. |
//! | [`VirtualAddress`] | Refers to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] | Refers to physical memory or MMIO regions. |
//!
//! ## Page Sizes
//!
//! Two granularities of the two-level x86 paging scheme are provided as marker
//! types that implement [`PageSize`]:
//!
//! - [`Size4K`]: 4 KiB pages (base granularity, one page-table entry)
//! - [`Size4M`]: 4 MiB, the span covered by one page-directory entry
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0040_1234);
//! assert_eq!(va.align_down::<Size4K>().as_u32(), 0x0040_1000);
//! assert_eq!(va.offset::<Size4K>(), 0x234);
//! assert!(va.align_down::<Size4M>().is_aligned::<Size4K>());
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`, and
//!   `Hash`, making them suitable as map keys or for FFI use.
//! - Sizes that may reach 4 GiB are expressed through [`MemoryAddress::as_u64`],
//!   never by wrapping `u32` arithmetic.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod memory_address;
mod page_size;
mod physical_address;
mod virtual_address;

pub use memory_address::MemoryAddress;
pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        let a = MemoryAddress::new(0x12345);
        assert_eq!(a.align_down::<Size4K>().as_u32(), 0x12000);
        assert_eq!(a.align_up::<Size4K>(), Some(MemoryAddress::new(0x13000)));
        assert_eq!(a.offset::<Size4K>(), 0x345);
        assert!(!a.is_aligned::<Size4K>());
    }

    #[test]
    fn align_up_at_the_top_of_the_address_space() {
        let a = MemoryAddress::new(0xFFFF_F001);
        assert_eq!(a.align_up::<Size4K>(), None);
        assert_eq!(
            MemoryAddress::new(0xFFFF_F000).align_up::<Size4K>(),
            Some(MemoryAddress::new(0xFFFF_F000))
        );
    }

    #[test]
    fn directory_span() {
        let va = VirtualAddress::new(0x8040_0FFF);
        assert_eq!(va.align_down::<Size4M>(), VirtualAddress::new(0x8040_0000));
        assert_eq!(va.checked_add(0x7FBF_F000), Some(VirtualAddress::new(0xFFFF_FFFF)));
        assert_eq!(va.checked_add(0x7FBF_F001), None);
    }

    #[test]
    fn sizes_widen_past_four_gib() {
        let end = PhysicalAddress::new(0xFFFF_FFFF);
        assert_eq!(end.as_u64() + 1, 4 * 1024 * 1024 * 1024);
    }

    #[test]
    fn virtual_vs_physical_wrappers() {
        let va = VirtualAddress::new(0x0080_1234);
        let pa = PhysicalAddress::new(0x0080_1234);
        assert_eq!(va.as_memory_address(), pa.as_memory_address());
        assert_eq!(format!("{va:?}"), "VA(0x00801234)");
        assert_eq!(format!("{pa}"), "0x00801234");
    }
}
