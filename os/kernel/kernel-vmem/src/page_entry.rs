//! # Page Directory / Page Table Entries
//!
//! A 32-bit entry is the same for both levels: 12 flag bits and a 20-bit
//! frame number.
//!
//! | Bits  | Name               | Meaning |
//! |-------|--------------------|---------|
//! | 0     | `P`                | Present |
//! | 1     | `RW`               | Writable |
//! | 2     | `US`               | User-mode accessible |
//! | 3     | `PWT`              | Write-through caching |
//! | 4     | `PCD`              | Disable caching |
//! | 5     | `A`                | Accessed |
//! | 6     | `D`                | Dirty (leaf only) |
//! | 7     | `PS`               | 4 MiB page (directory only) |
//! | 8     | `G`                | Global (leaf only) |
//! | 9–11  | available          | Ignored by hardware |
//! | 12–31 | frame              | Physical frame number |

use bitfield_struct::bitfield;
use kernel_memory_addresses::{MemoryAddress, PhysicalAddress};

/// Raw page directory or page table entry.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_accessible: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disable: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on first write to a leaf.
    pub dirty: bool,

    /// Page Size (PS, bit 7). In a directory entry, maps 4 MiB directly.
    pub page_size: bool,

    /// Global (G, bit 8). Survives CR3 reloads when CR4.PGE is set.
    pub global: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub available: u8,

    /// Frame number (bits 12..=31).
    #[bits(20)]
    frame: u32,
}

/// The 12 flag bits of a [`PageEntry`], without an address.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct PageFlags {
    pub present: bool,
    pub writable: bool,
    pub user_accessible: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub page_size: bool,
    pub global: bool,
    #[bits(3)]
    pub available: u8,
    #[bits(4)]
    __: u8,
}

impl PageFlags {
    /// `PRESENT | WRITABLE`
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// `PRESENT | WRITABLE | CACHE_DISABLE`, for device memory.
    #[inline]
    #[must_use]
    pub const fn kernel_io() -> Self {
        Self::kernel_rw().with_cache_disable(true)
    }
}

impl PageEntry {
    const FLAG_MASK: u32 = 0xFFF;

    /// Entry pointing at the page-aligned `address` with `flags`.
    ///
    /// The hardware directory stores physical addresses; the shadow directory
    /// of an address space uses the same layout with virtual addresses.
    #[inline]
    #[must_use]
    pub const fn with_address(address: MemoryAddress, flags: PageFlags) -> Self {
        Self::from_bits(
            (address.as_u32() & !Self::FLAG_MASK) | (flags.into_bits() as u32 & Self::FLAG_MASK),
        )
    }

    /// Leaf or table entry for a physical frame.
    #[inline]
    #[must_use]
    pub const fn mapping(frame: PhysicalAddress, flags: PageFlags) -> Self {
        Self::with_address(frame.as_memory_address(), flags)
    }

    /// The page-aligned address stored in the entry.
    #[inline]
    #[must_use]
    pub const fn address(self) -> MemoryAddress {
        MemoryAddress::new(self.frame() << 12)
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits((self.into_bits() & Self::FLAG_MASK) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn is_unused(self) -> bool {
        !self.present()
    }
}
