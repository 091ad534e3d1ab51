//! # Block Managers
//!
//! Every allocator in this crate hands out fixed-size blocks of some address
//! range. [`BlockMemoryManager`] is the capability they share; the
//! [`TableMemoryManager`](crate::TableMemoryManager) needs nothing more from
//! the source of its own metadata pages.

use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// An address kind a block manager can hand out.
pub trait BlockAddress: Copy + Ord + fmt::Display + fmt::Debug + Send + Sync {
    fn from_u32(v: u32) -> Self;
    fn as_u32(self) -> u32;
}

impl BlockAddress for PhysicalAddress {
    #[inline]
    fn from_u32(v: u32) -> Self {
        Self::new(v)
    }

    #[inline]
    fn as_u32(self) -> u32 {
        Self::as_u32(self)
    }
}

impl BlockAddress for VirtualAddress {
    #[inline]
    fn from_u32(v: u32) -> Self {
        Self::new(v)
    }

    #[inline]
    fn as_u32(self) -> u32 {
        Self::as_u32(self)
    }
}

/// Allocation of fixed-size blocks.
pub trait BlockMemoryManager: Sync {
    type Address: BlockAddress;

    /// A free block, or `None` if the managed range is exhausted.
    fn allocate_block(&self) -> Option<Self::Address>;

    /// Like [`allocate_block`](Self::allocate_block), but `None` instead of
    /// waiting when the manager is busy. Managers without a lock just
    /// allocate.
    fn try_allocate_block(&self) -> Option<Self::Address> {
        self.allocate_block()
    }

    /// Give back a block obtained from [`allocate_block`](Self::allocate_block).
    fn free_block(&self, block: Self::Address);

    /// Bytes not handed out.
    fn free_memory(&self) -> u64;

    /// Bytes under management.
    fn total_memory(&self) -> u64;

    fn block_size(&self) -> u32;
}
