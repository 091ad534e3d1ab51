//! # Table Memory Manager
//!
//! A two-level, reference-counted block allocator with bounded metadata.
//!
//! ```text
//!  reference_table_array        reference tables          allocation tables
//!  ┌───────────┐          ┌────────────────────────┐     ┌───────────────────┐
//!  │ block VA  │ ───────► │ addr | I | L | - | -   │ ──► │ use count | R     │ × entries
//!  │ block VA  │          │ addr | I | L | - | -   │     └───────────────────┘
//!  └───────────┘          └────────────────────────┘
//! ```
//!
//! Reference tables are allocated up front. Allocation tables, one
//! metadata block each, are materialized on first touch of the range they
//! cover. Both come from a [`BlockMemoryManager`] of kernel-virtual pages.
//!
//! Materialization may run on the page-fault path. If the metadata source is
//! locked at that point, possibly by the code that faulted, the table is
//! taken from a spare block put aside with
//! [`reserve_spare_block`](TableMemoryManager::reserve_spare_block) instead.
//! Without a spare it waits for the lock, which deadlocks when the fault was
//! raised under it.
//!
//! Each reference-table entry doubles as the lock of its shard. Scans
//! [`try`](ShardGuard::try_acquire) each shard and skip it when contended, so
//! concurrent allocators spread over disjoint shards instead of queueing.
//! Use counts are atomic and may change without the lock.
//!
//! ## Entry layouts
//!
//! | Entry | Bits | Field |
//! |-------|------|-------|
//! | [`ReferenceTableEntry`] (u32) | 0–1 | unused |
//! | | 2 | locked |
//! | | 3 | installed (covers part of the managed range) |
//! | | 4–31 | address of the allocation table, 16-byte aligned |
//! | [`AllocationTableEntry`] (u16) | 0 | reserved |
//! | | 1–15 | use count |

use crate::block::{BlockAddress, BlockMemoryManager};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use kernel_info::fault::KernelFault;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::Mmu;

/// Smallest metadata block that holds a useful number of entries.
pub const MIN_BITMAP_BLOCK_SIZE: u32 = 16;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReferenceTableEntry(u32);

impl ReferenceTableEntry {
    const LOCKED: u32 = 1 << 2;
    const INSTALLED: u32 = 1 << 3;
    const FLAG_MASK: u32 = 0xF;

    #[must_use]
    pub const fn new(address: u32, installed: bool) -> Self {
        Self((address & !Self::FLAG_MASK) | if installed { Self::INSTALLED } else { 0 })
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn into_bits(self) -> u32 {
        self.0
    }

    /// Address of the allocation table; `0` while not materialized.
    #[must_use]
    pub const fn address(self) -> u32 {
        self.0 & !Self::FLAG_MASK
    }

    #[must_use]
    pub const fn is_locked(self) -> bool {
        self.0 & Self::LOCKED != 0
    }

    #[must_use]
    pub const fn is_installed(self) -> bool {
        self.0 & Self::INSTALLED != 0
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct AllocationTableEntry(u16);

impl AllocationTableEntry {
    const RESERVED: u16 = 1;
    /// Increment of the use count in the packed value.
    const ONE_USE: u16 = 1 << 1;
    pub const MAX_USE_COUNT: u16 = u16::MAX >> 1;

    #[must_use]
    pub const fn new(use_count: u16, reserved: bool) -> Self {
        debug_assert!(use_count <= Self::MAX_USE_COUNT);
        Self((use_count << 1) | if reserved { Self::RESERVED } else { 0 })
    }

    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn use_count(self) -> u16 {
        self.0 >> 1
    }

    #[must_use]
    pub const fn is_reserved(self) -> bool {
        self.0 & Self::RESERVED != 0
    }

    /// Neither reserved nor in use.
    #[must_use]
    pub const fn is_free(self) -> bool {
        self.0 == 0
    }
}

/// Position of a block in the metadata. Relative to the start of the range.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TableIndex {
    pub reference_table_array_index: u32,
    pub reference_table_index: u32,
    pub allocation_table_index: u32,
}

/// Holds the lock bit of one reference-table entry.
struct ShardGuard<'a> {
    entry: &'a AtomicU32,
}

impl<'a> ShardGuard<'a> {
    fn try_acquire(entry: &'a AtomicU32) -> Option<Self> {
        let old = entry.fetch_or(ReferenceTableEntry::LOCKED, Ordering::Acquire);
        (old & ReferenceTableEntry::LOCKED == 0).then_some(Self { entry })
    }

    fn acquire(entry: &'a AtomicU32) -> Self {
        loop {
            if let Some(guard) = Self::try_acquire(entry) {
                return guard;
            }
            while ReferenceTableEntry(entry.load(Ordering::Relaxed)).is_locked() {
                spin_loop();
            }
        }
    }
}

impl Drop for ShardGuard<'_> {
    fn drop(&mut self) {
        self.entry
            .fetch_and(!ReferenceTableEntry::LOCKED, Ordering::Release);
    }
}

pub struct TableMemoryManager<'m, M: Mmu, A: BlockAddress> {
    mmu: &'m M,
    metadata: &'m dyn BlockMemoryManager<Address = VirtualAddress>,
    start: u32,
    /// Inclusive.
    end: u32,
    block_size: u32,
    block_count: u32,
    allocation_table_count: u32,
    allocation_table_entries_per_block: u32,
    reference_table_entries_per_block: u32,
    managed_memory_per_allocation_table: u64,
    reference_table_array: Box<[VirtualAddress]>,
    /// Metadata block for a busy metadata source; `0` if none.
    spare: AtomicU32,
    _address: PhantomData<fn() -> A>,
}

impl<'m, M: Mmu, A: BlockAddress> TableMemoryManager<'m, M, A> {
    /// Manage `[start, end]` (inclusive) in blocks of `block_size`.
    ///
    /// # Panics
    /// Fires [`KernelFault::InvalidArgument`] if the metadata blocks are
    /// smaller than [`MIN_BITMAP_BLOCK_SIZE`] or the range is malformed, and
    /// [`KernelFault::OutOfMemory`] if the reference tables cannot be allocated.
    pub fn new(
        mmu: &'m M,
        metadata: &'m dyn BlockMemoryManager<Address = VirtualAddress>,
        start: A,
        end: A,
        block_size: u32,
    ) -> Self {
        let bitmap_block_size = metadata.block_size();
        if bitmap_block_size < MIN_BITMAP_BLOCK_SIZE {
            KernelFault::InvalidArgument("bitmap block size is too small").fire();
        }
        let (start, end) = (start.as_u32(), end.as_u32());
        if !block_size.is_power_of_two() || !start.is_multiple_of(block_size) || end < start {
            KernelFault::InvalidArgument("malformed table memory range").fire();
        }

        let memory_size = u64::from(end - start) + 1;
        let Ok(block_count) = u32::try_from(memory_size.div_ceil(u64::from(block_size))) else {
            KernelFault::InvalidArgument("too many blocks").fire();
        };

        let allocation_table_entries_per_block = bitmap_block_size / size_of::<u16>() as u32;
        let reference_table_entries_per_block = bitmap_block_size / size_of::<u32>() as u32;
        let allocation_table_count = block_count.div_ceil(allocation_table_entries_per_block);
        let reference_table_size_in_blocks =
            allocation_table_count.div_ceil(reference_table_entries_per_block);

        let mut reference_table_array = Vec::with_capacity(reference_table_size_in_blocks as usize);
        for _ in 0..reference_table_size_in_blocks {
            let Some(block) = metadata.allocate_block() else {
                KernelFault::OutOfMemory("no block for a reference table").fire();
            };
            reference_table_array.push(block);
        }

        let manager = Self {
            mmu,
            metadata,
            start,
            end,
            block_size,
            block_count,
            allocation_table_count,
            allocation_table_entries_per_block,
            reference_table_entries_per_block,
            managed_memory_per_allocation_table: u64::from(allocation_table_entries_per_block)
                * u64::from(block_size),
            reference_table_array: reference_table_array.into_boxed_slice(),
            spare: AtomicU32::new(0),
            _address: PhantomData,
        };

        let slots = reference_table_size_in_blocks * reference_table_entries_per_block;
        for g in 0..slots {
            let installed = g < allocation_table_count;
            manager
                .reference_entry(g)
                .store(ReferenceTableEntry::new(0, installed).into_bits(), Ordering::Relaxed);
        }

        log::debug!(
            "table memory manager over [{:#010x}, {:#010x}]: {} allocation tables, {} reference table blocks",
            start,
            end,
            allocation_table_count,
            reference_table_size_in_blocks
        );
        manager
    }

    fn reference_entry(&self, g: u32) -> &AtomicU32 {
        let block = self.reference_table_array[(g / self.reference_table_entries_per_block) as usize];
        let offset = (g % self.reference_table_entries_per_block) * size_of::<u32>() as u32;
        // SAFETY: reference blocks are owned by this manager for its lifetime,
        // mapped and 16-byte aligned; `offset` stays inside the block.
        unsafe { &*self.mmu.virt_to_ptr::<AtomicU32>(block + offset) }
    }

    fn allocation_entry(&self, table: VirtualAddress, k: u32) -> &AtomicU16 {
        // SAFETY: `table` came out of a reference entry, so it is a mapped
        // metadata block of this manager that is never released, and `k` is
        // below `allocation_table_entries_per_block`.
        unsafe { &*self.mmu.virt_to_ptr::<AtomicU16>(table + k * size_of::<u16>() as u32) }
    }

    fn table_of(entry: &AtomicU32) -> Option<VirtualAddress> {
        match ReferenceTableEntry(entry.load(Ordering::Acquire)).address() {
            0 => None,
            a => Some(VirtualAddress::new(a)),
        }
    }

    /// The allocation table behind `entry`, allocating it if needed.
    /// Caller holds the shard lock.
    fn materialize(&self, entry: &AtomicU32) -> VirtualAddress {
        if let Some(table) = Self::table_of(entry) {
            return table;
        }

        let table = self
            .metadata
            .try_allocate_block()
            .or_else(|| self.take_spare_block())
            .or_else(|| self.metadata.allocate_block());
        let Some(table) = table else {
            KernelFault::OutOfMemory("no block for an allocation table").fire();
        };
        debug_assert!(table.as_u32().is_multiple_of(MIN_BITMAP_BLOCK_SIZE));
        // SAFETY: a fresh metadata block, mapped and owned by nobody else yet.
        unsafe {
            self.mmu
                .virt_to_ptr::<u8>(table)
                .write_bytes(0, self.metadata.block_size() as usize);
        }
        let _ = entry.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            Some((v & ReferenceTableEntry::FLAG_MASK) | table.as_u32())
        });
        table
    }

    fn take_spare_block(&self) -> Option<VirtualAddress> {
        match self.spare.swap(0, Ordering::AcqRel) {
            0 => None,
            block => {
                log::debug!("allocation table from the spare block {block:#010x}");
                Some(VirtualAddress::new(block))
            }
        }
    }

    /// Put a metadata block aside for when the metadata source is busy.
    ///
    /// Call this where waiting for the metadata source is safe, never on the
    /// page-fault path. Returns whether a spare is in place afterwards.
    pub fn reserve_spare_block(&self) -> bool {
        if self.has_spare_block() {
            return true;
        }
        let Some(block) = self.metadata.allocate_block() else {
            log::warn!("no metadata block left to keep as a spare");
            return false;
        };
        if self
            .spare
            .compare_exchange(0, block.as_u32(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.metadata.free_block(block);
        }
        true
    }

    #[must_use]
    pub fn has_spare_block(&self) -> bool {
        self.spare.load(Ordering::Acquire) != 0
    }

    const fn block_of(&self, address: u32) -> u32 {
        (address - self.start) / self.block_size
    }

    fn address_of(&self, block: u32) -> A {
        A::from_u32(self.start + block * self.block_size)
    }

    fn contains(&self, address: u32) -> bool {
        address >= self.start && address <= self.end
    }

    /// The metadata coordinates of the block containing `address`.
    #[must_use]
    pub fn index_of(&self, address: A) -> Option<TableIndex> {
        let address = address.as_u32();
        if !self.contains(address) {
            return None;
        }
        let block = self.block_of(address);
        let g = block / self.allocation_table_entries_per_block;
        Some(TableIndex {
            reference_table_array_index: g / self.reference_table_entries_per_block,
            reference_table_index: g % self.reference_table_entries_per_block,
            allocation_table_index: block % self.allocation_table_entries_per_block,
        })
    }

    /// The first address of the block at `index`.
    #[must_use]
    pub fn address_of_index(&self, index: TableIndex) -> A {
        let g = index.reference_table_array_index * self.reference_table_entries_per_block
            + index.reference_table_index;
        self.address_of(g * self.allocation_table_entries_per_block + index.allocation_table_index)
    }

    /// Call `f(g, k_first, k_last)` for each allocation table overlapping the
    /// blocks `first..=last`.
    fn for_each_table(&self, first: u32, last: u32, mut f: impl FnMut(u32, u32, u32) -> bool) {
        let per = self.allocation_table_entries_per_block;
        let (g_first, g_last) = (first / per, last / per);
        for g in g_first..=g_last {
            let k_first = if g == g_first { first % per } else { 0 };
            let k_last = if g == g_last { last % per } else { per - 1 };
            if !f(g, k_first, k_last) {
                return;
            }
        }
    }

    /// Set use count and reservation of every block in `[start, end]`.
    ///
    /// Used at boot to take ranges out of circulation. Parts outside of the
    /// managed range are ignored.
    ///
    /// # Panics
    /// Fires [`KernelFault::InvalidArgument`] if `use_count` does not fit
    /// 15 bits.
    pub fn set_memory(&self, start: A, end: A, use_count: u16, reserved: bool) {
        if use_count > AllocationTableEntry::MAX_USE_COUNT {
            KernelFault::InvalidArgument("use count does not fit an allocation table entry").fire();
        }
        let start = start.as_u32().max(self.start);
        let end = end.as_u32().min(self.end);
        if start > end {
            return;
        }

        let value = AllocationTableEntry::new(use_count, reserved).0;
        self.for_each_table(self.block_of(start), self.block_of(end), |g, k_first, k_last| {
            let entry = self.reference_entry(g);
            let _guard = ShardGuard::acquire(entry);
            let table = self.materialize(entry);
            for k in k_first..=k_last {
                self.allocation_entry(table, k).store(value, Ordering::Release);
            }
            true
        });
    }

    /// The first free block at or after `address`.
    ///
    /// Shards locked by someone else are skipped, so under contention the
    /// result is not necessarily the lowest free block.
    pub fn allocate_block_after_address(&self, address: A) -> Option<A> {
        let address = address.as_u32().max(self.start);
        if address > self.end {
            return None;
        }

        let mut found = None;
        self.for_each_table(self.block_of(address), self.block_count - 1, |g, k_first, k_last| {
            let entry = self.reference_entry(g);
            if !ReferenceTableEntry(entry.load(Ordering::Relaxed)).is_installed() {
                return true;
            }
            let Some(_guard) = ShardGuard::try_acquire(entry) else {
                return true;
            };

            let table = self.materialize(entry);
            let free = (k_first..=k_last).find(|&k| {
                self.allocation_entry(table, k)
                    .compare_exchange(0, AllocationTableEntry::ONE_USE, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            });
            found = free.map(|k| g * self.allocation_table_entries_per_block + k);
            found.is_none()
        });

        found.map(|block| self.address_of(block))
    }

    /// Take one more reference on the block containing `address`.
    ///
    /// The reservation flag is not checked. Addresses outside the managed
    /// range are returned unchanged.
    pub fn allocate_block_at_address(&self, address: A) -> A {
        let a = address.as_u32();
        if !self.contains(a) {
            return address;
        }

        let block = self.block_of(a);
        let per = self.allocation_table_entries_per_block;
        let entry = self.reference_entry(block / per);
        let table = Self::table_of(entry).unwrap_or_else(|| {
            let _guard = ShardGuard::acquire(entry);
            self.materialize(entry)
        });

        let old = self
            .allocation_entry(table, block % per)
            .fetch_add(AllocationTableEntry::ONE_USE, Ordering::AcqRel);
        if old.wrapping_add(AllocationTableEntry::ONE_USE) <= old {
            KernelFault::PagingError("block has been referenced too often").fire();
        }
        self.address_of(block)
    }

    /// Drop one reference on the block containing `address`.
    ///
    /// # Panics
    /// Fires [`KernelFault::PagingError`] if the use count would drop below zero.
    pub fn free_block(&self, address: A) {
        let a = address.as_u32();
        if !self.contains(a) {
            return;
        }

        let block = self.block_of(a);
        let per = self.allocation_table_entries_per_block;
        let Some(table) = Self::table_of(self.reference_entry(block / per)) else {
            KernelFault::PagingError("use count underflow").fire();
        };
        let old = self
            .allocation_entry(table, block % per)
            .fetch_sub(AllocationTableEntry::ONE_USE, Ordering::AcqRel);
        if old.wrapping_sub(AllocationTableEntry::ONE_USE) >= old {
            KernelFault::PagingError("use count underflow").fire();
        }
    }

    /// State of the block containing `address`.
    #[must_use]
    pub fn block_state(&self, address: A) -> Option<AllocationTableEntry> {
        let a = address.as_u32();
        if !self.contains(a) {
            return None;
        }
        let block = self.block_of(a);
        let per = self.allocation_table_entries_per_block;
        let state = Self::table_of(self.reference_entry(block / per)).map_or(0, |table| {
            self.allocation_entry(table, block % per)
                .load(Ordering::Acquire)
        });
        Some(AllocationTableEntry(state))
    }

    /// Number of blocks covered by allocation table `g`.
    fn blocks_in_table(&self, g: u32) -> u32 {
        let per = self.allocation_table_entries_per_block;
        per.min(self.block_count - g * per)
    }

    /// Bytes in blocks that are neither used nor reserved.
    #[must_use]
    pub fn free_memory(&self) -> u64 {
        let free_blocks: u64 = (0..self.allocation_table_count)
            .map(|g| {
                let n = self.blocks_in_table(g);
                Self::table_of(self.reference_entry(g)).map_or(u64::from(n), |table| {
                    (0..n)
                        .filter(|&k| self.allocation_entry(table, k).load(Ordering::Relaxed) == 0)
                        .count() as u64
                })
            })
            .sum();
        free_blocks * u64::from(self.block_size)
    }

    #[must_use]
    pub fn total_memory(&self) -> u64 {
        u64::from(self.block_count) * u64::from(self.block_size)
    }

    #[must_use]
    pub fn start_address(&self) -> A {
        A::from_u32(self.start)
    }

    /// Last address of the managed range.
    #[must_use]
    pub fn end_address(&self) -> A {
        A::from_u32(self.end)
    }

    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub const fn allocation_table_count(&self) -> u32 {
        self.allocation_table_count
    }

    #[must_use]
    pub fn reference_table_size_in_blocks(&self) -> u32 {
        self.reference_table_array.len() as u32
    }

    #[must_use]
    pub const fn allocation_table_entries_per_block(&self) -> u32 {
        self.allocation_table_entries_per_block
    }

    #[must_use]
    pub const fn managed_memory_per_allocation_table(&self) -> u64 {
        self.managed_memory_per_allocation_table
    }

    /// Log the layout, and at trace level every reference entry and every
    /// used or reserved block.
    pub fn debug_log(&self) {
        log::debug!("start address: {:#010x}", self.start);
        log::debug!("end address: {:#010x}", self.end);
        log::debug!("block size: {}", self.block_size);
        log::debug!("memory size: {}", self.total_memory());
        log::debug!("block count: {}", self.block_count);
        log::debug!("bitmap block size: {}", self.metadata.block_size());
        log::debug!("allocation table count: {}", self.allocation_table_count);
        log::debug!("allocation table entries per block: {}", self.allocation_table_entries_per_block);
        log::debug!("managed memory per allocation table: {}", self.managed_memory_per_allocation_table);
        log::debug!("reference table entries per block: {}", self.reference_table_entries_per_block);
        log::debug!("reference table size in blocks: {}", self.reference_table_array.len());

        for g in 0..self.allocation_table_count {
            let entry = ReferenceTableEntry(self.reference_entry(g).load(Ordering::Relaxed));
            log::trace!(
                "reference {g:04}: allocation table {:#010x}, installed {}, locked {}",
                entry.address(),
                entry.is_installed(),
                entry.is_locked()
            );
            if entry.address() != 0 {
                self.log_allocation_table(g, VirtualAddress::new(entry.address()));
            }
        }
    }

    fn log_allocation_table(&self, g: u32, table: VirtualAddress) {
        for k in 0..self.blocks_in_table(g) {
            let entry = AllocationTableEntry(self.allocation_entry(table, k).load(Ordering::Relaxed));
            if entry.is_free() {
                continue;
            }
            log::trace!(
                "  {k:04} {}: used {}, reserved {}",
                self.address_of(g * self.allocation_table_entries_per_block + k),
                entry.use_count(),
                entry.is_reserved()
            );
        }
    }
}

impl<M: Mmu, A: BlockAddress> Drop for TableMemoryManager<'_, M, A> {
    fn drop(&mut self) {
        for g in 0..self.allocation_table_count {
            if let Some(table) = Self::table_of(self.reference_entry(g)) {
                self.metadata.free_block(table);
            }
        }
        for &block in &self.reference_table_array {
            self.metadata.free_block(block);
        }
        if let Some(block) = self.take_spare_block() {
            self.metadata.free_block(block);
        }
    }
}

impl<M: Mmu, A: BlockAddress> BlockMemoryManager for TableMemoryManager<'_, M, A> {
    type Address = A;

    fn allocate_block(&self) -> Option<A> {
        self.allocate_block_after_address(self.start_address())
    }

    fn free_block(&self, block: A) {
        Self::free_block(self, block);
    }

    fn free_memory(&self) -> u64 {
        Self::free_memory(self)
    }

    fn total_memory(&self) -> u64 {
        Self::total_memory(self)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }
}
