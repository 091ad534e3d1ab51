//! # Paging Area Manager
//!
//! Page tables and directories live in a dedicated virtual window. Pages of
//! that window are handed out from a small pool of pages that are already
//! backed by frames, so the page-fault path can get a page table without
//! scanning a bitmap or allocating a frame.
//!
//! The pool is topped up by [`refill_pool_with`](PagingAreaManager::refill_pool_with),
//! which draws fresh pages from the window's bitmap and lets the caller back
//! them. That belongs in a background task, never in the fault path.

use crate::bitmap::BitmapMemoryManager;
use crate::block::BlockMemoryManager;
use kernel_info::fault::KernelFault;
use kernel_info::memory::{PAGE_SIZE, PAGING_AREA_POOL_CAPACITY};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;

struct Pool {
    pages: [VirtualAddress; PAGING_AREA_POOL_CAPACITY],
    len: usize,
}

impl Pool {
    const fn new() -> Self {
        Self {
            pages: [VirtualAddress::zero(); PAGING_AREA_POOL_CAPACITY],
            len: 0,
        }
    }

    const fn is_full(&self) -> bool {
        self.len == PAGING_AREA_POOL_CAPACITY
    }

    fn push(&mut self, page: VirtualAddress) {
        self.pages[self.len] = page;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<VirtualAddress> {
        self.len = self.len.checked_sub(1)?;
        Some(self.pages[self.len])
    }
}

pub struct PagingAreaManager {
    window: BitmapMemoryManager<VirtualAddress>,
    pool: SpinLock<Pool>,
    /// Serializes refills; a page backed by one refill must not be backed again.
    refill: SpinLock<()>,
}

impl PagingAreaManager {
    /// Manage the page-sized blocks of `[window_start, window_start + window_size)`.
    ///
    /// The first `backed_pages` pages of the window are already backed by
    /// frames; the first `used_pages` of those hold the boot-time directory
    /// and page tables. The rest seed the pool.
    ///
    /// # Panics
    /// Fires [`KernelFault::InvalidArgument`] if the backed pages that are not
    /// in use exceed the pool capacity.
    #[must_use]
    pub fn new(window_start: VirtualAddress, window_size: u32, backed_pages: u32, used_pages: u32) -> Self {
        if used_pages > backed_pages
            || (backed_pages - used_pages) as usize > PAGING_AREA_POOL_CAPACITY
        {
            KernelFault::InvalidArgument("backed paging area does not fit the pool").fire();
        }

        let window = BitmapMemoryManager::new(window_start, window_size, PAGE_SIZE);
        let mut pool = Pool::new();
        for page in 0..backed_pages {
            let va = window_start + page * PAGE_SIZE;
            window.mark_used(va);
            if page >= used_pages {
                pool.push(va);
            }
        }

        log::debug!(
            "paging area at {window_start}: {} KiB, {} pages in the pool",
            window_size / 1024,
            pool.len
        );

        Self {
            window,
            pool: SpinLock::new(pool),
            refill: SpinLock::new(()),
        }
    }

    /// A backed page from the pool, or `None` if the pool is empty.
    pub fn allocate_block(&self) -> Option<VirtualAddress> {
        self.pool.lock().pop()
    }

    /// Return a page to the window. Its frame must have been released and its
    /// mapping removed.
    pub fn free_block(&self, page: VirtualAddress) {
        self.window.free_block(page);
    }

    /// Top up the pool, assuming the whole window is backed.
    pub fn refill_pool(&self) -> usize {
        self.refill_pool_with(|_| true)
    }

    /// Top up the pool with pages from the window.
    ///
    /// `back` is called for each new page and has to map it; returning
    /// `false` gives the page back and ends the refill. Returns the number of
    /// pages added. A refill already in progress elsewhere makes this a no-op.
    pub fn refill_pool_with(&self, mut back: impl FnMut(VirtualAddress) -> bool) -> usize {
        let Some(_refill) = self.refill.try_lock() else {
            return 0;
        };

        let mut added = 0;
        while !self.pool.lock().is_full() {
            let Some(page) = self.window.allocate_block() else {
                log::warn!("paging area window is exhausted");
                break;
            };
            if !back(page) {
                self.window.free_block(page);
                break;
            }

            // Only allocations happened since the check; there is room.
            self.pool.lock().push(page);
            added += 1;
        }

        if added > 0 {
            log::trace!("paging area pool refilled with {added} pages");
        }
        added
    }

    /// Pages currently in the pool.
    #[must_use]
    pub fn pool_len(&self) -> usize {
        self.pool.lock().len
    }

    #[must_use]
    pub fn window_start(&self) -> VirtualAddress {
        self.window.start()
    }

    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        va >= self.window.start() && u64::from(va.as_u32()) < self.window.end()
    }
}

impl BlockMemoryManager for PagingAreaManager {
    type Address = VirtualAddress;

    fn allocate_block(&self) -> Option<VirtualAddress> {
        Self::allocate_block(self)
    }

    fn free_block(&self, block: VirtualAddress) {
        Self::free_block(self, block);
    }

    /// Pages of the window that are free or waiting in the pool.
    fn free_memory(&self) -> u64 {
        self.window.free_memory() + self.pool_len() as u64 * u64::from(PAGE_SIZE)
    }

    fn total_memory(&self) -> u64 {
        self.window.total_memory()
    }

    fn block_size(&self) -> u32 {
        PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: u32 = 0x0020_0000;

    fn va(page: u32) -> VirtualAddress {
        VirtualAddress::new(WINDOW + page * PAGE_SIZE)
    }

    #[test]
    fn backed_pages_past_the_boot_tables_seed_the_pool() {
        let area = PagingAreaManager::new(va(0), 16 * PAGE_SIZE, 4, 2);
        assert_eq!(area.pool_len(), 2);
        assert_eq!(area.free_memory(), 14 * u64::from(PAGE_SIZE));

        let mut pages = [area.allocate_block().unwrap(), area.allocate_block().unwrap()];
        pages.sort();
        assert_eq!(pages, [va(2), va(3)]);
        assert_eq!(area.allocate_block(), None);
    }

    #[test]
    fn refill_backs_every_page_it_adds() {
        let area = PagingAreaManager::new(va(0), 16 * PAGE_SIZE, 1, 1);
        let mut backed = Vec::new();
        let added = area.refill_pool_with(|page| {
            backed.push(page);
            true
        });
        assert_eq!(added, 15);
        assert_eq!(backed.first(), Some(&va(1)));
        assert_eq!(area.pool_len(), 15);
        assert_eq!(area.refill_pool(), 0);
    }

    #[test]
    fn refused_pages_go_back_to_the_window() {
        let area = PagingAreaManager::new(va(0), 16 * PAGE_SIZE, 0, 0);
        let mut budget = 3;
        let added = area.refill_pool_with(|_| {
            budget -= 1;
            budget >= 0
        });
        assert_eq!(added, 3);
        assert_eq!(area.free_memory(), 16 * u64::from(PAGE_SIZE));

        // The refused page is handed out again by the next refill.
        let mut first = None;
        area.refill_pool_with(|page| {
            first = Some(page);
            false
        });
        assert_eq!(first, Some(va(3)));
    }

    #[test]
    fn the_pool_is_bounded() {
        let area = PagingAreaManager::new(va(0), 1024 * PAGE_SIZE, 0, 0);
        assert_eq!(area.refill_pool(), PAGING_AREA_POOL_CAPACITY);
        assert!(area.allocate_block().is_some());
        assert_eq!(area.refill_pool(), 1);
    }

    #[test]
    fn freed_pages_return_to_the_window() {
        let area = PagingAreaManager::new(va(0), 2 * PAGE_SIZE, 2, 0);
        let page = area.allocate_block().unwrap();
        assert_eq!(area.refill_pool(), 0);
        area.free_block(page);
        assert_eq!(area.refill_pool(), 1);
        assert!(area.contains(page));
        assert!(!area.contains(va(2)));
    }

    #[test]
    #[should_panic(expected = "invalid argument")]
    fn more_backed_pages_than_the_pool_holds_are_rejected() {
        let _ = PagingAreaManager::new(va(0), 1024 * PAGE_SIZE, 200, 0);
    }
}
