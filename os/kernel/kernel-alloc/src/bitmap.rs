//! # Bitmap Memory Manager
//!
//! One bit per block over `[start, start + size)`, first fit. Used as the raw
//! page source of the paging area and wherever a small, flat range of
//! kernel-virtual pages needs handing out.

use crate::block::{BlockAddress, BlockMemoryManager};
use alloc::boxed::Box;
use alloc::vec;
use kernel_sync::SpinLock;

struct Bitmap {
    /// Bit set = block in use.
    words: Box<[u32]>,
    free_blocks: u32,
    /// Words below this index are known to be full.
    search_from: usize,
}

pub struct BitmapMemoryManager<A: BlockAddress> {
    start: A,
    block_size: u32,
    block_count: u32,
    bitmap: SpinLock<Bitmap>,
}

impl<A: BlockAddress> BitmapMemoryManager<A> {
    /// Manage `size` bytes from `start` in blocks of `block_size`.
    ///
    /// # Panics
    /// If `block_size` is zero or `start` is not block aligned.
    #[must_use]
    pub fn new(start: A, size: u32, block_size: u32) -> Self {
        assert!(block_size > 0 && start.as_u32().is_multiple_of(block_size));
        let block_count = size / block_size;
        let words = vec![0u32; block_count.div_ceil(32) as usize].into_boxed_slice();

        let bitmap = Bitmap {
            words,
            free_blocks: block_count,
            search_from: 0,
        };

        // Padding bits past the last block are permanently used.
        let mut manager = Self {
            start,
            block_size,
            block_count,
            bitmap: SpinLock::new(bitmap),
        };
        let tail = block_count % 32;
        if tail != 0 {
            let bitmap = manager.bitmap.get_mut();
            if let Some(last) = bitmap.words.last_mut() {
                *last = !0 << tail;
            }
        }
        manager
    }

    #[must_use]
    pub const fn start(&self) -> A {
        self.start
    }

    /// First address past the managed range.
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.start.as_u32()) + u64::from(self.block_count) * u64::from(self.block_size)
    }

    fn block_index(&self, address: A) -> Option<u32> {
        let a = address.as_u32();
        if a < self.start.as_u32() || u64::from(a) >= self.end() {
            return None;
        }
        Some((a - self.start.as_u32()) / self.block_size)
    }

    fn address_of(&self, index: u32) -> A {
        A::from_u32(self.start.as_u32() + index * self.block_size)
    }

    /// Take the block containing `address` out of circulation.
    ///
    /// Returns `false` if it was already in use or lies outside the range.
    pub fn mark_used(&self, address: A) -> bool {
        let Some(index) = self.block_index(address) else {
            return false;
        };
        let mut bitmap = self.bitmap.lock();
        let (word, bit) = ((index / 32) as usize, index % 32);
        if bitmap.words[word] & (1 << bit) != 0 {
            return false;
        }
        bitmap.words[word] |= 1 << bit;
        bitmap.free_blocks -= 1;
        true
    }

    /// Whether the block containing `address` is handed out.
    #[must_use]
    pub fn is_used(&self, address: A) -> bool {
        self.block_index(address).is_some_and(|index| {
            let bitmap = self.bitmap.lock();
            bitmap.words[(index / 32) as usize] & (1 << (index % 32)) != 0
        })
    }
}

impl<A: BlockAddress> BlockMemoryManager for BitmapMemoryManager<A> {
    type Address = A;

    fn allocate_block(&self) -> Option<A> {
        let mut bitmap = self.bitmap.lock();
        let from = bitmap.search_from;
        let (word, bits) = bitmap
            .words
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, w)| **w != u32::MAX)
            .map(|(i, w)| (i, *w))?;

        let bit = bits.trailing_ones();
        bitmap.words[word] |= 1 << bit;
        bitmap.free_blocks -= 1;
        bitmap.search_from = word;
        drop(bitmap);

        #[allow(clippy::cast_possible_truncation)]
        Some(self.address_of(word as u32 * 32 + bit))
    }

    fn free_block(&self, block: A) {
        let Some(index) = self.block_index(block) else {
            log::warn!("ignoring free of {block} outside of the bitmap range");
            return;
        };

        let mut bitmap = self.bitmap.lock();
        let word = (index / 32) as usize;
        let mask = 1 << (index % 32);
        if bitmap.words[word] & mask == 0 {
            log::warn!("ignoring double free of {block}");
            return;
        }
        bitmap.words[word] &= !mask;
        bitmap.free_blocks += 1;
        bitmap.search_from = bitmap.search_from.min(word);
    }

    fn free_memory(&self) -> u64 {
        u64::from(self.bitmap.lock().free_blocks) * u64::from(self.block_size)
    }

    fn total_memory(&self) -> u64 {
        u64::from(self.block_count) * u64::from(self.block_size)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }
}
