//! Queries over the boot loader's memory map.

use kernel_info::boot::MemoryMapEntry;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::PhysicalAddress;

/// Everything at or above 4 GiB is out of reach without PAE.
pub const ADDRESSABLE_LIMIT: u64 = 1 << 32;

/// First address past the highest available memory, capped at 4 GiB.
#[must_use]
pub fn memory_end(map: &[MemoryMapEntry]) -> u64 {
    map.iter()
        .filter(|e| e.is_available())
        .map(MemoryMapEntry::end)
        .max()
        .unwrap_or(0)
        .min(ADDRESSABLE_LIMIT)
}

/// A page-aligned run of `size` available bytes at or above `above`.
#[must_use]
pub fn find_region(map: &[MemoryMapEntry], above: u64, size: u32) -> Option<PhysicalAddress> {
    let page = u64::from(PAGE_SIZE);
    map.iter().filter(|e| e.is_available()).find_map(|e| {
        let start = e.address.max(above).checked_add(page - 1)? & !(page - 1);
        let end = start.checked_add(u64::from(size))?;
        if end > e.end() || end > ADDRESSABLE_LIMIT {
            return None;
        }
        u32::try_from(start).ok().map(PhysicalAddress::new)
    })
}

/// Call `f(start, end)` for every gap in `[0, limit)` no available entry
/// covers. `end` is exclusive.
pub fn for_each_hole(map: &[MemoryMapEntry], limit: u64, mut f: impl FnMut(u64, u64)) {
    let available = || map.iter().filter(|e| e.is_available() && e.length > 0);

    let mut cursor = 0;
    while cursor < limit {
        if let Some(covering) = available()
            .filter(|e| e.address <= cursor && e.end() > cursor)
            .map(MemoryMapEntry::end)
            .max()
        {
            cursor = covering;
            continue;
        }

        let next = available()
            .map(|e| e.address)
            .filter(|&a| a > cursor)
            .min()
            .unwrap_or(limit)
            .min(limit);
        f(cursor, next);
        cursor = next;
    }
}
