//! # Multiboot2 Boot Information
//!
//! The loader leaves a tag list in memory and its address in `ebx`:
//!
//! ```text
//! ┌────────────┬──────────┐
//! │ total_size │ reserved │  u32, u32
//! ├────────────┴──────────┤
//! │ tag (type, size, …)   │  8-byte aligned
//! │ tag …                 │
//! │ end tag (type 0)      │
//! └───────────────────────┘
//! ```
//!
//! Only the memory-map tag is of interest. Its entries are copied into a
//! fixed buffer, because the loader's memory is not reserved and nothing
//! can be allocated yet.

use kernel_info::boot::{MULTIBOOT2_TAG_END, MULTIBOOT2_TAG_MEMORY_MAP, MemoryKind, MemoryMapEntry};
use thiserror::Error;

/// Entries beyond this are dropped with a warning.
pub const MAX_MEMORY_MAP_ENTRIES: usize = 64;

const INFO_HEADER_SIZE: usize = 8;
const TAG_HEADER_SIZE: usize = 8;
const MEMORY_MAP_HEADER_SIZE: usize = 16;
const TAG_ALIGN: usize = 8;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum MultibootError {
    #[error("boot information is truncated at offset {0}")]
    Truncated(usize),
    #[error("boot information has no memory map")]
    NoMemoryMap,
    #[error("memory map entries of {0} bytes are not supported")]
    EntrySize(u32),
}

/// The memory map, copied out of the boot information.
#[derive(Debug, Clone)]
pub struct MemoryMap {
    entries: [MemoryMapEntry; MAX_MEMORY_MAP_ENTRIES],
    len: usize,
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, MultibootError> {
    bytes
        .get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(MultibootError::Truncated(at))
}

fn read_u64(bytes: &[u8], at: usize) -> Result<u64, MultibootError> {
    bytes
        .get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or(MultibootError::Truncated(at))
}

impl MemoryMap {
    /// Read the memory map from the boot information at `info`.
    ///
    /// # Safety
    /// `info` must point to a Multiboot2 boot information structure that
    /// stays intact for the duration of the call.
    ///
    /// # Errors
    /// See [`parse`](Self::parse).
    pub unsafe fn from_info(info: *const u8) -> Result<Self, MultibootError> {
        let total_size = unsafe { info.cast::<u32>().read_unaligned() };
        let bytes = unsafe { core::slice::from_raw_parts(info, total_size as usize) };
        Self::parse(bytes)
    }

    /// Copy the memory-map tag out of a boot information structure.
    ///
    /// # Errors
    /// [`MultibootError::Truncated`] if a tag runs past the end of `bytes`,
    /// [`MultibootError::NoMemoryMap`] if the end tag comes first, and
    /// [`MultibootError::EntrySize`] for entries smaller than
    /// [`MemoryMapEntry`].
    pub fn parse(bytes: &[u8]) -> Result<Self, MultibootError> {
        let total_size = (read_u32(bytes, 0)? as usize).min(bytes.len());
        let bytes = &bytes[..total_size];

        let mut offset = INFO_HEADER_SIZE;
        loop {
            let kind = read_u32(bytes, offset)?;
            let size = read_u32(bytes, offset + 4)? as usize;
            if kind == MULTIBOOT2_TAG_END {
                return Err(MultibootError::NoMemoryMap);
            }
            if size < TAG_HEADER_SIZE || offset + size > bytes.len() {
                return Err(MultibootError::Truncated(offset));
            }
            if kind == MULTIBOOT2_TAG_MEMORY_MAP {
                return Self::parse_tag(&bytes[offset..offset + size]);
            }
            offset += size.next_multiple_of(TAG_ALIGN);
        }
    }

    fn parse_tag(tag: &[u8]) -> Result<Self, MultibootError> {
        let entry_size = read_u32(tag, 8)?;
        if (entry_size as usize) < size_of::<MemoryMapEntry>() {
            return Err(MultibootError::EntrySize(entry_size));
        }

        let mut map = Self {
            entries: [MemoryMapEntry::new(0, 0, MemoryKind::Reserved); MAX_MEMORY_MAP_ENTRIES],
            len: 0,
        };
        let available = tag.len().saturating_sub(MEMORY_MAP_HEADER_SIZE);
        let count = available / entry_size as usize;
        for i in 0..count {
            let at = MEMORY_MAP_HEADER_SIZE + i * entry_size as usize;
            if map.len == MAX_MEMORY_MAP_ENTRIES {
                log::warn!("memory map has {count} entries, ignoring all past {MAX_MEMORY_MAP_ENTRIES}");
                break;
            }
            map.entries[map.len] = MemoryMapEntry {
                address: read_u64(tag, at)?,
                length: read_u64(tag, at + 8)?,
                kind: read_u32(tag, at + 16)?,
                reserved: 0,
            };
            map.len += 1;
        }
        Ok(map)
    }

    #[must_use]
    pub fn entries(&self) -> &[MemoryMapEntry] {
        &self.entries[..self.len]
    }

    pub fn log(&self) {
        for entry in self.entries() {
            log::debug!(
                "memory map: [{:#011x}, {:#011x}) {:?}",
                entry.address,
                entry.end(),
                entry.kind()
            );
        }
    }
}
