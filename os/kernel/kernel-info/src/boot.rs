//! # Kernel Boot Information
//!
//! The boot loader speaks Multiboot2. The kernel entry copies the memory-map
//! tag into [`MemoryMapEntry`] values and describes its own image with
//! [`KernelImage`] before handing a [`BootInfo`] to the bootstrap code.

use kernel_memory_addresses::PhysicalAddress;

/// Value of `eax` when a Multiboot2 compliant loader jumps to the kernel.
pub const MULTIBOOT2_BOOTLOADER_MAGIC: u32 = 0x36D7_6289;

/// Tag type of the Multiboot2 memory map.
pub const MULTIBOOT2_TAG_MEMORY_MAP: u32 = 6;

/// Tag type terminating the Multiboot2 tag list.
pub const MULTIBOOT2_TAG_END: u32 = 0;

/// One entry of the Multiboot2 memory map, laid out as the loader writes it.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryMapEntry {
    /// Physical start address.
    pub address: u64,
    /// Length in bytes.
    pub length: u64,
    /// Raw type tag, see [`MemoryKind`].
    pub kind: u32,
    pub reserved: u32,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(address: u64, length: u64, kind: MemoryKind) -> Self {
        Self {
            address,
            length,
            kind: kind.as_raw(),
            reserved: 0,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> MemoryKind {
        MemoryKind::from_raw(self.kind)
    }

    /// Exclusive end address.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.address.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self.kind(), MemoryKind::Available)
    }
}

/// Multiboot2 memory types.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryKind {
    Available,
    Reserved,
    AcpiReclaimable,
    Nvs,
    BadRam,
    Unknown(u32),
}

impl MemoryKind {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Available,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::Nvs,
            5 => Self::BadRam,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Available => 1,
            Self::Reserved => 2,
            Self::AcpiReclaimable => 3,
            Self::Nvs => 4,
            Self::BadRam => 5,
            Self::Unknown(raw) => raw,
        }
    }
}

/// Physical bounds of the loaded kernel image, `[start, end)`.
///
/// Sourced from the `KERNEL_DATA_START` and `KERNEL_DATA_END` linker symbols.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelImage {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

/// Everything the memory bootstrap consumes from the boot loader.
#[derive(Debug, Copy, Clone)]
pub struct BootInfo<'a> {
    pub memory_map: &'a [MemoryMapEntry],
    pub kernel: KernelImage,
}
