//! The error code the processor pushes with a page fault (#PF).

use bitfield_struct::bitfield;

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// The page was present: the access broke its protection. Clear for a
    /// missing page.
    pub protection_violation: bool,

    /// The access was a write.
    pub write: bool,

    /// The access came from ring 3.
    pub user: bool,

    /// A reserved bit was set in a paging-structure entry.
    pub reserved_bit: bool,

    /// The access was an instruction fetch.
    pub instruction_fetch: bool,

    #[bits(27)]
    __: u32,
}

impl PageFaultError {
    /// A kernel read of a page that is not mapped.
    #[must_use]
    pub const fn missing_page() -> Self {
        Self::new()
    }
}
