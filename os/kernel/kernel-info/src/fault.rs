//! # Fatal Kernel Faults
//!
//! A broken memory-management invariant leaves nothing to recover, so these
//! errors are never returned. [`KernelFault::fire`] logs the diagnostic and
//! panics; the kernel's panic handler halts the machine.

use thiserror::Error;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum KernelFault {
    /// Bad construction parameters or a request no caller may make.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// No physical frame is left where the caller cannot proceed without one.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
    /// The paging-area pool ran dry.
    #[error("out of paging memory: {0}")]
    OutOfPagingMemory(&'static str),
    /// Double mapping, use-count wrap or page-table corruption.
    #[error("paging error: {0}")]
    PagingError(&'static str),
    /// An operation outside of its valid lifecycle window.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    /// An access through a null pointer.
    #[error("null pointer access: {0}")]
    NullPointer(&'static str),
}

impl KernelFault {
    /// Report the fault and stop.
    #[cold]
    #[track_caller]
    pub fn fire(self) -> ! {
        log::error!("{self}");
        panic!("{self}");
    }
}
