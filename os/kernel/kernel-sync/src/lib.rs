//! # Kernel synchronization primitives
//!
//! A spin lock with a non-blocking [`SpinLock::try_lock`] for sharded
//! allocators, and a once cell for kernel-lifetime singletons.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;
mod sync_once_cell;

pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
