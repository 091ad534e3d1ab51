//! # QEMU Debug Console
//!
//! Routes the kernel's `log` output to QEMU's debug console so that the
//! memory bootstrap can be followed before any other output device exists.
//!
//! ## Architecture
//!
//! ```text
//! log::info!/debug!/…
//!     ↓
//! QemuLogger (log::Log)
//!     ↓
//! qemu_trace! → QemuSink (fmt::Write)
//!     ↓
//! dbg_putc() → I/O port 0x402
//!     ↓
//! qemu-system-i386 -debugcon stdio
//! ```
//!
//! * **Zero-Allocation**: Messages are formatted straight into the port, so
//!   logging works before the kernel heap exists.
//! * **Feature-Gated**: Without the `enabled` feature every write is a no-op.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::{LevelFilter, info};
//!
//! QemuLogger::new(LevelFilter::Debug).init().expect("logger initialization");
//! info!("Enabling paging");
//! ```
//!
//! On the host, capture the output with
//! `qemu-system-i386 -kernel kernel -debugcon stdio`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::QemuLogger;

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// QEMU's `-debugcon` I/O port.
    const DEBUG_CONSOLE_PORT: u16 = 0x402;

    /// Write one byte to the debug console.
    #[inline]
    pub fn dbg_putc(byte: u8) {
        #[cfg(target_arch = "x86")]
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") DEBUG_CONSOLE_PORT,
                in("al") byte,
                options(nomem, nostack, preserves_flags)
            );
        }
        #[cfg(not(target_arch = "x86"))]
        let _ = (DEBUG_CONSOLE_PORT, byte);
    }

    /// [`fmt::Write`] adapter over [`dbg_putc`].
    pub struct QemuSink;

    impl Write for QemuSink {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            s.bytes().for_each(dbg_putc);
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // The sink never fails.
        let _ = QemuSink.write_fmt(args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(_: fmt::Arguments) {}
}

#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
