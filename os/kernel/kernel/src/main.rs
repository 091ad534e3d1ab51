//! # Kernel Entry Point
//!
//! A Multiboot2 loader jumps to [`_start`] in 32-bit protected mode with
//! paging off, the magic in `eax` and the boot information in `ebx`. The
//! entry sets up a stack, installs the QEMU logger, copies the memory map
//! and hands over to the memory bootstrap.
//!
//! Built for any other target, this is an empty program so that the
//! workspace builds and tests on the host.

#![cfg_attr(all(target_arch = "x86", target_os = "none"), no_std, no_main)]
#![allow(unsafe_code)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod allocator;
#[cfg_attr(not(all(target_arch = "x86", target_os = "none")), allow(dead_code))]
mod multiboot;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod entry {
    use crate::allocator::{HEAP, MMU};
    use crate::multiboot::MemoryMap;
    use kernel_info::boot::{BootInfo, KernelImage, MULTIBOOT2_BOOTLOADER_MAGIC};
    use kernel_info::fault::KernelFault;
    use kernel_memory_addresses::PhysicalAddress;
    use kernel_qemu::QemuLogger;
    use log::LevelFilter;

    const LOG_LEVEL: LevelFilter = LevelFilter::Debug;

    const BOOT_STACK_SIZE: usize = 64 * 1024;

    const MULTIBOOT2_HEADER_MAGIC: u32 = 0xE852_50D6;
    const MULTIBOOT2_ARCHITECTURE_I386: u32 = 0;

    #[repr(C, align(8))]
    struct Multiboot2Header {
        magic: u32,
        architecture: u32,
        header_length: u32,
        checksum: u32,
        /// Type, flags and size of the end tag.
        end_tag: [u32; 2],
    }

    #[allow(clippy::cast_possible_truncation)]
    const HEADER_LENGTH: u32 = size_of::<Multiboot2Header>() as u32;

    #[used]
    #[unsafe(link_section = ".multiboot2")]
    static MULTIBOOT2_HEADER: Multiboot2Header = Multiboot2Header {
        magic: MULTIBOOT2_HEADER_MAGIC,
        architecture: MULTIBOOT2_ARCHITECTURE_I386,
        header_length: HEADER_LENGTH,
        checksum: 0u32
            .wrapping_sub(MULTIBOOT2_HEADER_MAGIC)
            .wrapping_sub(MULTIBOOT2_ARCHITECTURE_I386)
            .wrapping_sub(HEADER_LENGTH),
        end_tag: [0, 8],
    };

    /// 16-byte aligned stack
    #[repr(align(16))]
    struct Aligned<const N: usize>([u8; N]);

    #[unsafe(link_section = ".bss.boot")]
    #[unsafe(no_mangle)]
    static mut BOOT_STACK: Aligned<BOOT_STACK_SIZE> = Aligned([0; BOOT_STACK_SIZE]);

    unsafe extern "C" {
        /// First byte of the loaded image, from the linker script.
        safe static KERNEL_DATA_START: u8;
        /// First byte past the loaded image, `.bss` included.
        safe static KERNEL_DATA_END: u8;
    }

    /// The kernel entry point.
    ///
    /// # Naked function & Stack
    /// The loader gives us no stack, so this sets one up before any Rust code
    /// runs and passes `eax` and `ebx` on to [`kernel_entry`] as cdecl
    /// arguments.
    #[unsafe(no_mangle)]
    #[unsafe(naked)]
    pub extern "C" fn _start() -> ! {
        core::arch::naked_asm!(
            "cli",
            "lea esp, [{stack} + {stack_size}]",
            "xor ebp, ebp",
            "push ebx",
            "push eax",
            "call {rust_entry}",
            "2:",
            "hlt",
            "jmp 2b",
            stack = sym BOOT_STACK,
            stack_size = const BOOT_STACK_SIZE,
            rust_entry = sym kernel_entry,
        );
    }

    extern "C" fn kernel_entry(magic: u32, info: *const u8) -> ! {
        if QemuLogger::new(LOG_LEVEL).init().is_err() {
            kernel_qemu::qemu_trace!("logger already installed\n");
        }
        log::info!("kernel reporting to QEMU");

        if magic != MULTIBOOT2_BOOTLOADER_MAGIC {
            log::error!("boot loader magic {magic:#010x}");
            KernelFault::InvalidArgument("not started by a Multiboot2 loader").fire();
        }
        let memory_map = match unsafe { MemoryMap::from_info(info) } {
            Ok(map) => map,
            Err(e) => {
                log::error!("{e}");
                KernelFault::InvalidArgument("unusable boot information").fire();
            }
        };
        memory_map.log();

        let kernel = KernelImage {
            start: image_address(&raw const KERNEL_DATA_START),
            end: image_address(&raw const KERNEL_DATA_END),
        };
        let boot = BootInfo {
            memory_map: memory_map.entries(),
            kernel,
        };

        let context = kernel_boot::enter(&MMU, &boot, &HEAP);
        let refilled = context.memory.refill_paging_area();
        log::debug!("paging area pool topped up by {refilled} pages");
        context.debug_log();

        log::info!("memory management is up, halting");
        halt()
    }

    fn image_address(symbol: *const u8) -> PhysicalAddress {
        match u32::try_from(symbol.addr()) {
            Ok(address) => PhysicalAddress::new(address),
            Err(_) => KernelFault::IllegalState("kernel image outside of 32-bit memory").fire(),
        }
    }

    fn halt() -> ! {
        loop {
            unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        log::error!("kernel panic: {info}");
        halt()
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn main() {
    eprintln!("the kernel image only runs on bare-metal i686; build it with --target i686-kernel.json");
}
