use crate::Mmu;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::cr0::Cr0;
use kernel_registers::cr3::Cr3;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// The processor's own MMU. Kernel-virtual addresses are dereferenced directly.
#[derive(Debug, Default, Copy, Clone)]
pub struct HardwareMmu;

impl Mmu for HardwareMmu {
    #[inline]
    fn virt_to_ptr<T>(&self, va: VirtualAddress) -> *mut T {
        core::ptr::with_exposed_provenance_mut(va.as_usize())
    }

    unsafe fn load_directory(&self, directory: PhysicalAddress) {
        unsafe { Cr3::from_directory_phys(directory, false, false).store_unsafe() };
    }

    unsafe fn enable_paging(&self) {
        unsafe {
            let cr0 = Cr0::load_unsafe();
            cr0.with_pg_paging(true).store_unsafe();
        }
    }

    fn paging_enabled(&self) -> bool {
        unsafe { Cr0::load_unsafe() }.pg_paging()
    }

    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_usize(), options(nostack, preserves_flags));
        }
    }
}
