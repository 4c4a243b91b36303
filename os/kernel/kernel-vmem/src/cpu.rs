//! Privileged CPU instructions used by the page-table backend.
//!
//! Only bare-metal x86-64 builds execute them; hosted builds (tests, tools)
//! get inert stand-ins so the page-table logic can run against simulated RAM.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    /// Load CR3 with the physical address of a PML4.
    ///
    /// # Safety
    /// The new hierarchy must map the executing code and stack.
    #[inline]
    pub unsafe fn write_cr3(pml4: u64) {
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) pml4, options(nostack, preserves_flags));
        }
    }

    /// Drop the TLB entry covering `va` on this core.
    #[inline]
    pub fn invlpg(va: u64) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
    #[inline]
    pub const unsafe fn write_cr3(_pml4: u64) {}

    #[inline]
    pub const fn invlpg(_va: u64) {}
}

pub use imp::{invlpg, write_cr3};
