//! # HHDM-based [`PhysMapper`]
//!
//! The loader maps all of physical memory at [`HHDM_BASE`]. Touching a frame
//! is then a matter of adding that base; turning a direct-map pointer back
//! into a physical address subtracts it.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_info::memory::HHDM_BASE;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::PhysMapper;
//!
//! let p = HhdmPhysMapper.phys_to_ptr(PhysicalAddress::new(0x1234_0000));
//! assert_eq!(p as u64, HHDM_BASE + 0x1234_0000);
//! assert_eq!(HhdmPhysMapper.ptr_to_phys(p), Some(PhysicalAddress::new(0x1234_0000)));
//! ```

use kernel_info::memory::{HHDM_BASE, KERNELSPACE_START};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for kernels with a higher-half direct map.
///
/// # Safety
/// Dereferencing the returned pointers is only sound while the direct map is
/// present and covers the referenced frame.
#[derive(Copy, Clone, Debug, Default)]
pub struct HhdmPhysMapper;

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (HHDM_BASE + pa.as_u64()) as *mut u8
    }

    #[inline]
    fn ptr_to_phys(&self, ptr: *const u8) -> Option<PhysicalAddress> {
        let va = ptr as u64;
        (HHDM_BASE..KERNELSPACE_START)
            .contains(&va)
            .then(|| PhysicalAddress::new(va - HHDM_BASE))
    }
}
