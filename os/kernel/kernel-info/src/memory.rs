//! # Memory Layout

pub use kernel_memory_addresses::PAGE_SIZE;

/// First address a user context may map. The page(s) below stay unmapped so
/// null dereferences always fault.
pub const USERSPACE_START: u64 = 0x0000_0000_0001_0000;

/// End (exclusive) of the user window.
pub const USERSPACE_END: u64 = 0x0000_7000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the span managed by the kernel context.
pub const KERNELSPACE_START: u64 = 0xffff_ff00_0000_0000;

/// End (exclusive) of the span managed by the kernel context.
///
/// The window covers exactly one top-level page-table slot so that the
/// intermediate table backing it can be shared by every address space.
pub const KERNELSPACE_END: u64 = 0xffff_ff80_0000_0000;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Largest number of frames tracked by one allocator section; bigger
/// regions are split so that unrelated allocations take different locks.
pub const PMM_SECTION_MAX_FRAMES: usize = 32 * 1024;

/// Number of object slots in one slab magazine.
pub const MAGAZINE_SIZE: usize = 8;

/// Completely free slabs a cache keeps around before handing pages back.
pub const SLAB_MAX_FREE: usize = 2;

/// Lower bound on objects carved out of one slab; the slab size is the
/// page-rounded size of this many objects.
pub const SLAB_MIN_OBJECTS: usize = 8;

/// Magazines preallocated per core for each slab cache.
pub const DEPOT_MAGAZINES_PER_CPU: usize = 4;

/// Upper bound on cores the per-core tables are sized for.
pub const MAX_CPUS: usize = 64;

const _: () = {
    assert!(USERSPACE_START.is_multiple_of(PAGE_SIZE));
    assert!(USERSPACE_END.is_multiple_of(PAGE_SIZE));
    assert!(USERSPACE_START < USERSPACE_END);
    assert!(HHDM_BASE >= USERSPACE_END);
    assert!(KERNELSPACE_START > HHDM_BASE);
    assert!(KERNELSPACE_END > KERNELSPACE_START);
    assert!(KERNEL_BASE >= KERNELSPACE_END);
    assert!(KERNELSPACE_END - KERNELSPACE_START == 1 << 39);
    assert!(KERNELSPACE_START.is_multiple_of(1 << 39));
    assert!(PMM_SECTION_MAX_FRAMES > 0);
    assert!(MAGAZINE_SIZE > 0);
    assert!(SLAB_MIN_OBJECTS > 0);
    assert!(MAX_CPUS > 0 && MAX_CPUS <= u16::MAX as usize);
};
