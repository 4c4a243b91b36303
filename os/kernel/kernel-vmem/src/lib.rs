//! # Architecture MMU Interface
//!
//! The memory-management core programs translations exclusively through the
//! narrow [`Mmu`] interface defined here. Exactly one implementation is
//! compiled per target architecture; for x86-64 that is [`PageTableMmu`], a
//! four-level page-table walker.
//!
//! ## What you get
//! - [`Mmu`]: create/destroy a directory, map/unmap one page, query the
//!   resident translation, change protection, load a directory, and share the
//!   kernel half with a fresh directory.
//! - [`MmuFlags`]: architecture-neutral protection and cache-mode flags.
//! - [`FrameAlloc`] / [`PhysMapper`]: where page-table frames come from and
//!   how the kernel touches them.
//! - [`PageFaultErrorCode`]: the x86-64 `#PF` error code, decoded.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes (64 bits) each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//! ```
//!
//! Only 4 KiB leaves are ever installed: every PML4E, PDPTE and PDE points to
//! the next table, and every present PTE maps one frame.
//!
//! ## Sharing the kernel half
//!
//! The kernel context's window occupies whole PML4 slots. Their PDPTs are
//! allocated once, when the kernel directory is created, and every user
//! directory links the very same PDPTs. Kernel mappings made later are thus
//! visible in every address space without touching user directories.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod cpu;
mod fault_code;
mod flags;
mod page_entry_bits;
mod page_table;
mod page_table_mmu;

pub use crate::fault_code::PageFaultErrorCode;
pub use crate::flags::MmuFlags;
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{PageTable, TableLevel};
pub use crate::page_table_mmu::{PageTableMmu, RootTable};

use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Errors reported by an [`Mmu`] implementation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MmuError {
    /// No frame was available for an intermediate page table.
    #[error("out of memory for page tables")]
    OutOfMemory,
    /// The virtual address has no present translation.
    #[error("no translation for {0:?}")]
    NotMapped(VirtualAddress),
    /// The virtual address is not canonical.
    #[error("non-canonical address {0:?}")]
    NonCanonical(VirtualAddress),
    /// A virtual or physical address was not page aligned.
    #[error("unaligned address {0:#x}")]
    Unaligned(u64),
}

/// A resident translation as reported by [`Mmu::translate`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    /// Physical address of the queried byte (frame base plus in-page offset).
    pub phys: PhysicalAddress,
    /// Protection and cache flags of the leaf, always including
    /// [`MmuFlags::PRESENT`].
    pub flags: MmuFlags,
}

/// Source of **physical** 4 KiB frames for page tables.
///
/// Implementations use interior mutability; the physical memory manager hands
/// out frames concurrently to several directories.
pub trait FrameAlloc {
    /// Allocate one 4 KiB *physical* frame. Must return page-aligned frames.
    ///
    /// Returns `None` on out-of-memory.
    fn allocate_frame(&self) -> Option<PhysicalAddress>;

    /// Return a frame obtained from [`allocate_frame`](Self::allocate_frame).
    ///
    /// # Safety
    /// The frame must no longer be referenced by any page table.
    unsafe fn free_frame(&self, frame: PhysicalAddress);
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space (e.g., via identity map or a higher-half direct map, HHDM).
///
/// Typical patterns:
/// - **Kernel**: uses HHDM; adds a constant offset before returning a pointer.
/// - **Tests**: a heap buffer standing in for RAM.
pub trait PhysMapper {
    /// Pointer through which the byte at `pa` can be accessed.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// Inverse of [`phys_to_ptr`](Self::phys_to_ptr) for pointers into the
    /// mapped window; `None` for anything else.
    fn ptr_to_phys(&self, ptr: *const u8) -> Option<PhysicalAddress>;

    /// Borrow the bytes at `pa` as a `T`.
    ///
    /// # Safety
    /// - `pa` must be mapped writable through this mapper.
    /// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
    ///   for `'a` and no other reference may alias it.
    /// - Type `T` must match the bytes at `pa` and its alignment.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (**self).phys_to_ptr(pa)
    }

    #[inline]
    fn ptr_to_phys(&self, ptr: *const u8) -> Option<PhysicalAddress> {
        (**self).ptr_to_phys(ptr)
    }
}

/// The per-architecture page-table interface.
///
/// A *directory* is the opaque root of one address space. Implementations do
/// not track ownership of mapped frames; unmapping only reports which frame
/// was mapped so the caller can release it.
///
/// Mutating a directory is not internally synchronized: callers serialize all
/// changes to one directory (the VMM holds the owning context's mutex).
pub trait Mmu {
    /// Opaque page-table root handle.
    type Directory: Copy + Eq + fmt::Debug + Send + Sync;

    /// Create the kernel directory, pre-populating the shared kernel window.
    ///
    /// # Errors
    /// [`MmuError::OutOfMemory`] if a table frame cannot be allocated.
    fn create_kernel_directory<A: FrameAlloc + ?Sized>(
        &self,
        frames: &A,
    ) -> Result<Self::Directory, MmuError>;

    /// Create an empty directory.
    ///
    /// # Errors
    /// [`MmuError::OutOfMemory`] if the root frame cannot be allocated.
    fn create_directory<A: FrameAlloc + ?Sized>(
        &self,
        frames: &A,
    ) -> Result<Self::Directory, MmuError>;

    /// Link the kernel-only half of `kernel` into `into`.
    fn copy_kernel_mappings(&self, kernel: Self::Directory, into: Self::Directory);

    /// Release every table frame private to `dir`, including the root.
    ///
    /// Leaf frames are not touched.
    ///
    /// # Safety
    /// `dir` must not be loaded on any core and must not be used afterwards.
    unsafe fn destroy_directory<A: FrameAlloc + ?Sized>(&self, dir: Self::Directory, frames: &A);

    /// Install `va → pa`, replacing any previous translation of `va`.
    ///
    /// # Errors
    /// Alignment/canonical violations, or [`MmuError::OutOfMemory`] when an
    /// intermediate table cannot be allocated.
    fn map<A: FrameAlloc + ?Sized>(
        &self,
        dir: Self::Directory,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MmuFlags,
        frames: &A,
    ) -> Result<(), MmuError>;

    /// Clear the translation of `va` and return the frame it pointed to.
    fn unmap(&self, dir: Self::Directory, va: VirtualAddress) -> Option<PhysicalAddress>;

    /// Query the resident translation of `va`.
    fn translate(&self, dir: Self::Directory, va: VirtualAddress) -> Option<Translation>;

    /// Replace the protection flags of an existing translation, keeping the frame.
    ///
    /// # Errors
    /// [`MmuError::NotMapped`] if `va` has no translation.
    fn set_flags(
        &self,
        dir: Self::Directory,
        va: VirtualAddress,
        flags: MmuFlags,
    ) -> Result<(), MmuError>;

    /// Make `dir` the active directory of the calling core.
    ///
    /// # Safety
    /// The directory must map the currently executing kernel code and stack.
    unsafe fn load(&self, dir: Self::Directory);

    /// Drop any cached translation of `va` on the calling core.
    fn invalidate(&self, va: VirtualAddress);
}
