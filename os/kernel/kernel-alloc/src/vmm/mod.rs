//! # Virtual Memory Manager
//!
//! Owns every address space (*context*): its ordered range list and its
//! page-table directory. Page tables are only ever programmed through the
//! [`Mmu`] interface; backing frames come from the
//! [`PhysicalMemoryManager`] and are shared between contexts through the
//! [`FrameRefCounts`] table.
//!
//! ```text
//!   map / unmap / find_free / insert_range      clone        fault
//!              │                                  │            │
//!   ┌──────────▼──────────────────────────────────▼────────────▼─────┐
//!   │ VmmContext: SleepMutex { RangeMap, directory }                 │
//!   └──────────┬──────────────────────┬─────────────────────┬────────┘
//!              │                      │                     │
//!        PhysicalMemoryManager  FrameRefCounts          Mmu (page tables)
//! ```
//!
//! Range list nodes come from one slab cache over the direct map, never from
//! the global heap.
//!
//! ## Contexts
//! - The *kernel context* covers `KERNELSPACE_START..KERNELSPACE_END`. It is
//!   created by [`Vmm::init`], lives as long as the manager, and may be active
//!   on every core at once. Kernel memory is never demand-paged.
//! - *User contexts* cover `USERSPACE_START..USERSPACE_END` and share the
//!   kernel half of the kernel directory. A user context is active on at most
//!   one core.
//!
//! ## Frame ownership
//! Every resident anonymous or file-backed page holds one reference on its
//! frame. The frame returns to the allocator when the last mapping goes away.
//! Device ranges map frames the allocator does not own and are never counted.

mod access;
mod clone;
mod context;
mod fault;
mod map;
mod range;
mod special;

pub use crate::vmm::clone::CloneMode;
pub use crate::vmm::context::{ContextKind, ContextRef, VmmContext};
pub use crate::vmm::fault::{Access, FaultInfo, FaultOrigin};
pub use crate::vmm::range::{FileBacking, MappedFile, MemoryRange, PopulateError};

use crate::pmm::{PhysicalMemoryManager, PmmError, Zone};
use crate::refcount::{FrameRefCounts, RefCountError};
use crate::slab::{DirectMapPageSource, PageSource, SlabError};
use crate::vmm::context::ContextInner;
use crate::vmm::range::RangeNodes;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ptr::NonNull;
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::{KERNELSPACE_END, KERNELSPACE_START, MAX_CPUS};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{Mmu, MmuError, MmuFlags, PhysMapper};

bitflags::bitflags! {
    /// How a range is placed, populated and shared.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct VmmFlags: u32 {
        /// Back every page at map time instead of on first access.
        const ALLOCATE = 1 << 0;
        /// Place the range exactly at the hint or fail.
        const EXACT    = 1 << 1;
        /// Content comes from a [`MappedFile`].
        const FILE     = 1 << 2;
        /// Clones share the frames writable instead of copying them.
        const SHARED   = 1 << 3;
        /// Frames belong to a device; they are neither allocated nor counted.
        const DEVICE   = 1 << 4;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("invalid size {0:#x}")]
    InvalidSize(u64),
    #[error("address {0:?} is not page aligned")]
    Unaligned(VirtualAddress),
    #[error("flags {0:?} are not valid for this operation")]
    InvalidFlags(VmmFlags),
    #[error("{start:?}..{end:?} lies outside the context")]
    OutOfBounds {
        start: VirtualAddress,
        end: VirtualAddress,
    },
    #[error("{start:?}..{end:?} overlaps an existing range")]
    Overlap {
        start: VirtualAddress,
        end: VirtualAddress,
    },
    #[error("no free span of {size:#x} bytes")]
    NoSpace { size: u64 },
    #[error("requested address {0:?} is already in use")]
    AddressInUse(VirtualAddress),
    #[error("the operation is not permitted on the kernel context")]
    KernelContext,
    #[error("the context is active on another core")]
    ContextBusy,
    #[error("the context has been destroyed")]
    ContextDestroyed,
    #[error("fault at {address:?} cannot be resolved")]
    Unresolved { address: VirtualAddress },
    #[error(transparent)]
    Mmu(#[from] MmuError),
    #[error(transparent)]
    Pmm(#[from] PmmError),
    #[error(transparent)]
    RefCount(#[from] RefCountError),
    #[error(transparent)]
    Populate(#[from] PopulateError),
    #[error(transparent)]
    Slab(#[from] SlabError),
}

impl VmmError {
    /// Whether the failure is resource exhaustion rather than misuse.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::Pmm(PmmError::OutOfMemory { .. })
                | Self::Mmu(MmuError::OutOfMemory)
                | Self::Slab(SlabError::OutOfMemory)
        )
    }
}

/// Boot-time knobs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmmConfig {
    pub clone_mode: CloneMode,
    /// Number of cores; sizes the active-context table.
    pub cpus: usize,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            clone_mode: if cfg!(feature = "eager-clone") {
                CloneMode::Eager
            } else {
                CloneMode::CopyOnWrite
            },
            cpus: 1,
        }
    }
}

/// The virtual memory manager.
pub struct Vmm<M: Mmu, P: PhysMapper + Send + Sync> {
    pmm: Arc<PhysicalMemoryManager>,
    refs: FrameRefCounts,
    mmu: M,
    /// Range nodes. Its page source carries the direct map through which
    /// frames are read and written.
    nodes: RangeNodes<DirectMapPageSource<P>>,
    config: VmmConfig,
    kernel: ContextRef<M::Directory>,
    active: Box<[SpinLock<Option<ContextRef<M::Directory>>>]>,
}

impl<M: Mmu, P: PhysMapper + Send + Sync> Vmm<M, P> {
    /// Bring up physical memory management and the kernel context.
    ///
    /// # Errors
    /// When the memory map has no usable memory, or the range-node cache or
    /// kernel directory cannot be allocated.
    pub fn init(
        regions: &[MemoryRegion],
        mmu: M,
        mapper: P,
        config: VmmConfig,
    ) -> Result<Self, VmmError> {
        let pmm = Arc::new(PhysicalMemoryManager::new(regions)?);
        Self::with_pmm(pmm, mmu, mapper, config)
    }

    /// Like [`init`](Self::init) with an existing frame allocator, so other
    /// users (such as a [`DirectMapPageSource`](crate::slab::DirectMapPageSource))
    /// can share it.
    ///
    /// # Errors
    /// When the range-node cache or the kernel directory cannot be
    /// allocated.
    ///
    /// # Panics
    /// If `config.cpus` is zero or exceeds [`MAX_CPUS`].
    pub fn with_pmm(
        pmm: Arc<PhysicalMemoryManager>,
        mmu: M,
        mapper: P,
        config: VmmConfig,
    ) -> Result<Self, VmmError> {
        assert!(
            (1..=MAX_CPUS).contains(&config.cpus),
            "unsupported core count {}",
            config.cpus
        );

        let refs = FrameRefCounts::new(pmm.frame_limit());
        let nodes = RangeNodes::new(DirectMapPageSource::new(Arc::clone(&pmm), mapper))?;
        let directory = mmu.create_kernel_directory(&*pmm)?;
        let kernel = Arc::new(VmmContext::new(
            ContextKind::Kernel,
            VirtualAddress::new(KERNELSPACE_START),
            VirtualAddress::new(KERNELSPACE_END),
            directory,
        ));
        let active = (0..config.cpus)
            .map(|_| SpinLock::new(Some(kernel.clone())))
            .collect();

        log::info!(
            "vmm: kernel context {:?}..{:?}, directory {:?}, {} core(s), {:?} clone",
            kernel.start(),
            kernel.end(),
            directory,
            config.cpus,
            config.clone_mode
        );

        Ok(Self {
            pmm,
            refs,
            mmu,
            nodes,
            config,
            kernel,
            active,
        })
    }

    #[inline]
    #[must_use]
    pub const fn pmm(&self) -> &Arc<PhysicalMemoryManager> {
        &self.pmm
    }

    #[inline]
    #[must_use]
    pub const fn refcounts(&self) -> &FrameRefCounts {
        &self.refs
    }

    #[inline]
    #[must_use]
    pub const fn mmu(&self) -> &M {
        &self.mmu
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &VmmConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub const fn kernel_context(&self) -> &ContextRef<M::Directory> {
        &self.kernel
    }

    /// `ctx`, or the kernel context for `None`.
    #[inline]
    fn resolve<'a>(
        &'a self,
        ctx: Option<&'a VmmContext<M::Directory>>,
    ) -> &'a VmmContext<M::Directory> {
        ctx.unwrap_or(&*self.kernel)
    }

    /// The 4 KiB frame at `pa` as bytes.
    ///
    /// # Safety
    /// The frame must be allocated to the caller, which must hold the lock
    /// serializing access to it, and the slice must not outlive either.
    #[allow(clippy::mut_from_ref, clippy::cast_possible_truncation)]
    unsafe fn frame_bytes(&self, pa: PhysicalAddress) -> &mut [u8] {
        let ptr = self.nodes.mapper().phys_to_ptr(pa);
        unsafe { core::slice::from_raw_parts_mut(ptr, PAGE_SIZE as usize) }
    }

    /// Allocate a frame and fill it with the content `range` should have at
    /// `page`: file data or zeroes. The frame's count is set to one.
    fn fresh_frame(
        &self,
        range: &MemoryRange,
        page: VirtualAddress,
    ) -> Result<PhysicalAddress, VmmError> {
        let pa = self.pmm.allocate_page(Zone::Default)?;
        let bytes = unsafe { self.frame_bytes(pa) };

        let filled = match (&range.file, range.file_offset(page)) {
            (Some(backing), Some(offset)) => backing.file.populate(offset, bytes),
            _ => {
                bytes.fill(0);
                Ok(())
            }
        };
        if let Err(e) = filled {
            self.pmm.free_page(pa);
            return Err(e.into());
        }

        if let Err(e) = self.refs.set(pa.frame(), 1) {
            self.pmm.free_page(pa);
            return Err(e.into());
        }
        Ok(pa)
    }

    /// A new frame, counted once, holding a copy of the frame at `from`.
    fn copy_frame(&self, from: PhysicalAddress) -> Result<PhysicalAddress, VmmError> {
        let copy = self.pmm.allocate_page(Zone::Default)?;
        unsafe {
            let src = self.frame_bytes(from);
            self.frame_bytes(copy).copy_from_slice(src);
        }
        if let Err(e) = self.refs.set(copy.frame(), 1) {
            self.pmm.free_page(copy);
            return Err(e.into());
        }
        Ok(copy)
    }

    /// Back `page` of `range` with a fresh frame and map it.
    fn populate_page(
        &self,
        inner: &ContextInner<M::Directory>,
        range: &MemoryRange,
        page: VirtualAddress,
    ) -> Result<PhysicalAddress, VmmError> {
        let pa = self.fresh_frame(range, page)?;
        if let Err(e) = self
            .mmu
            .map(inner.directory, page, pa, range.protection, &*self.pmm)
        {
            self.put_frame(pa);
            return Err(e.into());
        }
        log::trace!("populated {page:?} with {pa:?}");
        Ok(pa)
    }

    /// Drop one reference on the frame at `pa`, freeing it at zero.
    fn put_frame(&self, pa: PhysicalAddress) {
        let frame = pa.frame();
        match self.refs.decrement(frame) {
            Ok(0) => self.pmm.free_page(frame.base()),
            Ok(_) => {}
            Err(e) => log::warn!("releasing {frame:?}: {e}"),
        }
    }

    /// Remove the translation of `page` and release what it pointed to.
    fn release_page(&self, directory: M::Directory, page: VirtualAddress, device: bool) {
        let Some(pa) = self.mmu.unmap(directory, page) else {
            return;
        };
        self.mmu.invalidate(page);
        if !device {
            self.put_frame(pa);
        }
    }

    /// Release every page of `range`.
    fn release_range(&self, directory: M::Directory, range: &MemoryRange) {
        let device = range.flags.contains(VmmFlags::DEVICE);
        for page in range.pages() {
            self.release_page(directory, page, device);
        }
    }
}

/// Kernel-context pages for slab caches created after the VMM is up.
impl<M, P> PageSource for Vmm<M, P>
where
    M: Mmu + Send + Sync,
    P: PhysMapper + Send + Sync,
{
    fn allocate_pages(&self, bytes: usize) -> Option<NonNull<u8>> {
        let va = self
            .map(
                None,
                None,
                bytes as u64,
                VmmFlags::ALLOCATE,
                MmuFlags::WRITABLE | MmuFlags::NO_EXECUTE,
            )
            .inspect_err(|e| log::debug!("kernel page source: {e}"))
            .ok()?;
        NonNull::new(va.as_mut_ptr())
    }

    unsafe fn release_pages(&self, ptr: NonNull<u8>, bytes: usize) {
        let va = VirtualAddress::from_ptr(ptr.as_ptr());
        if let Err(e) = self.unmap(None, va, bytes as u64) {
            log::error!("releasing kernel pages at {va:?}: {e}");
        }
    }
}
