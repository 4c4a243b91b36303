use crate::pmm::{PhysicalMemoryManager, Zone};
use alloc::sync::Arc;
use core::ptr::NonNull;
use kernel_memory_addresses::PAGE_SIZE;
use kernel_vmem::PhysMapper;

/// Where a slab cache gets its backing pages from.
///
/// `bytes` is always a multiple of [`PAGE_SIZE`]. Returned memory must be
/// page-aligned, readable and writable.
pub trait PageSource: Send + Sync {
    fn allocate_pages(&self, bytes: usize) -> Option<NonNull<u8>>;

    /// # Safety
    /// `ptr` and `bytes` must describe exactly one earlier
    /// [`allocate_pages`](Self::allocate_pages) result that is no longer used.
    unsafe fn release_pages(&self, ptr: NonNull<u8>, bytes: usize);
}

impl<S: PageSource + ?Sized> PageSource for &S {
    fn allocate_pages(&self, bytes: usize) -> Option<NonNull<u8>> {
        (**self).allocate_pages(bytes)
    }

    unsafe fn release_pages(&self, ptr: NonNull<u8>, bytes: usize) {
        unsafe { (**self).release_pages(ptr, bytes) }
    }
}

impl<S: PageSource + ?Sized> PageSource for Arc<S> {
    fn allocate_pages(&self, bytes: usize) -> Option<NonNull<u8>> {
        (**self).allocate_pages(bytes)
    }

    unsafe fn release_pages(&self, ptr: NonNull<u8>, bytes: usize) {
        unsafe { (**self).release_pages(ptr, bytes) }
    }
}

/// Physically contiguous frames reached through the direct map.
///
/// Used by caches that exist before the kernel context does, such as the
/// caches backing the virtual memory manager itself.
pub struct DirectMapPageSource<P: PhysMapper> {
    pmm: Arc<PhysicalMemoryManager>,
    mapper: P,
}

impl<P: PhysMapper> DirectMapPageSource<P> {
    pub const fn new(pmm: Arc<PhysicalMemoryManager>, mapper: P) -> Self {
        Self { pmm, mapper }
    }

    #[inline]
    pub const fn mapper(&self) -> &P {
        &self.mapper
    }
}

impl<P: PhysMapper + Send + Sync> PageSource for DirectMapPageSource<P> {
    fn allocate_pages(&self, bytes: usize) -> Option<NonNull<u8>> {
        #[allow(clippy::cast_possible_truncation)]
        let pages = bytes.div_ceil(PAGE_SIZE as usize);
        let pa = self.pmm.allocate_pages(pages, Zone::Default).ok()?;
        NonNull::new(self.mapper.phys_to_ptr(pa))
    }

    unsafe fn release_pages(&self, ptr: NonNull<u8>, bytes: usize) {
        let Some(pa) = self.mapper.ptr_to_phys(ptr.as_ptr()) else {
            log::error!("slab pages at {ptr:p} are not in the direct map");
            panic!("releasing slab pages outside the direct map");
        };
        #[allow(clippy::cast_possible_truncation)]
        let pages = bytes.div_ceil(PAGE_SIZE as usize);
        self.pmm.free_pages(pa, pages);
    }
}
