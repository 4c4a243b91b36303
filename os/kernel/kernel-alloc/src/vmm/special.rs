//! Kernel mappings drivers need: device registers and DMA buffers.
//!
//! Both live in the kernel context and are released with
//! [`Vmm::unmap`](crate::vmm::Vmm::unmap) like any other kernel range.

use crate::pmm::Zone;
use crate::vmm::{MemoryRange, Vmm, VmmError, VmmFlags};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, page_align_down};
use kernel_vmem::{Mmu, MmuFlags, PhysMapper};

impl<M: Mmu, P: PhysMapper + Send + Sync> Vmm<M, P> {
    /// Map the device span `[phys, phys + size)` into the kernel context.
    ///
    /// The returned address corresponds to `phys` itself, including its
    /// offset into the first page. `cache` selects the cache mode; without
    /// one the span is mapped uncached.
    ///
    /// # Errors
    /// [`VmmError::InvalidSize`], [`VmmError::NoSpace`], or page-table
    /// exhaustion (nothing stays mapped).
    pub fn mmio_map(
        &self,
        phys: PhysicalAddress,
        size: u64,
        cache: MmuFlags,
    ) -> Result<VirtualAddress, VmmError> {
        if size == 0 {
            return Err(VmmError::InvalidSize(size));
        }
        let offset = phys.page_offset();
        let base = PhysicalAddress::new(page_align_down(phys.as_u64()));
        let span = Self::page_round(size.saturating_add(offset))?;

        let cache = match cache.cache_mode() {
            m if m.is_empty() => MmuFlags::UNCACHED,
            m => m,
        };
        let protection = MmuFlags::WRITABLE | MmuFlags::NO_EXECUTE | cache;

        let ctx = &*self.kernel;
        let mut inner = ctx.lock()?;
        let start = Self::find_free_locked(ctx, &inner, None, span, false)?;
        let range = MemoryRange::new(start, start + span, VmmFlags::DEVICE, protection);
        inner.ranges.insert(range.clone(), &self.nodes)?;

        for (i, page) in range.pages().enumerate() {
            let pa = base + i as u64 * PAGE_SIZE;
            if let Err(e) = self.mmu.map(inner.directory, page, pa, protection, &*self.pmm) {
                self.release_range(inner.directory, &range);
                inner.ranges.remove(range.start, &self.nodes);
                return Err(e.into());
            }
        }

        log::debug!("mmio: {base:?} (+{span:#x}) at {start:?} {cache:?}");
        Ok(start + offset)
    }

    /// Allocate a physically contiguous, zeroed buffer of `size` bytes and map
    /// it into the kernel context.
    ///
    /// Returns the virtual address the kernel uses and the physical address
    /// to hand to the device.
    ///
    /// # Errors
    /// [`VmmError::InvalidSize`], [`VmmError::NoSpace`], or exhaustion of
    /// contiguous frames or page tables (nothing stays allocated).
    pub fn dma_map(&self, size: u64) -> Result<(VirtualAddress, PhysicalAddress), VmmError> {
        let span = Self::page_round(size)?;
        #[allow(clippy::cast_possible_truncation)]
        let count = (span / PAGE_SIZE) as usize;

        let phys = self.pmm.allocate_pages(count, Zone::Default)?;
        let frames = (0..count as u64).map(|i| phys + i * PAGE_SIZE);
        for pa in frames.clone() {
            unsafe { self.frame_bytes(pa) }.fill(0);
            if let Err(e) = self.refs.set(pa.frame(), 1) {
                self.discard_dma(phys, count);
                return Err(e.into());
            }
        }

        let ctx = &*self.kernel;
        let mut inner = ctx.lock()?;
        let mapped = Self::find_free_locked(ctx, &inner, None, span, false).and_then(|start| {
            let range = MemoryRange::new(
                start,
                start + span,
                VmmFlags::ALLOCATE,
                MmuFlags::WRITABLE | MmuFlags::NO_EXECUTE,
            );
            inner.ranges.insert(range.clone(), &self.nodes)?;
            for (page, pa) in range.pages().zip(frames) {
                let mapped = self.mmu.map(inner.directory, page, pa, range.protection, &*self.pmm);
                if let Err(e) = mapped {
                    for done in range.pages().take_while(|&p| p != page) {
                        self.mmu.unmap(inner.directory, done);
                        self.mmu.invalidate(done);
                    }
                    inner.ranges.remove(range.start, &self.nodes);
                    return Err(e.into());
                }
            }
            Ok(start)
        });

        match mapped {
            Ok(start) => {
                log::debug!("dma: {count} frame(s) at {phys:?} mapped at {start:?}");
                Ok((start, phys))
            }
            Err(e) => {
                drop(inner);
                self.discard_dma(phys, count);
                Err(e)
            }
        }
    }

    /// Return an unmapped DMA run to the allocator.
    fn discard_dma(&self, phys: PhysicalAddress, count: usize) {
        for i in 0..count as u64 {
            // Frames below the table limit always succeed.
            let _ = self.refs.set((phys + i * PAGE_SIZE).frame(), 0);
        }
        self.pmm.free_pages(phys, count);
    }
}
