use crate::refcount::RefCountError;
use crate::vmm::context::ContextInner;
use crate::vmm::{ContextRef, MemoryRange, Vmm, VmmContext, VmmError, VmmFlags};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{Mmu, MmuFlags, PhysMapper};

/// How [`Vmm::clone_context`] duplicates resident private pages.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloneMode {
    /// Share frames read-only and copy on the first write.
    CopyOnWrite,
    /// Copy every resident page up front.
    Eager,
}

impl<M: Mmu, P: PhysMapper + Send + Sync> Vmm<M, P> {
    /// Duplicate a user context.
    ///
    /// Ranges are recreated one for one. Resident pages of private ranges are
    /// shared copy-on-write or copied, per [`VmmConfig::clone_mode`](crate::vmm::VmmConfig);
    /// `SHARED` ranges share their frames writable and `DEVICE` ranges map the
    /// same physical span. Pages not yet resident stay lazy in both.
    ///
    /// # Errors
    /// [`VmmError::KernelContext`] for the kernel context, or exhaustion; on
    /// failure the partial clone is destroyed and the source is unchanged
    /// apart from pages already write-protected, which the fault path
    /// restores on demand.
    pub fn clone_context(
        &self,
        src: &VmmContext<M::Directory>,
    ) -> Result<ContextRef<M::Directory>, VmmError> {
        if src.is_kernel() {
            return Err(VmmError::KernelContext);
        }
        let dst = self.create_context()?;

        let copied = src.lock().and_then(|src_inner| {
            let mut dst_inner = dst.lock()?;
            self.copy_ranges(&src_inner, &mut dst_inner)
        });

        match copied {
            Ok(pages) => {
                log::debug!(
                    "cloned context: {pages} resident page(s), {:?}",
                    self.config.clone_mode
                );
                Ok(dst)
            }
            Err(e) => {
                log::warn!("clone failed: {e}");
                if let Err(cleanup) = self.destroy_context(&dst) {
                    log::error!("discarding partial clone: {cleanup}");
                }
                Err(e)
            }
        }
    }

    /// Recreate every range of `src` in `dst`, returning how many resident
    /// pages were carried over.
    fn copy_ranges(
        &self,
        src: &ContextInner<M::Directory>,
        dst: &mut ContextInner<M::Directory>,
    ) -> Result<usize, VmmError> {
        let mut pages = 0;
        for range in src.ranges.iter() {
            dst.ranges.insert(range.clone(), &self.nodes)?;
            for page in range.pages() {
                let Some(t) = self.mmu.translate(src.directory, page) else {
                    continue;
                };
                self.clone_page(src, dst, range, page, t.phys, t.flags)?;
                pages += 1;
            }
        }
        Ok(pages)
    }

    fn clone_page(
        &self,
        src: &ContextInner<M::Directory>,
        dst: &ContextInner<M::Directory>,
        range: &MemoryRange,
        page: VirtualAddress,
        pa: PhysicalAddress,
        current: MmuFlags,
    ) -> Result<(), VmmError> {
        let current = current.difference(MmuFlags::PRESENT);

        if range.flags.contains(VmmFlags::DEVICE) {
            self.mmu.map(dst.directory, page, pa, current, &*self.pmm)?;
            return Ok(());
        }

        if range.flags.contains(VmmFlags::SHARED) {
            self.refs.increment(pa.frame())?;
            return self.map_counted(dst, page, pa, current);
        }

        if self.config.clone_mode == CloneMode::CopyOnWrite {
            match self.refs.increment(pa.frame()) {
                Ok(_) => {
                    let shared = range.protection.read_only();
                    if current.contains(MmuFlags::WRITABLE) {
                        self.mmu.set_flags(src.directory, page, shared)?;
                        self.mmu.invalidate(page);
                    }
                    return self.map_counted(dst, page, pa, shared);
                }
                Err(RefCountError::Overflow { frame }) => {
                    log::warn!("{frame:?} is shared too widely, copying {page:?} instead");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let copy = self.copy_frame(pa)?;
        self.map_counted(dst, page, copy, range.protection)
    }

    /// Map a frame the caller already holds a reference for, dropping that
    /// reference if the mapping fails.
    fn map_counted(
        &self,
        dst: &ContextInner<M::Directory>,
        page: VirtualAddress,
        pa: PhysicalAddress,
        flags: MmuFlags,
    ) -> Result<(), VmmError> {
        if let Err(e) = self.mmu.map(dst.directory, page, pa, flags, &*self.pmm) {
            self.put_frame(pa);
            return Err(e.into());
        }
        Ok(())
    }
}
