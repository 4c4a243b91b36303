//! Software access to a context's memory through its page tables.
//!
//! Copies go page by page: translate, touch the frame through the physical
//! mapper, and on a miss run the fault path once before giving up. This is
//! what user-copy helpers build on.

use crate::vmm::{Access, FaultInfo, FaultOrigin, Vmm, VmmContext, VmmError};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::{Mmu, MmuFlags, PhysMapper};

impl<M: Mmu, P: PhysMapper + Send + Sync> Vmm<M, P> {
    /// Copy `buf.len()` bytes starting at `addr` in `ctx` into `buf`.
    ///
    /// # Errors
    /// [`VmmError::Unresolved`] at the first byte that cannot be read.
    pub fn read_bytes(
        &self,
        ctx: &VmmContext<M::Directory>,
        addr: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), VmmError> {
        let mut done = 0;
        while done < buf.len() {
            let va = Self::advance(addr, done)?;
            let chunk = Self::chunk(va, buf.len() - done);
            self.with_page(ctx, va, Access::Read, |bytes| {
                buf[done..done + chunk].copy_from_slice(&bytes[..chunk]);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Copy `data` into `ctx` starting at `addr`.
    ///
    /// Writes honor protection: a copy-on-write page is copied first, a
    /// read-only range is an error.
    ///
    /// # Errors
    /// [`VmmError::Unresolved`] at the first byte that cannot be written.
    pub fn write_bytes(
        &self,
        ctx: &VmmContext<M::Directory>,
        addr: VirtualAddress,
        data: &[u8],
    ) -> Result<(), VmmError> {
        let mut done = 0;
        while done < data.len() {
            let va = Self::advance(addr, done)?;
            let chunk = Self::chunk(va, data.len() - done);
            self.with_page(ctx, va, Access::Write, |bytes| {
                bytes[..chunk].copy_from_slice(&data[done..done + chunk]);
            })?;
            done += chunk;
        }
        Ok(())
    }

    fn advance(addr: VirtualAddress, by: usize) -> Result<VirtualAddress, VmmError> {
        addr.checked_add(by as u64)
            .ok_or(VmmError::Unresolved { address: addr })
    }

    /// Bytes from `va` to the end of its page, capped at `remaining`.
    #[allow(clippy::cast_possible_truncation)]
    const fn chunk(va: VirtualAddress, remaining: usize) -> usize {
        let in_page = (PAGE_SIZE - va.page_offset()) as usize;
        if in_page < remaining { in_page } else { remaining }
    }

    /// Run `f` on the bytes from `va` to the end of its page, faulting the
    /// page in (once) if the access is not possible yet.
    fn with_page(
        &self,
        ctx: &VmmContext<M::Directory>,
        va: VirtualAddress,
        access: Access,
        mut f: impl FnMut(&mut [u8]),
    ) -> Result<(), VmmError> {
        for attempt in 0..2 {
            {
                let inner = ctx.lock()?;
                if let Some(t) = self.mmu.translate(inner.directory, va) {
                    let allowed = access != Access::Write || t.flags.contains(MmuFlags::WRITABLE);
                    if allowed {
                        let frame = unsafe { self.frame_bytes(t.phys.frame().base()) };
                        #[allow(clippy::cast_possible_truncation)]
                        let offset = t.phys.page_offset() as usize;
                        f(&mut frame[offset..]);
                        return Ok(());
                    }
                }
            }
            if attempt == 0 {
                self.fault_in(ctx, FaultInfo::new(va, access, FaultOrigin::Kernel))?;
            }
        }
        Err(VmmError::Unresolved { address: va })
    }
}
