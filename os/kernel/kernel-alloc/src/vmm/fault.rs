//! Page-fault resolution.
//!
//! ```text
//!  address in user window? ─no─▶ Unresolved
//!        │
//!  active context of the core ─kernel─▶ Unresolved
//!        │
//!  range containing the page ─none─▶ Unresolved
//!        │
//!  access permitted by range? ─no─▶ Unresolved
//!        │
//!  translation present? ─no─▶ populate (zero fill or file content)
//!        │
//!  write to a read-only page? ─no─▶ spurious, nothing to do
//!        │
//!  copy-on-write: sole owner re-enables write, otherwise private copy
//! ```

use crate::cpu::CpuId;
use crate::vmm::{Vmm, VmmContext, VmmError, VmmFlags};
use kernel_info::memory::{USERSPACE_END, USERSPACE_START};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, page_align_down};
use kernel_vmem::{Mmu, MmuFlags, PageFaultErrorCode, PhysMapper};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

/// Privilege level the faulting access was made at.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultOrigin {
    Kernel,
    User,
}

/// What the fault path learns about a faulting access.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FaultInfo {
    pub address: VirtualAddress,
    pub access: Access,
    pub origin: FaultOrigin,
}

impl FaultInfo {
    #[must_use]
    pub const fn new(address: VirtualAddress, access: Access, origin: FaultOrigin) -> Self {
        Self {
            address,
            access,
            origin,
        }
    }

    /// Decode `CR2` and the `#PF` error code.
    ///
    /// ```
    /// # use kernel_alloc::vmm::{Access, FaultInfo, FaultOrigin};
    /// # use kernel_vmem::PageFaultErrorCode;
    /// let code = PageFaultErrorCode::new().with_write(true).with_user(true);
    /// let info = FaultInfo::from_error_code(0x40_1234, code);
    /// assert_eq!(info.access, Access::Write);
    /// assert_eq!(info.origin, FaultOrigin::User);
    /// ```
    #[must_use]
    pub const fn from_error_code(cr2: u64, code: PageFaultErrorCode) -> Self {
        let access = if code.instruction_fetch() {
            Access::Execute
        } else if code.write() {
            Access::Write
        } else {
            Access::Read
        };
        let origin = if code.user() {
            FaultOrigin::User
        } else {
            FaultOrigin::Kernel
        };
        Self::new(VirtualAddress::new(cr2), access, origin)
    }

    const fn permitted_by(&self, protection: MmuFlags) -> bool {
        match self.access {
            Access::Read => true,
            Access::Write => protection.contains(MmuFlags::WRITABLE),
            Access::Execute => !protection.contains(MmuFlags::NO_EXECUTE),
        }
    }
}

impl<M: Mmu, P: PhysMapper + Send + Sync> Vmm<M, P> {
    /// Resolve a page fault taken on `cpu` against its active context.
    ///
    /// # Errors
    /// [`VmmError::Unresolved`] when the access is not legal: a kernel
    /// address, an address outside every range, or a protection violation.
    /// Exhaustion while backing the page is reported as such.
    pub fn fault(&self, cpu: CpuId, info: FaultInfo) -> Result<(), VmmError> {
        let unresolved = VmmError::Unresolved {
            address: info.address,
        };
        if !(USERSPACE_START..USERSPACE_END).contains(&info.address.as_u64()) {
            log::error!("{cpu:?}: unresolvable fault outside user space: {info:?}");
            return Err(unresolved);
        }

        let Some(ctx) = self.active_context(cpu) else {
            log::error!("{cpu:?}: fault with no active context: {info:?}");
            return Err(unresolved);
        };
        if ctx.is_kernel() {
            log::error!("{cpu:?}: user-space fault under the kernel context: {info:?}");
            return Err(unresolved);
        }
        self.fault_in(&ctx, info)
    }

    /// Resolve a fault against a specific user context.
    ///
    /// # Errors
    /// As [`fault`](Self::fault).
    pub fn fault_in(
        &self,
        ctx: &VmmContext<M::Directory>,
        info: FaultInfo,
    ) -> Result<(), VmmError> {
        let unresolved = VmmError::Unresolved {
            address: info.address,
        };
        if ctx.is_kernel() {
            return Err(unresolved);
        }
        let page = VirtualAddress::new(page_align_down(info.address.as_u64()));

        let inner = ctx.lock()?;
        let Some(range) = inner.ranges.containing(page) else {
            log::error!("fault outside any range: {info:?}");
            return Err(unresolved);
        };
        if !info.permitted_by(range.protection) {
            log::error!(
                "protection violation: {info:?} on range {:?}..{:?} {:?}",
                range.start,
                range.end,
                range.protection
            );
            return Err(unresolved);
        }

        let Some(current) = self.mmu.translate(inner.directory, page) else {
            if range.flags.contains(VmmFlags::DEVICE) {
                log::error!("device range has a hole at {page:?}");
                return Err(unresolved);
            }
            let pa = self.populate_page(&inner, range, page)?;
            log::debug!("demand-paged {page:?} -> {pa:?} for {:?}", info.access);
            return Ok(());
        };

        if info.access != Access::Write || current.flags.contains(MmuFlags::WRITABLE) {
            log::trace!("spurious fault at {page:?}: {info:?}");
            return Ok(());
        }

        self.break_cow(inner.directory, page, current.phys, range.protection)
            .inspect_err(|e| log::error!("copy-on-write at {page:?} failed: {e}"))
    }

    /// Give `page` a private writable frame in place of the shared `shared`.
    fn break_cow(
        &self,
        directory: M::Directory,
        page: VirtualAddress,
        shared: PhysicalAddress,
        protection: MmuFlags,
    ) -> Result<(), VmmError> {
        let frame = shared.frame();

        if self.refs.get(frame)? <= 1 {
            self.mmu.set_flags(directory, page, protection)?;
            self.mmu.invalidate(page);
            log::debug!("copy-on-write at {page:?}: sole owner of {frame:?}, write re-enabled");
            return Ok(());
        }

        let private = self.copy_frame(frame.base())?;
        if let Err(e) = self.mmu.map(directory, page, private, protection, &*self.pmm) {
            self.put_frame(private);
            return Err(e.into());
        }
        self.mmu.invalidate(page);
        self.put_frame(frame.base());

        log::debug!("copy-on-write at {page:?}: {frame:?} copied to {:?}", private.frame());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_fetch_wins_over_write_bit() {
        let code = PageFaultErrorCode::new()
            .with_present(true)
            .with_instruction_fetch(true);
        let info = FaultInfo::from_error_code(0xdead_b000, code);
        assert_eq!(info.access, Access::Execute);
        assert_eq!(info.origin, FaultOrigin::Kernel);
        assert_eq!(info.address.as_u64(), 0xdead_b000);
    }

    #[test]
    fn permissions_follow_protection_flags() {
        let at = VirtualAddress::new(0x1000);
        let read = FaultInfo::new(at, Access::Read, FaultOrigin::User);
        let write = FaultInfo::new(at, Access::Write, FaultOrigin::User);
        let exec = FaultInfo::new(at, Access::Execute, FaultOrigin::User);

        let ro_nx = MmuFlags::USER | MmuFlags::NO_EXECUTE;
        assert!(read.permitted_by(ro_nx));
        assert!(!write.permitted_by(ro_nx));
        assert!(!exec.permitted_by(ro_nx));

        let rwx = MmuFlags::USER | MmuFlags::WRITABLE;
        assert!(write.permitted_by(rwx));
        assert!(exec.permitted_by(rwx));
    }
}
