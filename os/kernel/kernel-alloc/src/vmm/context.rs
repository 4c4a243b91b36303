use crate::cpu::CpuId;
use crate::vmm::range::{MemoryRange, RangeMap};
use crate::vmm::{Vmm, VmmError};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::memory::{USERSPACE_END, USERSPACE_START};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::{MutexGuard, RawSleep, SleepMutex, SpinLock};
use kernel_vmem::{Mmu, PhysMapper};

/// Shared handle to a context.
pub type ContextRef<D> = Arc<VmmContext<D>>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContextKind {
    Kernel,
    User,
}

/// Sentinel for "not active on any core".
const INACTIVE: u32 = u32::MAX;

/// One address space.
pub struct VmmContext<D> {
    kind: ContextKind,
    start: VirtualAddress,
    end: VirtualAddress,
    /// Core this user context is active on, or [`INACTIVE`]. Unused for the
    /// kernel context.
    active_on: AtomicU32,
    inner: SleepMutex<ContextInner<D>>,
}

/// State serialized by the context mutex.
pub struct ContextInner<D> {
    pub ranges: RangeMap,
    pub directory: D,
    pub live: bool,
}

pub type ContextGuard<'a, D> = MutexGuard<'a, ContextInner<D>, RawSleep>;

impl<D> VmmContext<D> {
    pub(crate) const fn new(
        kind: ContextKind,
        start: VirtualAddress,
        end: VirtualAddress,
        directory: D,
    ) -> Self {
        Self {
            kind,
            start,
            end,
            active_on: AtomicU32::new(INACTIVE),
            inner: SleepMutex::new(ContextInner {
                ranges: RangeMap::new(),
                directory,
                live: true,
            }),
        }
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> ContextKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        matches!(self.kind, ContextKind::Kernel)
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    /// The core a user context is active on.
    #[must_use]
    pub fn active_on(&self) -> Option<CpuId> {
        match self.active_on.load(Ordering::Acquire) {
            INACTIVE => None,
            #[allow(clippy::cast_possible_truncation)]
            cpu => Some(CpuId::new(cpu as u16)),
        }
    }

    /// Lock the context, failing if it has been destroyed.
    pub(crate) fn lock(&self) -> Result<ContextGuard<'_, D>, VmmError> {
        let guard = self.inner.lock();
        if guard.live {
            Ok(guard)
        } else {
            Err(VmmError::ContextDestroyed)
        }
    }

    /// A snapshot of the context's ranges in address order.
    ///
    /// The snapshot is sized before the lock is taken, so the heap is never
    /// entered with the context locked.
    ///
    /// # Errors
    /// [`VmmError::ContextDestroyed`].
    pub fn ranges(&self) -> Result<Vec<MemoryRange>, VmmError> {
        let mut out = Vec::new();
        loop {
            let want = self.lock()?.ranges.len();
            out.reserve_exact(want);
            let inner = self.lock()?;
            if inner.ranges.len() <= out.capacity() {
                out.extend(inner.ranges.iter().cloned());
                return Ok(out);
            }
        }
    }

    /// The range containing `va`, if any.
    ///
    /// # Errors
    /// [`VmmError::ContextDestroyed`].
    pub fn range_containing(&self, va: VirtualAddress) -> Result<Option<MemoryRange>, VmmError> {
        Ok(self.lock()?.ranges.containing(va).cloned())
    }

    /// Log every range.
    pub fn dump(&self) {
        let inner = self.inner.lock();
        log::info!(
            "{:?} context {:?}..{:?}: {} range(s){}",
            self.kind,
            self.start,
            self.end,
            inner.ranges.len(),
            if inner.live { "" } else { " (destroyed)" }
        );
        for r in inner.ranges.iter() {
            log::info!(
                "  {:?}..{:?} {:?} {:?}{}",
                r.start,
                r.end,
                r.flags,
                r.protection,
                if r.file.is_some() { " file" } else { "" }
            );
        }
    }
}

impl<D> fmt::Debug for VmmContext<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmmContext")
            .field("kind", &self.kind)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("active_on", &self.active_on())
            .finish_non_exhaustive()
    }
}

impl<M: Mmu, P: PhysMapper + Send + Sync> Vmm<M, P> {
    fn active_slot(&self, cpu: CpuId) -> &SpinLock<Option<ContextRef<M::Directory>>> {
        let Some(slot) = self.active.get(cpu.index()) else {
            panic!(
                "{cpu:?} is beyond the {} configured core(s)",
                self.active.len()
            );
        };
        slot
    }

    /// Create an empty user context sharing the kernel half.
    ///
    /// # Errors
    /// When the directory cannot be allocated.
    pub fn create_context(&self) -> Result<ContextRef<M::Directory>, VmmError> {
        let directory = self.mmu.create_directory(&**self.pmm())?;
        {
            let kernel = self.kernel.inner.lock();
            self.mmu.copy_kernel_mappings(kernel.directory, directory);
        }
        log::debug!("created user context with directory {directory:?}");
        Ok(Arc::new(VmmContext::new(
            ContextKind::User,
            VirtualAddress::new(USERSPACE_START),
            VirtualAddress::new(USERSPACE_END),
            directory,
        )))
    }

    /// Release every range and the directory of a user context.
    ///
    /// Handles to the context stay valid but every further operation on it
    /// fails with [`VmmError::ContextDestroyed`].
    ///
    /// # Errors
    /// - [`VmmError::KernelContext`] for the kernel context.
    /// - [`VmmError::ContextBusy`] while the context is active on a core.
    /// - [`VmmError::ContextDestroyed`] if already destroyed.
    pub fn destroy_context(&self, ctx: &VmmContext<M::Directory>) -> Result<(), VmmError> {
        if ctx.is_kernel() {
            return Err(VmmError::KernelContext);
        }
        let mut inner = ctx.lock()?;
        if let Some(cpu) = ctx.active_on() {
            log::warn!("refusing to destroy a context active on {cpu:?}");
            return Err(VmmError::ContextBusy);
        }

        let directory = inner.directory;
        inner.ranges.drain(&self.nodes, |range| self.release_range(directory, &range));
        inner.live = false;
        unsafe { self.mmu.destroy_directory(inner.directory, &**self.pmm()) };
        log::debug!("destroyed user context with directory {:?}", inner.directory);
        Ok(())
    }

    /// Make `ctx` the active context of `cpu` and load its directory.
    ///
    /// The context previously active on `cpu` is released.
    ///
    /// # Errors
    /// - [`VmmError::ContextBusy`] if a user context is active on another core.
    /// - [`VmmError::ContextDestroyed`].
    ///
    /// # Panics
    /// If `cpu` is beyond the configured core count.
    pub fn switch(&self, cpu: CpuId, ctx: &ContextRef<M::Directory>) -> Result<(), VmmError> {
        let slot = self.active_slot(cpu);
        let directory = {
            let inner = ctx.lock()?;
            if !ctx.is_kernel() {
                #[allow(clippy::cast_possible_truncation)]
                let me = cpu.index() as u32;
                if let Err(other) =
                    ctx.active_on
                        .compare_exchange(INACTIVE, me, Ordering::AcqRel, Ordering::Acquire)
                {
                    if other != me {
                        return Err(VmmError::ContextBusy);
                    }
                }
            }
            inner.directory
        };

        let previous = slot.lock_irq().replace(ctx.clone());
        if let Some(previous) = previous {
            if !previous.is_kernel() && !Arc::ptr_eq(&previous, ctx) {
                previous.active_on.store(INACTIVE, Ordering::Release);
            }
        }

        // Every directory created here carries the kernel half.
        unsafe { self.mmu.load(directory) };
        log::trace!("{cpu:?}: switched to {directory:?}");
        Ok(())
    }

    /// The context active on `cpu`.
    ///
    /// # Panics
    /// If `cpu` is beyond the configured core count.
    #[must_use]
    pub fn active_context(&self, cpu: CpuId) -> Option<ContextRef<M::Directory>> {
        self.active_slot(cpu).lock_irq().clone()
    }
}

impl<M: Mmu, P: PhysMapper + Send + Sync> Drop for Vmm<M, P> {
    fn drop(&mut self) {
        // Kernel pages go away with the frame allocator; the range nodes go
        // back to their cache before it is torn down.
        let mut kernel = self.kernel.inner.lock();
        kernel.ranges.drain(&self.nodes, drop);
    }
}
