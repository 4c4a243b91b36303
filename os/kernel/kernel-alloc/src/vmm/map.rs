use crate::vmm::context::ContextInner;
use crate::vmm::range::{FileBacking, MappedFile, MemoryRange};
use crate::vmm::{Vmm, VmmContext, VmmError, VmmFlags};
use alloc::sync::Arc;
use kernel_memory_addresses::{PAGE_MASK, VirtualAddress, page_align_down};
use kernel_vmem::{Mmu, MmuFlags, PhysMapper, Translation};

impl<M: Mmu, P: PhysMapper + Send + Sync> Vmm<M, P> {
    /// `size` rounded up to whole pages.
    pub(crate) const fn page_round(size: u64) -> Result<u64, VmmError> {
        if size == 0 {
            return Err(VmmError::InvalidSize(size));
        }
        match size.checked_add(PAGE_MASK) {
            Some(s) => Ok(s & !PAGE_MASK),
            None => Err(VmmError::InvalidSize(size)),
        }
    }

    /// Protection adjusted to the context: user pages are user-accessible,
    /// kernel pages never are.
    pub(crate) fn protection_for(ctx: &VmmContext<M::Directory>, prot: MmuFlags) -> MmuFlags {
        let prot = prot.difference(MmuFlags::PRESENT);
        if ctx.is_kernel() {
            prot.difference(MmuFlags::USER)
        } else {
            prot.union(MmuFlags::USER)
        }
    }

    pub(crate) fn find_free_locked(
        ctx: &VmmContext<M::Directory>,
        inner: &ContextInner<M::Directory>,
        hint: Option<VirtualAddress>,
        size: u64,
        exact: bool,
    ) -> Result<VirtualAddress, VmmError> {
        let (lo, hi) = (ctx.start().as_u64(), ctx.end().as_u64());

        if !exact {
            let hint = hint.map(|h| page_align_down(h.as_u64()));
            return inner.ranges.find_free(lo, hi, hint, size).map(VirtualAddress::new);
        }

        let Some(at) = hint else {
            return Err(VmmError::InvalidFlags(VmmFlags::EXACT));
        };
        if !at.is_page_aligned() {
            return Err(VmmError::Unaligned(at));
        }
        let end = at.as_u64().checked_add(size).unwrap_or(u64::MAX);
        if at.as_u64() < lo || end > hi {
            return Err(VmmError::OutOfBounds {
                start: at,
                end: VirtualAddress::new(end),
            });
        }
        if inner.ranges.overlaps(at.as_u64(), end) {
            log::warn!("exact placement at {at:?} (+{size:#x}) collides with a live range");
            return Err(VmmError::AddressInUse(at));
        }
        Ok(at)
    }

    /// Find where `size` bytes could be mapped in `ctx` (kernel context for
    /// `None`), without mapping anything.
    ///
    /// With `exact`, only `hint` itself is acceptable.
    ///
    /// # Errors
    /// [`VmmError::NoSpace`], or for `exact` placement
    /// [`VmmError::AddressInUse`] / [`VmmError::OutOfBounds`].
    pub fn find_free(
        &self,
        ctx: Option<&VmmContext<M::Directory>>,
        hint: Option<VirtualAddress>,
        size: u64,
        exact: bool,
    ) -> Result<VirtualAddress, VmmError> {
        let ctx = self.resolve(ctx);
        let size = Self::page_round(size)?;
        let inner = ctx.lock()?;
        Self::find_free_locked(ctx, &inner, hint, size, exact)
    }

    /// Insert a caller-built range without populating it.
    ///
    /// # Errors
    /// Unaligned, empty or out-of-bounds ranges, and [`VmmError::Overlap`].
    pub fn insert_range(
        &self,
        ctx: Option<&VmmContext<M::Directory>>,
        mut range: MemoryRange,
    ) -> Result<(), VmmError> {
        let ctx = self.resolve(ctx);
        for va in [range.start, range.end] {
            if !va.is_page_aligned() {
                return Err(VmmError::Unaligned(va));
            }
        }
        if range.start >= range.end {
            return Err(VmmError::InvalidSize(0));
        }
        if range.start < ctx.start() || range.end > ctx.end() {
            return Err(VmmError::OutOfBounds {
                start: range.start,
                end: range.end,
            });
        }
        if range.flags.contains(VmmFlags::FILE) != range.file.is_some() {
            return Err(VmmError::InvalidFlags(range.flags));
        }

        range.protection = Self::protection_for(ctx, range.protection);
        ctx.lock()?.ranges.insert(range, &self.nodes)
    }

    /// Map `size` bytes of anonymous memory into `ctx` (kernel context for
    /// `None`) and return the start address.
    ///
    /// Without [`VmmFlags::ALLOCATE`] nothing is backed until first access.
    ///
    /// # Errors
    /// - [`VmmError::InvalidFlags`] for `FILE` or `DEVICE`; use
    ///   [`map_file`](Self::map_file) or [`mmio_map`](Self::mmio_map).
    /// - Placement failures from [`find_free`](Self::find_free).
    /// - Exhaustion while backing an `ALLOCATE` range; nothing stays mapped.
    pub fn map(
        &self,
        ctx: Option<&VmmContext<M::Directory>>,
        hint: Option<VirtualAddress>,
        size: u64,
        flags: VmmFlags,
        prot: MmuFlags,
    ) -> Result<VirtualAddress, VmmError> {
        if flags.intersects(VmmFlags::FILE | VmmFlags::DEVICE) {
            return Err(VmmError::InvalidFlags(flags));
        }
        self.map_range(ctx, hint, size, flags, prot, None)
    }

    /// Map `size` bytes of `file` starting at `offset`.
    ///
    /// # Errors
    /// As [`map`](Self::map); eager population also fails if the file does.
    #[allow(clippy::too_many_arguments)]
    pub fn map_file(
        &self,
        ctx: Option<&VmmContext<M::Directory>>,
        hint: Option<VirtualAddress>,
        size: u64,
        flags: VmmFlags,
        prot: MmuFlags,
        file: Arc<dyn MappedFile>,
        offset: u64,
    ) -> Result<VirtualAddress, VmmError> {
        if flags.contains(VmmFlags::DEVICE) {
            return Err(VmmError::InvalidFlags(flags));
        }
        let backing = FileBacking { file, offset };
        self.map_range(ctx, hint, size, flags | VmmFlags::FILE, prot, Some(backing))
    }

    fn map_range(
        &self,
        ctx: Option<&VmmContext<M::Directory>>,
        hint: Option<VirtualAddress>,
        size: u64,
        flags: VmmFlags,
        prot: MmuFlags,
        file: Option<FileBacking>,
    ) -> Result<VirtualAddress, VmmError> {
        let ctx = self.resolve(ctx);
        let size = Self::page_round(size)?;
        let mut inner = ctx.lock()?;

        let exact = flags.contains(VmmFlags::EXACT);
        let start = Self::find_free_locked(ctx, &inner, hint, size, exact)?;
        let end = start + size;
        let mut range = MemoryRange::new(start, end, flags, Self::protection_for(ctx, prot));
        range.file = file;
        inner.ranges.insert(range.clone(), &self.nodes)?;

        if flags.contains(VmmFlags::ALLOCATE) {
            if let Err(e) = self.populate_all(&inner, &range) {
                inner.ranges.remove(start, &self.nodes);
                log::warn!("backing {start:?}..{end:?} failed: {e}");
                return Err(e);
            }
        }

        log::debug!("mapped {start:?}..{end:?} {flags:?} {:?}", range.protection);
        Ok(start)
    }

    /// Back every page of `range`; on failure release what was backed.
    fn populate_all(
        &self,
        inner: &ContextInner<M::Directory>,
        range: &MemoryRange,
    ) -> Result<(), VmmError> {
        for page in range.pages() {
            if let Err(e) = self.populate_page(inner, range, page) {
                for done in range.pages().take_while(|&p| p != page) {
                    self.release_page(inner.directory, done, false);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove `[addr, addr + size)` from `ctx` (kernel context for `None`).
    ///
    /// Ranges straddling the edges shrink; a range containing the whole span
    /// splits in two. Resident pages drop their frame reference. Parts of the
    /// span not covered by any range are ignored.
    ///
    /// # Errors
    /// [`VmmError::Unaligned`] / [`VmmError::InvalidSize`], or
    /// [`VmmError::Slab`] when splitting a range finds no free node; nothing
    /// is unmapped then.
    pub fn unmap(
        &self,
        ctx: Option<&VmmContext<M::Directory>>,
        addr: VirtualAddress,
        size: u64,
    ) -> Result<(), VmmError> {
        let ctx = self.resolve(ctx);
        if !addr.is_page_aligned() {
            return Err(VmmError::Unaligned(addr));
        }
        let size = Self::page_round(size)?;
        let end = addr
            .as_u64()
            .checked_add(size)
            .ok_or(VmmError::InvalidSize(size))?;

        let mut inner = ctx.lock()?;
        let directory = inner.directory;
        let pieces = inner.ranges.remove_span(addr.as_u64(), end, &self.nodes, |piece| {
            self.release_range(directory, piece);
        })?;
        log::debug!(
            "unmapped {addr:?}..{:?} ({pieces} piece(s))",
            VirtualAddress::new(end)
        );
        Ok(())
    }

    /// The resident translation of `va` in `ctx` (kernel context for `None`).
    ///
    /// # Errors
    /// [`VmmError::ContextDestroyed`].
    pub fn translate(
        &self,
        ctx: Option<&VmmContext<M::Directory>>,
        va: VirtualAddress,
    ) -> Result<Option<Translation>, VmmError> {
        let ctx = self.resolve(ctx);
        let inner = ctx.lock()?;
        Ok(self.mmu.translate(inner.directory, va))
    }
}
