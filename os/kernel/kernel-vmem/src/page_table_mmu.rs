//! # x86-64 four-level page-table backend
//!
//! [`PageTableMmu`] implements [`Mmu`] on top of a [`PhysMapper`] that lets it
//! reach table frames. Intermediate tables are allocated on demand from the
//! caller's [`FrameAlloc`] and only released when the directory is destroyed.
//!
//! ## Safety
//!
//! - Mutating active mappings requires TLB maintenance; callers use
//!   [`Mmu::invalidate`] after replacing or removing a translation.
//! - The `PhysMapper` must yield **writable** pointers to table frames.

use crate::page_table::ENTRIES;
use crate::{
    FrameAlloc, Mmu, MmuError, MmuFlags, PageEntryBits, PageTable, PhysMapper, TableLevel,
    Translation, cpu,
};
use core::ops::Range;
use kernel_info::memory::{KERNELSPACE_END, KERNELSPACE_START};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// PML4 slots forming the lower, per-process half.
const USER_HALF: Range<usize> = 0..ENTRIES / 2;

/// PML4 slots copied from the kernel directory into every new directory.
const KERNEL_HALF: Range<usize> = ENTRIES / 2..ENTRIES;

/// PML4 slots covering the kernel context window. Their PDPTs are allocated
/// up front so that every directory shares them.
const KERNEL_WINDOW: Range<usize> = TableLevel::Pml4
    .index(VirtualAddress::new(KERNELSPACE_START))
    ..TableLevel::Pml4.index(VirtualAddress::new(KERNELSPACE_END - 1)) + 1;

/// Handle to a PML4 frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct RootTable(PhysicalAddress);

impl RootTable {
    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        self.0
    }
}

/// x86-64 four-level paging, reaching table frames through `P`.
pub struct PageTableMmu<P> {
    mapper: P,
}

impl<P: PhysMapper> PageTableMmu<P> {
    pub const fn new(mapper: P) -> Self {
        Self { mapper }
    }

    #[inline]
    pub const fn mapper(&self) -> &P {
        &self.mapper
    }

    /// Borrow the table stored in frame `pa`.
    ///
    /// # Safety
    /// `pa` must be a table frame of a directory whose mutation the caller
    /// serializes, and the reference must not outlive that serialization.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn table(&self, pa: PhysicalAddress) -> &mut PageTable {
        unsafe { self.mapper.phys_to_mut::<PageTable>(pa) }
    }

    fn allocate_table<A: FrameAlloc + ?Sized>(
        &self,
        frames: &A,
    ) -> Result<PhysicalAddress, MmuError> {
        let pa = frames.allocate_frame().ok_or(MmuError::OutOfMemory)?;
        debug_assert!(pa.is_page_aligned());
        unsafe { self.table(pa).zero() };
        Ok(pa)
    }

    /// Walk to the leaf table for `va` without creating anything.
    fn leaf_table(&self, root: RootTable, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = root.0;
        for level in [TableLevel::Pml4, TableLevel::Pdpt, TableLevel::Pd] {
            let entry = unsafe { self.table(table) }.get(level.index(va));
            if !entry.present() {
                return None;
            }
            table = entry.physical_address();
        }
        Some(table)
    }

    /// Walk to the leaf table for `va`, linking missing tables on the way.
    fn leaf_table_or_create<A: FrameAlloc + ?Sized>(
        &self,
        root: RootTable,
        va: VirtualAddress,
        frames: &A,
    ) -> Result<PhysicalAddress, MmuError> {
        let user = USER_HALF.contains(&TableLevel::Pml4.index(va));
        let mut table = root.0;
        for level in [TableLevel::Pml4, TableLevel::Pdpt, TableLevel::Pd] {
            let index = level.index(va);
            let entry = unsafe { self.table(table) }.get(index);
            table = if entry.present() {
                entry.physical_address()
            } else {
                let next = self.allocate_table(frames)?;
                unsafe { self.table(table) }.set(index, PageEntryBits::table(next, user));
                next
            };
        }
        Ok(table)
    }

    /// Free `table` and, below the PT level, every table it links.
    fn free_subtree<A: FrameAlloc + ?Sized>(
        &self,
        table: PhysicalAddress,
        level: TableLevel,
        frames: &A,
    ) {
        if let Some(next) = level.next() {
            for index in 0..ENTRIES {
                let entry = unsafe { self.table(table) }.get(index);
                if entry.present() {
                    self.free_subtree(entry.physical_address(), next, frames);
                }
            }
        }
        unsafe { frames.free_frame(table) };
    }

    fn check_page(va: VirtualAddress) -> Result<(), MmuError> {
        if !va.is_canonical() {
            return Err(MmuError::NonCanonical(va));
        }
        if !va.is_page_aligned() {
            return Err(MmuError::Unaligned(va.as_u64()));
        }
        Ok(())
    }
}

impl<P: PhysMapper> Mmu for PageTableMmu<P> {
    type Directory = RootTable;

    fn create_kernel_directory<A: FrameAlloc + ?Sized>(
        &self,
        frames: &A,
    ) -> Result<RootTable, MmuError> {
        let root = self.allocate_table(frames)?;
        for slot in KERNEL_WINDOW {
            match self.allocate_table(frames) {
                Ok(pdpt) => {
                    unsafe { self.table(root) }.set(slot, PageEntryBits::table(pdpt, false));
                }
                Err(e) => {
                    for linked in KERNEL_WINDOW.start..slot {
                        let entry = unsafe { self.table(root) }.get(linked);
                        unsafe { frames.free_frame(entry.physical_address()) };
                    }
                    unsafe { frames.free_frame(root) };
                    return Err(e);
                }
            }
        }
        log::debug!(
            "kernel directory at {root:?}, {} shared window slot(s)",
            KERNEL_WINDOW.len()
        );
        Ok(RootTable(root))
    }

    fn create_directory<A: FrameAlloc + ?Sized>(&self, frames: &A) -> Result<RootTable, MmuError> {
        self.allocate_table(frames).map(RootTable)
    }

    fn copy_kernel_mappings(&self, kernel: RootTable, into: RootTable) {
        for slot in KERNEL_HALF {
            let entry = unsafe { self.table(kernel.0) }.get(slot);
            unsafe { self.table(into.0) }.set(slot, entry);
        }
    }

    unsafe fn destroy_directory<A: FrameAlloc + ?Sized>(&self, dir: RootTable, frames: &A) {
        for slot in USER_HALF {
            let entry = unsafe { self.table(dir.0) }.get(slot);
            if entry.present() {
                self.free_subtree(entry.physical_address(), TableLevel::Pdpt, frames);
            }
        }
        // Kernel-half tables are shared with the kernel directory and stay.
        unsafe { frames.free_frame(dir.0) };
    }

    fn map<A: FrameAlloc + ?Sized>(
        &self,
        dir: RootTable,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MmuFlags,
        frames: &A,
    ) -> Result<(), MmuError> {
        Self::check_page(va)?;
        if !pa.is_page_aligned() {
            return Err(MmuError::Unaligned(pa.as_u64()));
        }
        let pt = self.leaf_table_or_create(dir, va, frames)?;
        unsafe { self.table(pt) }.set(TableLevel::Pt.index(va), PageEntryBits::leaf(pa, flags));
        Ok(())
    }

    fn unmap(&self, dir: RootTable, va: VirtualAddress) -> Option<PhysicalAddress> {
        let pt = self.leaf_table(dir, va)?;
        let index = TableLevel::Pt.index(va);
        let table = unsafe { self.table(pt) };
        let entry = table.get(index);
        if !entry.present() {
            return None;
        }
        table.set(index, PageEntryBits::new());
        Some(entry.physical_address())
    }

    fn translate(&self, dir: RootTable, va: VirtualAddress) -> Option<Translation> {
        let pt = self.leaf_table(dir, va)?;
        let entry = unsafe { self.table(pt) }.get(TableLevel::Pt.index(va));
        entry.present().then(|| Translation {
            phys: entry.physical_address() + va.page_offset(),
            flags: entry.mmu_flags(),
        })
    }

    fn set_flags(
        &self,
        dir: RootTable,
        va: VirtualAddress,
        flags: MmuFlags,
    ) -> Result<(), MmuError> {
        let pt = self.leaf_table(dir, va).ok_or(MmuError::NotMapped(va))?;
        let index = TableLevel::Pt.index(va);
        let table = unsafe { self.table(pt) };
        let entry = table.get(index);
        if !entry.present() {
            return Err(MmuError::NotMapped(va));
        }
        table.set(index, PageEntryBits::leaf(entry.physical_address(), flags));
        Ok(())
    }

    unsafe fn load(&self, dir: RootTable) {
        unsafe { cpu::write_cr3(dir.0.as_u64()) };
    }

    fn invalidate(&self, va: VirtualAddress) {
        cpu::invlpg(va.as_u64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, RefCell};
    use std::collections::BTreeSet;

    /// A 4 KiB-aligned raw frame used as simulated RAM.
    #[repr(align(4096))]
    struct Aligned4K([u8; 4096]);

    /// Simulated physical memory: physical address `pa` lives at byte `pa`
    /// of a heap buffer.
    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                frames.push(Aligned4K([0u8; 4096]));
            }
            Self { frames }
        }
    }

    impl PhysMapper for TestPhys {
        fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
            let base = self.frames.as_ptr().cast::<u8>().cast_mut();
            unsafe { base.add(pa.as_u64() as usize) }
        }

        fn ptr_to_phys(&self, ptr: *const u8) -> Option<PhysicalAddress> {
            let base = self.frames.as_ptr() as usize;
            let offset = (ptr as usize).checked_sub(base)?;
            (offset < self.frames.len() * 4096).then(|| PhysicalAddress::new(offset as u64))
        }
    }

    /// A trivial **bump** allocator that also records frees.
    struct BumpAlloc {
        next: Cell<u64>,
        end: u64,
        freed: RefCell<BTreeSet<u64>>,
    }

    impl BumpAlloc {
        fn new(start: u64, end: u64) -> Self {
            Self {
                next: Cell::new(start),
                end,
                freed: RefCell::new(BTreeSet::new()),
            }
        }

        fn allocated(&self) -> u64 {
            self.next.get() / 4096
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn allocate_frame(&self) -> Option<PhysicalAddress> {
            let p = self.next.get();
            if p + 4096 > self.end {
                return None;
            }
            self.next.set(p + 4096);
            Some(PhysicalAddress::new(p))
        }

        unsafe fn free_frame(&self, frame: PhysicalAddress) {
            assert!(self.freed.borrow_mut().insert(frame.as_u64()), "double free");
        }
    }

    fn setup(frames: usize) -> (PageTableMmu<TestPhys>, BumpAlloc) {
        let mmu = PageTableMmu::new(TestPhys::with_frames(frames));
        // Frame 0 stays unused so that a zero PA never looks like a table.
        let alloc = BumpAlloc::new(4096, frames as u64 * 4096);
        (mmu, alloc)
    }

    #[test]
    fn map_creates_tables_and_leaf() {
        let (mmu, alloc) = setup(64);
        let root = mmu.create_directory(&alloc).unwrap();

        let va = VirtualAddress::new(0x0000_4000_1234_5000);
        let pa = PhysicalAddress::new(0x30_000);
        mmu.map(
            root,
            va,
            pa,
            MmuFlags::WRITABLE | MmuFlags::USER | MmuFlags::NO_EXECUTE,
            &alloc,
        )
        .unwrap();

        // Root plus PDPT, PD and PT.
        assert_eq!(alloc.allocated(), 1 + 4);

        let t = mmu.translate(root, va + 0x123).unwrap();
        assert_eq!(t.phys, pa + 0x123);
        assert_eq!(
            t.flags,
            MmuFlags::PRESENT | MmuFlags::WRITABLE | MmuFlags::USER | MmuFlags::NO_EXECUTE
        );

        // A neighbor in the same PT reuses the chain.
        mmu.map(root, va + 4096, pa + 4096, MmuFlags::empty(), &alloc)
            .unwrap();
        assert_eq!(alloc.allocated(), 1 + 4);
    }

    #[test]
    fn unmap_returns_the_frame_once() {
        let (mmu, alloc) = setup(64);
        let root = mmu.create_directory(&alloc).unwrap();
        let va = VirtualAddress::new(0x40_0000);
        let pa = PhysicalAddress::new(0x20_000);
        mmu.map(root, va, pa, MmuFlags::WRITABLE, &alloc).unwrap();

        assert_eq!(mmu.unmap(root, va), Some(pa));
        assert_eq!(mmu.unmap(root, va), None);
        assert!(mmu.translate(root, va).is_none());
    }

    #[test]
    fn set_flags_keeps_frame() {
        let (mmu, alloc) = setup(64);
        let root = mmu.create_directory(&alloc).unwrap();
        let va = VirtualAddress::new(0x40_0000);
        let pa = PhysicalAddress::new(0x20_000);
        mmu.map(root, va, pa, MmuFlags::WRITABLE | MmuFlags::USER, &alloc)
            .unwrap();

        mmu.set_flags(root, va, MmuFlags::USER).unwrap();
        let t = mmu.translate(root, va).unwrap();
        assert_eq!(t.phys, pa);
        assert!(!t.flags.contains(MmuFlags::WRITABLE));

        assert_eq!(
            mmu.set_flags(root, va + 4096, MmuFlags::USER),
            Err(MmuError::NotMapped(va + 4096))
        );
    }

    #[test]
    fn rejects_unaligned_and_non_canonical() {
        let (mmu, alloc) = setup(16);
        let root = mmu.create_directory(&alloc).unwrap();
        let pa = PhysicalAddress::new(0x2000);
        assert_eq!(
            mmu.map(root, VirtualAddress::new(0x1001), pa, MmuFlags::empty(), &alloc),
            Err(MmuError::Unaligned(0x1001))
        );
        let bad = VirtualAddress::new(0x0000_8000_0000_0000);
        assert_eq!(
            mmu.map(root, bad, pa, MmuFlags::empty(), &alloc),
            Err(MmuError::NonCanonical(bad))
        );
    }

    #[test]
    fn kernel_window_is_shared_with_new_directories() {
        let (mmu, alloc) = setup(64);
        let kernel = mmu.create_kernel_directory(&alloc).unwrap();
        let user = mmu.create_directory(&alloc).unwrap();
        mmu.copy_kernel_mappings(kernel, user);

        // Mapped after the copy, still visible through the user directory.
        let kva = VirtualAddress::new(KERNELSPACE_START + 0x5000);
        let pa = PhysicalAddress::new(0x3_0000);
        mmu.map(kernel, kva, pa, MmuFlags::WRITABLE, &alloc).unwrap();
        assert_eq!(mmu.translate(user, kva).map(|t| t.phys), Some(pa));
    }

    #[test]
    fn destroy_frees_only_private_tables() {
        let (mmu, alloc) = setup(64);
        let kernel = mmu.create_kernel_directory(&alloc).unwrap();
        let kernel_frames = alloc.allocated();

        let user = mmu.create_directory(&alloc).unwrap();
        mmu.copy_kernel_mappings(kernel, user);
        mmu.map(
            user,
            VirtualAddress::new(0x40_0000),
            PhysicalAddress::new(0x3_0000),
            MmuFlags::USER,
            &alloc,
        )
        .unwrap();
        mmu.map(
            user,
            VirtualAddress::new(0x0000_2000_0000_0000),
            PhysicalAddress::new(0x3_1000),
            MmuFlags::USER,
            &alloc,
        )
        .unwrap();
        let user_frames = alloc.allocated() - kernel_frames;

        unsafe { mmu.destroy_directory(user, &alloc) };
        let freed = alloc.freed.borrow();
        assert_eq!(freed.len() as u64, user_frames);
        // Leaf frames are the caller's business.
        assert!(!freed.contains(&0x3_0000));
        assert!(!freed.contains(&0x3_1000));
    }

    #[test]
    fn table_allocation_failure_is_reported() {
        let (mmu, alloc) = setup(3);
        let root = mmu.create_directory(&alloc).unwrap();
        assert_eq!(
            mmu.map(
                root,
                VirtualAddress::new(0x40_0000),
                PhysicalAddress::new(0x1000),
                MmuFlags::empty(),
                &alloc
            ),
            Err(MmuError::OutOfMemory)
        );
    }
}
