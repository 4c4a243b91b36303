mod common;

use common::{FRAME, TestRam, active_user, vmm};
use kernel_alloc::cpu::CpuId;
use kernel_alloc::slab::SlabCache;
use kernel_alloc::vmm::{
    Access, CloneMode, FaultInfo, FaultOrigin, MappedFile, MemoryRange, PopulateError, VmmError,
    VmmFlags,
};
use kernel_info::memory::{KERNELSPACE_END, KERNELSPACE_START, USERSPACE_START};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::MmuFlags;
use std::sync::{Arc, Barrier};
use std::thread;

const BSP: CpuId = CpuId::BSP;
const RW: MmuFlags = MmuFlags::WRITABLE.union(MmuFlags::NO_EXECUTE);

fn user_fault(address: VirtualAddress, access: Access) -> FaultInfo {
    FaultInfo::new(address, access, FaultOrigin::User)
}

#[test]
fn lazy_range_populates_only_touched_pages() {
    let ram = TestRam::new(256);
    let vmm = vmm(&ram, CloneMode::CopyOnWrite, 1);
    let ctx = active_user(&vmm, BSP);

    let va = vmm.map(Some(&ctx), None, 3 * FRAME, VmmFlags::empty(), RW).unwrap();
    assert_eq!(va.as_u64(), USERSPACE_START);
    for i in 0..3 {
        assert_eq!(vmm.translate(Some(&ctx), va + i * FRAME).unwrap(), None);
    }

    vmm.fault(BSP, user_fault(va + 0x10, Access::Write)).unwrap();

    let t = vmm.translate(Some(&ctx), va).unwrap().expect("first page resident");
    assert!(t.flags.contains(MmuFlags::USER | MmuFlags::WRITABLE));
    assert_eq!(vmm.translate(Some(&ctx), va + FRAME).unwrap(), None);
    assert_eq!(vmm.translate(Some(&ctx), va + 2 * FRAME).unwrap(), None);
    assert_eq!(vmm.refcounts().get(t.phys.frame()), Ok(1));

    let mut page = vec![0xAA; FRAME as usize];
    vmm.read_bytes(&ctx, va, &mut page).unwrap();
    assert!(page.iter().all(|&b| b == 0));

    let used = vmm.pmm().used_frames();
    vmm.unmap(Some(&ctx), va, 3 * FRAME).unwrap();
    assert_eq!(vmm.pmm().used_frames(), used - 1);
    assert_eq!(vmm.refcounts().get(t.phys.frame()), Ok(0));
    assert!(ctx.ranges().unwrap().is_empty());
}

#[test]
fn recycled_frames_come_back_zeroed() {
    let ram = TestRam::new(128);
    let vmm = vmm(&ram, CloneMode::CopyOnWrite, 1);
    let ctx = vmm.create_context().unwrap();

    let va = vmm.map(Some(&ctx), None, FRAME, VmmFlags::ALLOCATE, RW).unwrap();
    vmm.write_bytes(&ctx, va, &[0x5A; 4096]).unwrap();
    vmm.unmap(Some(&ctx), va, FRAME).unwrap();

    let va = vmm.map(Some(&ctx), None, FRAME, VmmFlags::empty(), RW).unwrap();
    let mut buf = [0xFF; 64];
    vmm.read_bytes(&ctx, va + 1000, &mut buf).unwrap();
    assert_eq!(buf, [0; 64]);
}

#[test]
fn overlapping_ranges_are_rejected_and_freed_spans_reused() {
    let ram = TestRam::new(64);
    let vmm = vmm(&ram, CloneMode::CopyOnWrite, 1);
    let ctx = vmm.create_context().unwrap();

    let a = vmm.map(Some(&ctx), None, 4 * FRAME, VmmFlags::empty(), RW).unwrap();
    assert_eq!(
        vmm.map(Some(&ctx), Some(a + FRAME), FRAME, VmmFlags::EXACT, RW),
        Err(VmmError::AddressInUse(a + FRAME))
    );
    let overlapping = MemoryRange::new(a + 3 * FRAME, a + 5 * FRAME, VmmFlags::empty(), RW);
    assert!(matches!(
        vmm.insert_range(Some(&ctx), overlapping),
        Err(VmmError::Overlap { .. })
    ));
    assert_eq!(vmm.find_free(Some(&ctx), None, FRAME, false), Ok(a + 4 * FRAME));

    // A non-exact hint inside a live range moves past it.
    let b = vmm.map(Some(&ctx), Some(a + 0x1234), 2 * FRAME, VmmFlags::empty(), RW).unwrap();
    assert_eq!(b, a + 4 * FRAME);

    vmm.unmap(Some(&ctx), a, 4 * FRAME).unwrap();
    assert_eq!(vmm.find_free(Some(&ctx), None, 4 * FRAME, false), Ok(a));
    let exact = vmm.map(Some(&ctx), Some(a), 4 * FRAME, VmmFlags::EXACT, RW).unwrap();
    assert_eq!(exact, a);

    // Cutting the middle out leaves two ranges.
    vmm.unmap(Some(&ctx), a + FRAME, 2 * FRAME).unwrap();
    let spans: Vec<_> = ctx
        .ranges()
        .unwrap()
        .iter()
        .map(|r| (r.start - a, r.end - a))
        .collect();
    assert_eq!(spans, [(0, FRAME), (3 * FRAME, 4 * FRAME), (4 * FRAME, 6 * FRAME)]);
}

#[test]
fn invalid_requests_are_refused() {
    let ram = TestRam::new(64);
    let vmm = vmm(&ram, CloneMode::CopyOnWrite, 1);
    let ctx = vmm.create_context().unwrap();

    assert_eq!(
        vmm.map(Some(&ctx), None, 0, VmmFlags::empty(), RW),
        Err(VmmError::InvalidSize(0))
    );
    assert_eq!(
        vmm.map(
            Some(&ctx),
            Some(VirtualAddress::new(USERSPACE_START + 1)),
            FRAME,
            VmmFlags::EXACT,
            RW,
        ),
        Err(VmmError::Unaligned(VirtualAddress::new(USERSPACE_START + 1)))
    );
    assert!(matches!(
        vmm.map(Some(&ctx), Some(VirtualAddress::new(0x1000)), FRAME, VmmFlags::EXACT, RW),
        Err(VmmError::OutOfBounds { .. })
    ));
    assert_eq!(
        vmm.map(Some(&ctx), None, FRAME, VmmFlags::DEVICE, RW),
        Err(VmmError::InvalidFlags(VmmFlags::DEVICE))
    );
    assert_eq!(
        vmm.unmap(Some(&ctx), VirtualAddress::new(USERSPACE_START + 8), FRAME),
        Err(VmmError::Unaligned(VirtualAddress::new(USERSPACE_START + 8)))
    );
    // Nothing mapped there: not an error.
    assert_eq!(vmm.unmap(Some(&ctx), VirtualAddress::new(USERSPACE_START), FRAME), Ok(()));
}

#[test]
fn illegal_faults_stay_unresolved_without_side_effects() {
    let ram = TestRam::new(128);
    let vmm = vmm(&ram, CloneMode::CopyOnWrite, 1);
    let ctx = active_user(&vmm, BSP);

    let ro = vmm.map(Some(&ctx), None, 2 * FRAME, VmmFlags::empty(), MmuFlags::NO_EXECUTE).unwrap();
    let used = vmm.pmm().used_frames();

    for info in [
        user_fault(ro, Access::Write),
        user_fault(ro + FRAME, Access::Execute),
        user_fault(ro + 2 * FRAME, Access::Read),
        user_fault(VirtualAddress::new(KERNELSPACE_START), Access::Read),
        user_fault(VirtualAddress::new(0), Access::Read),
    ] {
        assert_eq!(
            vmm.fault(BSP, info),
            Err(VmmError::Unresolved { address: info.address }),
            "{info:?}"
        );
    }
    assert_eq!(vmm.pmm().used_frames(), used);
    assert_eq!(vmm.translate(Some(&ctx), ro).unwrap(), None);

    // Reading is allowed and maps the page read-only.
    vmm.fault(BSP, user_fault(ro, Access::Read)).unwrap();
    let t = vmm.translate(Some(&ctx), ro).unwrap().unwrap();
    assert!(!t.flags.contains(MmuFlags::WRITABLE));
    assert_eq!(
        vmm.write_bytes(&ctx, ro, b"nope"),
        Err(VmmError::Unresolved { address: ro })
    );

    // A second read fault on the resident page is spurious.
    vmm.fault(BSP, user_fault(ro + 8, Access::Read)).unwrap();
    assert_eq!(vmm.translate(Some(&ctx), ro).unwrap(), Some(t));
}

#[test]
fn faults_follow_the_active_context_of_the_core() {
    let ram = TestRam::new(128);
    let vmm = vmm(&ram, CloneMode::CopyOnWrite, 2);
    let (cpu0, cpu1) = (CpuId::new(0), CpuId::new(1));
    let a = active_user(&vmm, cpu0);
    let b = vmm.create_context().unwrap();

    let va = vmm.map(Some(&b), None, FRAME, VmmFlags::empty(), RW).unwrap();
    // cpu1 still runs the kernel context.
    assert!(vmm.fault(cpu1, user_fault(va, Access::Read)).is_err());
    // a has no such range.
    assert!(vmm.fault(cpu0, user_fault(va, Access::Read)).is_err());

    vmm.switch(cpu1, &b).unwrap();
    vmm.fault(cpu1, user_fault(va, Access::Write)).unwrap();
    assert!(vmm.translate(Some(&b), va).unwrap().is_some());
    assert_eq!(vmm.translate(Some(&a), va).unwrap(), None);
}

struct Pattern;

impl Pattern {
    #[allow(clippy::cast_possible_truncation)]
    fn byte(offset: u64) -> u8 {
        (offset % 251) as u8
    }
}

impl MappedFile for Pattern {
    fn populate(&self, offset: u64, page: &mut [u8]) -> Result<(), PopulateError> {
        for (i, b) in page.iter_mut().enumerate() {
            *b = Self::byte(offset + i as u64);
        }
        Ok(())
    }
}

struct Unreadable;

impl MappedFile for Unreadable {
    fn populate(&self, offset: u64, _page: &mut [u8]) -> Result<(), PopulateError> {
        Err(PopulateError { offset })
    }
}

#[test]
fn file_backed_pages_are_filled_from_the_file() {
    let ram = TestRam::new(128);
    let vmm = vmm(&ram, CloneMode::CopyOnWrite, 1);
    let ctx = vmm.create_context().unwrap();

    let va = vmm
        .map_file(
            Some(&ctx),
            None,
            2 * FRAME,
            VmmFlags::empty(),
            MmuFlags::NO_EXECUTE,
            Arc::new(Pattern),
            0x3000,
        )
        .unwrap();
    assert!(ctx.range_containing(va).unwrap().unwrap().flags.contains(VmmFlags::FILE));

    let mut buf = [0; 16];
    vmm.read_bytes(&ctx, va + FRAME + 5, &mut buf).unwrap();
    for (i, b) in buf.iter().enumerate() {
        assert_eq!(*b, Pattern::byte(0x3000 + FRAME + 5 + i as u64));
    }
    assert_eq!(vmm.translate(Some(&ctx), va).unwrap(), None);

    // Splitting keeps the offsets of the remaining piece.
    vmm.unmap(Some(&ctx), va, FRAME).unwrap();
    let tail = ctx.range_containing(va + FRAME).unwrap().unwrap();
    assert_eq!(tail.file_offset(va + FRAME), Some(0x3000 + FRAME));
}

#[test]
fn failed_population_leaves_nothing_behind() {
    let ram = TestRam::new(128);
    let vmm = vmm(&ram, CloneMode::CopyOnWrite, 1);
    let ctx = vmm.create_context().unwrap();
    let used = vmm.pmm().used_frames();

    let err = vmm
        .map_file(Some(&ctx), None, 2 * FRAME, VmmFlags::ALLOCATE, RW, Arc::new(Unreadable), 0)
        .unwrap_err();
    assert_eq!(err, VmmError::Populate(PopulateError { offset: 0 }));
    assert!(ctx.ranges().unwrap().is_empty());
    assert_eq!(vmm.pmm().used_frames(), used);

    let lazy = vmm
        .map_file(Some(&ctx), None, FRAME, VmmFlags::empty(), RW, Arc::new(Unreadable), 0x2000)
        .unwrap();
    assert_eq!(
        vmm.read_bytes(&ctx, lazy, &mut [0; 4]),
        Err(VmmError::Populate(PopulateError { offset: 0x2000 }))
    );
    assert_eq!(vmm.pmm().used_frames(), used);
}

#[test]
fn eager_mapping_rolls_back_on_exhaustion() {
    let ram = TestRam::new(64);
    let vmm = vmm(&ram, CloneMode::CopyOnWrite, 1);
    let ctx = vmm.create_context().unwrap();

    let too_big = (vmm.pmm().free_frames() as u64 + 1) * FRAME;
    let err = vmm
        .map(Some(&ctx), None, too_big, VmmFlags::ALLOCATE, RW)
        .unwrap_err();
    assert!(err.is_out_of_memory(), "{err}");
    assert!(ctx.ranges().unwrap().is_empty());

    let va = vmm.map(Some(&ctx), None, 4 * FRAME, VmmFlags::ALLOCATE, RW).unwrap();
    for i in 0..4 {
        let t = vmm.translate(Some(&ctx), va + i * FRAME).unwrap().unwrap();
        assert_eq!(vmm.refcounts().get(t.phys.frame()), Ok(1));
    }
}

#[test]
fn kernel_mappings_are_shared_and_never_demand_paged() {
    let ram = TestRam::new(128);
    let vmm = vmm(&ram, CloneMode::CopyOnWrite, 1);
    let ctx = vmm.create_context().unwrap();
    let kernel = vmm.kernel_context().clone();

    let va = vmm.map(None, None, 2 * FRAME, VmmFlags::ALLOCATE, RW).unwrap();
    assert!((KERNELSPACE_START..KERNELSPACE_END).contains(&va.as_u64()));
    vmm.write_bytes(&kernel, va + (FRAME - 2), b"span").unwrap();

    // Made after the user context, still visible through its directory.
    let t = vmm.translate(Some(&ctx), va).unwrap().unwrap();
    assert!(!t.flags.contains(MmuFlags::USER));
    let mut buf = [0; 4];
    vmm.read_bytes(&kernel, va + (FRAME - 2), &mut buf).unwrap();
    assert_eq!(&buf, b"span");

    let lazy = vmm.map(None, None, FRAME, VmmFlags::empty(), RW).unwrap();
    assert_eq!(
        vmm.read_bytes(&kernel, lazy, &mut buf),
        Err(VmmError::Unresolved { address: lazy })
    );
}

#[test]
fn mmio_and_dma_mappings() {
    let ram = TestRam::new(128);
    let vmm = vmm(&ram, CloneMode::CopyOnWrite, 1);

    let regs = PhysicalAddress::new(0xFEE0_0020);
    let va = vmm.mmio_map(regs, 0x10, MmuFlags::empty()).unwrap();
    assert_eq!(va.page_offset(), 0x20);
    let t = vmm.translate(None, va).unwrap().unwrap();
    assert_eq!(t.phys, regs);
    assert!(t.flags.contains(MmuFlags::UNCACHED | MmuFlags::WRITABLE));
    assert!(!t.flags.contains(MmuFlags::USER));
    let range = vmm.kernel_context().range_containing(va).unwrap().unwrap();
    assert!(range.flags.contains(VmmFlags::DEVICE));
    vmm.unmap(None, range.start, FRAME).unwrap();
    assert_eq!(vmm.translate(None, va).unwrap(), None);

    let wc = vmm
        .mmio_map(PhysicalAddress::new(0xE000_0000), 3 * FRAME, MmuFlags::WRITE_COMBINE)
        .unwrap();
    let t = vmm.translate(None, wc + 2 * FRAME).unwrap().unwrap();
    assert_eq!(t.phys, PhysicalAddress::new(0xE000_0000 + 2 * FRAME));
    assert_eq!(t.flags.cache_mode(), MmuFlags::WRITE_COMBINE);

    let (buf, phys) = vmm.dma_map(3 * FRAME).unwrap();
    let used = vmm.pmm().used_frames();
    for i in 0..3 {
        let t = vmm.translate(None, buf + i * FRAME).unwrap().unwrap();
        assert_eq!(t.phys, phys + i * FRAME);
        assert_eq!(vmm.refcounts().get(t.phys.frame()), Ok(1));
    }
    vmm.write_bytes(vmm.kernel_context(), buf + 2 * FRAME, b"dma").unwrap();
    assert_eq!(ram.byte(phys + 2 * FRAME), b'd');

    vmm.unmap(None, buf, 3 * FRAME).unwrap();
    assert_eq!(vmm.pmm().used_frames(), used - 3);
}

#[test]
fn busy_contexts_cannot_move_or_die() {
    let ram = TestRam::new(128);
    let vmm = vmm(&ram, CloneMode::CopyOnWrite, 2);
    let (cpu0, cpu1) = (CpuId::new(0), CpuId::new(1));
    let ctx = active_user(&vmm, cpu0);

    assert_eq!(ctx.active_on(), Some(cpu0));
    assert_eq!(vmm.switch(cpu1, &ctx), Err(VmmError::ContextBusy));
    assert_eq!(vmm.destroy_context(&ctx), Err(VmmError::ContextBusy));
    // Re-activating on the same core is fine.
    vmm.switch(cpu0, &ctx).unwrap();

    vmm.switch(cpu0, &vmm.kernel_context().clone()).unwrap();
    assert_eq!(ctx.active_on(), None);
    assert!(vmm.active_context(cpu0).unwrap().is_kernel());

    assert_eq!(vmm.destroy_context(vmm.kernel_context()), Err(VmmError::KernelContext));
    vmm.destroy_context(&ctx).unwrap();
    assert_eq!(vmm.destroy_context(&ctx), Err(VmmError::ContextDestroyed));
    assert_eq!(
        vmm.map(Some(&ctx), None, FRAME, VmmFlags::empty(), RW),
        Err(VmmError::ContextDestroyed)
    );
    assert_eq!(vmm.switch(cpu1, &ctx), Err(VmmError::ContextDestroyed));
}

#[test]
fn destroying_a_context_returns_every_frame() {
    let ram = TestRam::new(128);
    let vmm = vmm(&ram, CloneMode::CopyOnWrite, 1);
    let before = vmm.pmm().used_frames();

    let ctx = vmm.create_context().unwrap();
    vmm.map(Some(&ctx), None, 8 * FRAME, VmmFlags::ALLOCATE, RW).unwrap();
    let far = VirtualAddress::new(0x40_0000_0000);
    vmm.map(Some(&ctx), Some(far), FRAME, VmmFlags::ALLOCATE | VmmFlags::EXACT, RW).unwrap();
    assert!(vmm.pmm().used_frames() > before + 9);

    vmm.destroy_context(&ctx).unwrap();
    assert_eq!(vmm.pmm().used_frames(), before);
}

#[test]
fn slab_caches_can_grow_through_the_kernel_context() {
    let ram = TestRam::new(128);
    let vmm = vmm(&ram, CloneMode::CopyOnWrite, 1);

    let cache = SlabCache::new("vmm-backed", 200, 8, None, None, &vmm, 1).unwrap();
    let objs: Vec<_> = (0..100).map(|_| cache.allocate(BSP).unwrap()).collect();
    for obj in &objs {
        let va = VirtualAddress::from_ptr(obj.as_ptr());
        assert!((KERNELSPACE_START..KERNELSPACE_END).contains(&va.as_u64()));
    }
    assert!(!vmm.kernel_context().ranges().unwrap().is_empty());

    for obj in objs {
        unsafe { cache.free(BSP, obj) };
    }
    cache.destroy();
    assert!(vmm.kernel_context().ranges().unwrap().is_empty());
}

#[test]
fn contexts_fault_in_parallel() {
    const CPUS: usize = 4;
    const PAGES: u64 = 16;

    let ram = TestRam::new(512);
    let vmm = vmm(&ram, CloneMode::CopyOnWrite, CPUS);
    let barrier = Barrier::new(CPUS);

    thread::scope(|s| {
        for n in 0..CPUS {
            let vmm = &vmm;
            let barrier = &barrier;
            s.spawn(move || {
                #[allow(clippy::cast_possible_truncation)]
                let cpu = CpuId::new(n as u16);
                let ctx = active_user(vmm, cpu);
                let va = vmm.map(Some(&ctx), None, PAGES * FRAME, VmmFlags::empty(), RW).unwrap();
                barrier.wait();

                for p in 0..PAGES {
                    vmm.fault(cpu, user_fault(va + p * FRAME, Access::Write)).unwrap();
                    #[allow(clippy::cast_possible_truncation)]
                    let stamp = [n as u8, p as u8];
                    vmm.write_bytes(&ctx, va + p * FRAME, &stamp).unwrap();
                }
                for p in 0..PAGES {
                    let mut stamp = [0; 2];
                    vmm.read_bytes(&ctx, va + p * FRAME, &mut stamp).unwrap();
                    #[allow(clippy::cast_possible_truncation)]
                    let expected = [n as u8, p as u8];
                    assert_eq!(stamp, expected);
                }

                vmm.switch(cpu, vmm.kernel_context()).unwrap();
                vmm.destroy_context(&ctx).unwrap();
            });
        }
    });
}
