#![allow(dead_code)]

use kernel_alloc::cpu::CpuId;
use kernel_alloc::pmm::PhysicalMemoryManager;
use kernel_alloc::vmm::{CloneMode, ContextRef, Vmm, VmmConfig};
use kernel_info::boot::MemoryRegion;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::{PageTableMmu, PhysMapper, RootTable};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;
use std::sync::Arc;

pub const FRAME: u64 = 4096;

/// Simulated RAM: physical address `pa` is byte `pa` of a zeroed heap buffer.
pub struct TestRam {
    base: NonNull<u8>,
    frames: usize,
}

// The buffer is only reached through raw pointers; callers serialize access
// to each frame the way the kernel would.
unsafe impl Send for TestRam {}
unsafe impl Sync for TestRam {}

impl TestRam {
    pub fn new(frames: usize) -> Self {
        let base = NonNull::new(unsafe { alloc_zeroed(Self::layout(frames)) }).expect("test RAM");
        Self { base, frames }
    }

    fn layout(frames: usize) -> Layout {
        Layout::from_size_align(frames * FRAME as usize, FRAME as usize).unwrap()
    }

    /// All of RAM except frame 0.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        vec![MemoryRegion::available(FRAME, self.frames as u64 * FRAME)]
    }

    pub fn byte(&self, pa: PhysicalAddress) -> u8 {
        unsafe { *self.phys_to_ptr(pa) }
    }
}

impl Drop for TestRam {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), Self::layout(self.frames)) }
    }
}

impl PhysMapper for TestRam {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        assert!(pa.as_u64() < self.frames as u64 * FRAME, "{pa:?} is beyond test RAM");
        unsafe { self.base.as_ptr().add(pa.as_u64() as usize) }
    }

    fn ptr_to_phys(&self, ptr: *const u8) -> Option<PhysicalAddress> {
        let offset = (ptr as usize).checked_sub(self.base.as_ptr() as usize)?;
        (offset < self.frames * FRAME as usize).then(|| PhysicalAddress::new(offset as u64))
    }
}

pub type TestVmm<'a> = Vmm<PageTableMmu<&'a TestRam>, &'a TestRam>;
pub type TestContext = ContextRef<RootTable>;

pub fn vmm(ram: &TestRam, clone_mode: CloneMode, cpus: usize) -> TestVmm<'_> {
    let config = VmmConfig { clone_mode, cpus };
    Vmm::init(&ram.regions(), PageTableMmu::new(ram), ram, config).expect("vmm init")
}

pub fn vmm_with_pmm(ram: &TestRam, pmm: Arc<PhysicalMemoryManager>) -> TestVmm<'_> {
    let config = VmmConfig {
        clone_mode: CloneMode::CopyOnWrite,
        cpus: 1,
    };
    Vmm::with_pmm(pmm, PageTableMmu::new(ram), ram, config).expect("vmm init")
}

/// A user context made active on `cpu`.
pub fn active_user(vmm: &TestVmm<'_>, cpu: CpuId) -> TestContext {
    let ctx = vmm.create_context().unwrap();
    vmm.switch(cpu, &ctx).unwrap();
    ctx
}
