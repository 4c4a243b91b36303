use kernel_alloc::pmm::{PhysicalMemoryManager, PmmError, Zone};
use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier, Mutex};
use std::{panic, thread};

const BASE: u64 = 0x10_0000;
const FRAME: u64 = 4096;

fn pmm(frames: u64) -> PhysicalMemoryManager {
    PhysicalMemoryManager::new(&[MemoryRegion::available(BASE, BASE + frames * FRAME)]).unwrap()
}

#[test]
fn full_section_refuses_one_more_frame() {
    let pmm = pmm(1024);
    assert_eq!(pmm.total_frames(), 1024);

    let mut seen = BTreeSet::new();
    for _ in 0..1024 {
        let pa = pmm.allocate_page(Zone::Default).unwrap();
        assert!(pa.is_page_aligned());
        assert!(pmm.contains(pa));
        assert!(seen.insert(pa.as_u64()), "{pa:?} handed out twice");
    }
    assert_eq!(
        pmm.allocate_page(Zone::Default),
        Err(PmmError::OutOfMemory { requested: 1 })
    );

    let some = *seen.iter().nth(517).unwrap();
    pmm.free_page(kernel_memory_addresses::PhysicalAddress::new(some));
    let again = pmm.allocate_page(Zone::Default).unwrap();
    assert_eq!(again.as_u64(), some);
    assert_eq!(pmm.free_frames(), 0);
}

#[test]
fn reserved_regions_are_never_handed_out() {
    let pmm = PhysicalMemoryManager::new(&[
        MemoryRegion::available(BASE, BASE + 4 * FRAME),
        MemoryRegion::new(BASE + 4 * FRAME, BASE + 8 * FRAME, MemoryRegionKind::Reserved),
        MemoryRegion::available(BASE + 8 * FRAME + 0x10, BASE + 12 * FRAME),
    ])
    .unwrap();
    // The partial first page of the last region is dropped.
    assert_eq!(pmm.total_frames(), 7);

    let reserved = (BASE + 4 * FRAME)..(BASE + 9 * FRAME);
    for _ in 0..7 {
        let pa = pmm.allocate_page(Zone::Default).unwrap();
        assert!(!reserved.contains(&pa.as_u64()), "{pa:?} is reserved");
    }
    assert!(pmm.allocate_page(Zone::Default).is_err());
}

#[test]
fn contiguous_runs_need_one_unfragmented_section() {
    let pmm = pmm(16);
    let frames: Vec<_> = (0..16)
        .map(|_| pmm.allocate_page(Zone::Default).unwrap())
        .collect();
    // Free every other frame: half the memory is free but no two frames touch.
    for pa in frames.iter().step_by(2) {
        pmm.free_page(*pa);
    }
    assert_eq!(pmm.free_frames(), 8);
    assert_eq!(
        pmm.allocate_pages(2, Zone::Default),
        Err(PmmError::OutOfMemory { requested: 2 })
    );

    pmm.free_page(frames[1]);
    let run = pmm.allocate_pages(3, Zone::Default).unwrap();
    assert_eq!(run, frames[0]);
    pmm.free_pages(run, 3);
}

#[test]
fn double_free_is_fatal() {
    let pmm = pmm(4);
    let pa = pmm.allocate_page(Zone::Default).unwrap();
    pmm.free_page(pa);
    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| pmm.free_page(pa)));
    assert!(result.is_err());
}

#[test]
fn concurrent_allocations_never_alias() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 200;

    let pmm = Arc::new(pmm(THREADS as u64 * PER_THREAD as u64));
    let barrier = Arc::new(Barrier::new(THREADS));
    let all = Arc::new(Mutex::new(BTreeSet::new()));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let pmm = Arc::clone(&pmm);
            let barrier = Arc::clone(&barrier);
            let all = Arc::clone(&all);
            thread::spawn(move || {
                barrier.wait();
                let mut mine = Vec::with_capacity(PER_THREAD);
                for i in 0..PER_THREAD {
                    mine.push(pmm.allocate_page(Zone::Default).unwrap());
                    // Churn a little so hints move back and forth.
                    if (i + t) % 7 == 0 {
                        let pa = mine.pop().unwrap();
                        pmm.free_page(pa);
                        mine.push(pmm.allocate_page(Zone::Default).unwrap());
                    }
                }
                let mut all = all.lock().unwrap();
                for pa in mine {
                    assert!(all.insert(pa.as_u64()), "{pa:?} handed out twice");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(all.lock().unwrap().len(), THREADS * PER_THREAD);
    assert_eq!(pmm.free_frames(), 0);
}
