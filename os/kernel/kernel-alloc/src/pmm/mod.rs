//! # Physical Memory Manager
//!
//! Hands out 4 KiB frames from the boot memory map.
//!
//! Usable RAM is split into *sections*, each tracking its frames in a bitmap
//! behind its own lock. A set bit means "allocated". Each section remembers
//! the first word that may still contain a clear bit, so repeated single-frame
//! allocations do not rescan the full prefix.
//!
//! ```text
//! zone Default ─┬─ section [0x0010_0000 .. 0x0800_0000)  bitmap + hint
//!               ├─ section [0x0800_0000 .. 0x1000_0000)  bitmap + hint
//!               └─ ...
//! ```
//!
//! Regions larger than [`PMM_SECTION_MAX_FRAMES`] are split so that
//! allocations on different cores usually take different locks.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::pmm::{PhysicalMemoryManager, Zone};
//! use kernel_info::boot::MemoryRegion;
//!
//! let pmm = PhysicalMemoryManager::new(&[MemoryRegion::available(0x10_0000, 0x20_0000)]).unwrap();
//! let frame = pmm.allocate_page(Zone::Default).unwrap();
//! assert!(frame.is_page_aligned());
//! pmm.free_page(frame);
//! assert_eq!(pmm.used_frames(), 0);
//! ```

mod section;

use crate::pmm::section::Section;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::PMM_SECTION_MAX_FRAMES;
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, page_align_down, page_align_up};
use kernel_vmem::FrameAlloc;

/// Allocation zone.
///
/// Only a single general-purpose zone exists today; the parameter is kept on
/// every allocation so that DMA-limited zones can be added without touching
/// callers.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum Zone {
    #[default]
    Default,
}

impl Zone {
    const COUNT: usize = 1;

    #[inline]
    const fn index(self) -> usize {
        match self {
            Self::Default => 0,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PmmError {
    #[error("out of physical memory ({requested} frame(s) requested)")]
    OutOfMemory { requested: usize },
    #[error("a frame count of zero was requested")]
    InvalidCount,
    #[error("the memory map contains no usable memory")]
    NoUsableMemory,
}

/// The physical frame allocator.
pub struct PhysicalMemoryManager {
    zones: [Vec<Section>; Zone::COUNT],
    total: usize,
    used: AtomicUsize,
    /// One past the highest managed frame.
    limit: PhysicalFrame,
}

impl PhysicalMemoryManager {
    /// Build the allocator from the boot memory map.
    ///
    /// Only [`Available`](kernel_info::boot::MemoryRegionKind::Available)
    /// regions are used. Their bounds are shrunk to whole pages; regions
    /// smaller than one page after that are ignored. Overlapping available
    /// regions are merged, and any other region kind is cut out of them, so
    /// every frame is tracked exactly once.
    ///
    /// # Errors
    /// [`PmmError::NoUsableMemory`] if not a single frame remains.
    pub fn new(regions: &[MemoryRegion]) -> Result<Self, PmmError> {
        let mut sections = Vec::new();

        for (start, end) in usable_spans(regions) {
            let mut frame = PhysicalAddress::new(start).frame();
            let last = PhysicalAddress::new(end).frame();
            while frame < last {
                #[allow(clippy::cast_possible_truncation)]
                let frames = ((last - frame) as usize).min(PMM_SECTION_MAX_FRAMES);
                sections.push(Section::new(frame, frames));
                frame = frame + frames as u64;
            }
        }

        if sections.is_empty() {
            log::error!("no usable physical memory in {} region(s)", regions.len());
            return Err(PmmError::NoUsableMemory);
        }

        let total = sections.iter().map(Section::frames).sum();
        let limit = sections
            .iter()
            .map(Section::end)
            .max()
            .unwrap_or_default();

        log::info!(
            "physical memory: {} frames ({} KiB) in {} section(s), highest frame {:?}",
            total,
            total * 4,
            sections.len(),
            limit
        );

        Ok(Self {
            zones: [sections],
            total,
            used: AtomicUsize::new(0),
            limit,
        })
    }

    #[inline]
    fn sections(&self, zone: Zone) -> &[Section] {
        &self.zones[zone.index()]
    }

    fn section_of(&self, frame: PhysicalFrame) -> Option<&Section> {
        self.zones
            .iter()
            .flat_map(|z| z.iter())
            .find(|s| s.contains(frame))
    }

    /// Allocate one frame.
    ///
    /// # Errors
    /// [`PmmError::OutOfMemory`] when the zone is exhausted.
    pub fn allocate_page(&self, zone: Zone) -> Result<PhysicalAddress, PmmError> {
        let frame = self
            .sections(zone)
            .iter()
            .filter(|s| s.free() > 0)
            .find_map(Section::allocate_one)
            .ok_or(PmmError::OutOfMemory { requested: 1 })?;

        self.used.fetch_add(1, Ordering::Relaxed);
        log::trace!("allocated frame {frame:?}");
        Ok(frame.base())
    }

    /// Allocate `count` physically contiguous frames and return the first.
    ///
    /// A run never spans two sections.
    ///
    /// # Errors
    /// - [`PmmError::InvalidCount`] for `count == 0`.
    /// - [`PmmError::OutOfMemory`] when no section holds a free run that long.
    pub fn allocate_pages(&self, count: usize, zone: Zone) -> Result<PhysicalAddress, PmmError> {
        if count == 0 {
            return Err(PmmError::InvalidCount);
        }
        if count == 1 {
            return self.allocate_page(zone);
        }

        let frame = self
            .sections(zone)
            .iter()
            .filter(|s| s.free() >= count)
            .find_map(|s| s.allocate_run(count))
            .ok_or(PmmError::OutOfMemory { requested: count })?;

        self.used.fetch_add(count, Ordering::Relaxed);
        log::trace!("allocated {count} frames at {frame:?}");
        Ok(frame.base())
    }

    /// Like [`allocate_page`](Self::allocate_page) for callers that cannot
    /// recover from exhaustion.
    ///
    /// # Panics
    /// When no frame is available; the allocator state is dumped first.
    pub fn allocate_page_critical(&self, zone: Zone) -> PhysicalAddress {
        self.allocate_pages_critical(1, zone)
    }

    /// Like [`allocate_pages`](Self::allocate_pages) for callers that cannot
    /// recover from exhaustion.
    ///
    /// # Panics
    /// When the allocation fails; the allocator state is dumped first.
    pub fn allocate_pages_critical(&self, count: usize, zone: Zone) -> PhysicalAddress {
        match self.allocate_pages(count, zone) {
            Ok(pa) => pa,
            Err(e) => {
                log::error!("critical physical allocation of {count} frame(s) failed: {e}");
                self.dump();
                panic!("critical physical allocation failed: {e}");
            }
        }
    }

    /// Return one frame.
    ///
    /// # Panics
    /// If `pa` is not the base of a currently allocated frame of this
    /// allocator.
    pub fn free_page(&self, pa: PhysicalAddress) {
        self.free_pages(pa, 1);
    }

    /// Return `count` frames starting at `base`.
    ///
    /// Frames can be returned in any grouping; they need not match the
    /// allocation that produced them.
    ///
    /// # Panics
    /// If any frame is unknown, not allocated, or the run crosses a section
    /// boundary.
    pub fn free_pages(&self, base: PhysicalAddress, count: usize) {
        if count == 0 {
            return;
        }
        assert!(base.is_page_aligned(), "freeing unaligned frame {base:?}");

        let frame = base.frame();
        let Some(section) = self.section_of(frame) else {
            log::error!("free of unmanaged frame {frame:?}");
            panic!("freeing a frame this allocator does not manage");
        };
        assert!(
            section.contains_run(frame, count),
            "frame run {frame:?}+{count} crosses a section boundary"
        );

        section.free_run(frame, count);
        self.used.fetch_sub(count, Ordering::Relaxed);
        log::trace!("freed {count} frame(s) at {frame:?}");
    }

    /// Whether `pa` falls into a managed frame.
    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        self.section_of(pa.frame()).is_some()
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.total
    }

    #[inline]
    #[must_use]
    pub fn used_frames(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.total - self.used_frames()
    }

    /// One past the highest managed frame number; sizes per-frame tables.
    #[inline]
    #[must_use]
    pub const fn frame_limit(&self) -> PhysicalFrame {
        self.limit
    }

    /// Log every section's occupancy.
    pub fn dump(&self) {
        log::info!(
            "pmm: {} of {} frames used",
            self.used_frames(),
            self.total_frames()
        );
        for (zone, sections) in self.zones.iter().enumerate() {
            for s in sections {
                log::info!(
                    "  zone {zone} {:?}..{:?}: {}/{} free, hint word {}",
                    s.base(),
                    s.end(),
                    s.free(),
                    s.frames(),
                    s.first_free_hint()
                );
            }
        }
    }
}

impl FrameAlloc for PhysicalMemoryManager {
    fn allocate_frame(&self) -> Option<PhysicalAddress> {
        self.allocate_page(Zone::Default).ok()
    }

    unsafe fn free_frame(&self, frame: PhysicalAddress) {
        self.free_page(frame);
    }
}

/// Disjoint, sorted, page-aligned `[start, end)` spans of allocatable memory.
fn usable_spans(regions: &[MemoryRegion]) -> Vec<(u64, u64)> {
    let mut spans: Vec<(u64, u64)> = regions
        .iter()
        .filter(|r| r.kind.is_allocatable())
        .filter_map(|r| {
            let start = page_align_up(r.start.as_u64());
            let end = page_align_down(r.end.as_u64());
            if start < end {
                Some((start, end))
            } else {
                log::debug!("skipping sub-page region {r:?}");
                None
            }
        })
        .collect();
    spans.sort_unstable();

    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start < last.1 => {
                log::warn!(
                    "memory map has overlapping available regions at {:?}",
                    PhysicalAddress::new(start)
                );
                last.1 = last.1.max(end);
            }
            _ => merged.push((start, end)),
        }
    }

    // Anything the map reports as not available wins over available memory.
    for hole in regions.iter().filter(|r| !r.kind.is_allocatable()) {
        let lo = page_align_down(hole.start.as_u64());
        let hi = page_align_up(hole.end.as_u64());
        if lo >= hi || !merged.iter().any(|&(s, e)| lo < e && s < hi) {
            continue;
        }
        log::warn!("{hole:?} overlaps available memory, excluding it");
        merged = merged
            .into_iter()
            .flat_map(|(s, e)| [(s, e.min(lo)), (s.max(hi), e)])
            .filter(|&(s, e)| s < e)
            .collect();
    }
    merged
}
