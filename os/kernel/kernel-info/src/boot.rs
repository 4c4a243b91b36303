//! # Boot-Time Physical Memory Regions
//!
//! The loader hands the kernel a list of [`MemoryRegion`]s describing physical
//! memory. The frame allocator consumes the list once at initialization and
//! never looks at it again.

use kernel_memory_addresses::PhysicalAddress;

/// Classification of a physical memory span.
///
/// Keep this `#[repr(u32)]`; the discriminants are part of the loader ABI.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemoryRegionKind {
    /// Free RAM, usable by the frame allocator.
    Available = 0,
    /// Firmware or hardware reserved.
    Reserved = 1,
    /// ACPI non-volatile storage; must be preserved.
    AcpiNvs = 2,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 3,
    /// Defective RAM reported by firmware.
    BadRam = 4,
    /// A boot module (initrd, driver image, ...).
    Module = 5,
    /// The kernel image itself.
    Kernel = 6,
}

impl MemoryRegionKind {
    /// Whether spans of this kind may be handed out by the frame allocator.
    #[inline]
    #[must_use]
    pub const fn is_allocatable(self) -> bool {
        matches!(self, Self::Available)
    }
}

/// One `[start, end)` span of physical memory.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[inline]
    #[must_use]
    pub const fn new(start: u64, end: u64, kind: MemoryRegionKind) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            end: PhysicalAddress::new(end),
            kind,
        }
    }

    /// Shorthand for an [`Available`](MemoryRegionKind::Available) span.
    #[inline]
    #[must_use]
    pub const fn available(start: u64, end: u64) -> Self {
        Self::new(start, end, MemoryRegionKind::Available)
    }

    /// Length in bytes; zero for inverted spans.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64().saturating_sub(self.start.as_u64())
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_available_memory_is_allocatable() {
        assert!(MemoryRegionKind::Available.is_allocatable());
        for kind in [
            MemoryRegionKind::Reserved,
            MemoryRegionKind::AcpiNvs,
            MemoryRegionKind::AcpiReclaimable,
            MemoryRegionKind::BadRam,
            MemoryRegionKind::Module,
            MemoryRegionKind::Kernel,
        ] {
            assert!(!kind.is_allocatable(), "{kind:?}");
        }
    }

    #[test]
    fn inverted_region_is_empty() {
        let r = MemoryRegion::available(0x2000, 0x1000);
        assert!(r.is_empty());
        assert_eq!(MemoryRegion::available(0x1000, 0x3000).len(), 0x2000);
    }
}
