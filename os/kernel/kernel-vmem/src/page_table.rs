//! # Page Tables
//!
//! Every level of the x86-64 hierarchy is the same 4 KiB array of 512
//! [`PageEntryBits`]; what differs is which virtual-address bits select the
//! entry. [`TableLevel`] captures that.

use crate::PageEntryBits;
use kernel_memory_addresses::VirtualAddress;

/// Entries per table at every level.
pub const ENTRIES: usize = 512;

/// One level of the four-level hierarchy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TableLevel {
    /// Page Map Level 4 (root), VA bits `[47:39]`.
    Pml4,
    /// Page Directory Pointer Table, VA bits `[38:30]`.
    Pdpt,
    /// Page Directory, VA bits `[29:21]`.
    Pd,
    /// Page Table (leaves), VA bits `[20:12]`.
    Pt,
}

impl TableLevel {
    /// Walk order from the root down to the leaves.
    pub const WALK: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// The level below, or `None` for [`TableLevel::Pt`].
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    /// The entry index `va` selects at this level (`0..512`).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1FF) as usize
    }
}

/// One page table: 512 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; ENTRIES],
}

impl PageTable {
    /// Clear every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries = [PageEntryBits::new(); ENTRIES];
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageEntryBits {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageEntryBits) {
        self.entries[index] = entry;
    }

    /// Whether no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_select_the_documented_bits() {
        let va = VirtualAddress::new(0xFFFF_8888_0123_4567);
        assert_eq!(TableLevel::Pml4.index(va), 0x111);
        assert_eq!(TableLevel::Pdpt.index(va), 0x020);
        assert_eq!(TableLevel::Pd.index(va), 0x009);
        assert_eq!(TableLevel::Pt.index(va), 0x034);
        for level in TableLevel::WALK {
            assert!(level.index(VirtualAddress::new(u64::MAX)) < ENTRIES);
        }
    }

    #[test]
    fn table_is_one_page() {
        assert_eq!(size_of::<PageTable>(), 4096);
        assert_eq!(align_of::<PageTable>(), 4096);
    }
}
