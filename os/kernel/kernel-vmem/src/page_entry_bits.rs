use crate::MmuFlags;
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// A single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// Only 4 KiB leaves are used, so bit 7 is always the PTE's **PAT** bit in a
/// leaf and always clear in a table link.
///
/// ### Bit layout
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PAT`             | PAT index bit 2 (leaf only) |
/// | 8         | `G`               | Global (leaf only) |
/// | 9–11      | OS avail low      | Reserved for OS use |
/// | 12–51     | `addr`            | Physical frame bits [51:12] |
/// | 52–58     | OS avail high     | Reserved for OS use |
/// | 59–62     | `PKU` / OS use    | Protection key or OS use |
/// | 63        | `NX`              | Execute disable |
///
/// ### Cache modes
///
/// `PAT:PCD:PWT` form an index into the PAT MSR, which is expected to hold
/// [`PageEntryBits::PAT_LAYOUT`]:
///
/// | Index | Mode |
/// |-------|------|
/// | 0     | write-back |
/// | 1     | write-through |
/// | 2, 3  | uncached |
/// | 4     | write-combining |
/// | 5     | write-through |
/// | 6, 7  | uncached |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::{MmuFlags, PageEntryBits};
/// let e = PageEntryBits::leaf(PhysicalAddress::new(0x12_3000), MmuFlags::WRITABLE);
/// assert!(e.present());
/// assert!(e.writable());
/// assert_eq!(e.physical_address().as_u64(), 0x12_3000);
/// ```
#[bitfield(u64)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on the first write through a leaf.
    pub dirty: bool,

    /// PAT (bit 7) in a 4 KiB leaf; must be clear in table links.
    pub pat: bool,

    /// Global (G, bit 8) — **leaf only**.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical address bits [51:12] (bits 12..=51).
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (PKU, bits 59..=62) if supported; otherwise OS use.
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntryBits {
    /// PAT MSR value matching the cache-mode table above.
    pub const PAT_LAYOUT: u64 = 0x0007_0401_0007_0406;

    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// A link to a next-level table.
    ///
    /// Links are maximally permissive; the leaf decides the effective rights.
    /// `user` must be set for links in the user half or user mode cannot
    /// reach any leaf below.
    #[inline]
    #[must_use]
    pub const fn table(table: PhysicalAddress, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
            .with_phys_addr_bits_51_12(table.as_u64() >> 12)
    }

    /// A present 4 KiB leaf mapping `frame` with `flags`.
    #[must_use]
    pub const fn leaf(frame: PhysicalAddress, flags: MmuFlags) -> Self {
        let (pat, pcd, pwt) = if flags.contains(MmuFlags::UNCACHED) {
            (false, true, false)
        } else if flags.contains(MmuFlags::WRITE_COMBINE) {
            (true, false, false)
        } else if flags.contains(MmuFlags::WRITE_THROUGH) {
            (false, false, true)
        } else {
            (false, false, false)
        };

        Self::new()
            .with_present(true)
            .with_writable(flags.contains(MmuFlags::WRITABLE))
            .with_user_access(flags.contains(MmuFlags::USER))
            .with_no_execute(flags.contains(MmuFlags::NO_EXECUTE))
            .with_global_translation(flags.contains(MmuFlags::GLOBAL))
            .with_pat(pat)
            .with_cache_disabled(pcd)
            .with_write_through(pwt)
            .with_phys_addr_bits_51_12(frame.as_u64() >> 12)
    }

    /// Decode a leaf back into [`MmuFlags`]. Empty if not present.
    #[must_use]
    pub const fn mmu_flags(self) -> MmuFlags {
        if !self.present() {
            return MmuFlags::empty();
        }

        let mut flags = MmuFlags::PRESENT;
        if self.writable() {
            flags = flags.union(MmuFlags::WRITABLE);
        }
        if self.user_access() {
            flags = flags.union(MmuFlags::USER);
        }
        if self.no_execute() {
            flags = flags.union(MmuFlags::NO_EXECUTE);
        }
        if self.global_translation() {
            flags = flags.union(MmuFlags::GLOBAL);
        }

        let index = ((self.pat() as u8) << 2)
            | ((self.cache_disabled() as u8) << 1)
            | (self.write_through() as u8);
        let cache = match index {
            0 => MmuFlags::empty(),
            1 | 5 => MmuFlags::WRITE_THROUGH,
            4 => MmuFlags::WRITE_COMBINE,
            _ => MmuFlags::UNCACHED,
        };
        flags.union(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_modes_survive_encoding() {
        let pa = PhysicalAddress::new(0x20_0000);
        for mode in [
            MmuFlags::empty(),
            MmuFlags::WRITE_COMBINE,
            MmuFlags::WRITE_THROUGH,
            MmuFlags::UNCACHED,
        ] {
            let e = PageEntryBits::leaf(pa, MmuFlags::WRITABLE | mode);
            assert_eq!(e.mmu_flags().cache_mode(), mode);
            assert!(!e.pat() || mode == MmuFlags::WRITE_COMBINE);
        }
    }

    #[test]
    fn table_links_are_permissive() {
        let e = PageEntryBits::table(PhysicalAddress::new(0x5000), true);
        assert!(e.present() && e.writable() && e.user_access());
        assert!(!e.no_execute() && !e.pat());
        assert_eq!(e.physical_address().as_u64(), 0x5000);
    }

    #[test]
    fn not_present_entry_has_no_flags() {
        assert_eq!(PageEntryBits::new().mmu_flags(), MmuFlags::empty());
    }
}
