bitflags::bitflags! {
    /// Architecture-neutral translation flags.
    ///
    /// Ranges carry these as their protection; the MMU backend encodes them
    /// into whatever its page-table format needs. The absence of a flag is the
    /// conservative choice: read-only, supervisor-only, write-back cached.
    ///
    /// At most one cache-mode flag should be set; with none the mapping is
    /// write-back.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MmuFlags: u32 {
        /// Translation is present. Reported by queries; implied when mapping.
        const PRESENT        = 1 << 0;
        /// Writes are permitted.
        const WRITABLE       = 1 << 1;
        /// User mode may access the page.
        const USER           = 1 << 2;
        /// Instruction fetches fault.
        const NO_EXECUTE     = 1 << 3;
        /// Survives directory switches in the TLB.
        const GLOBAL         = 1 << 4;
        /// Write-combining cache mode.
        const WRITE_COMBINE  = 1 << 5;
        /// Write-through cache mode.
        const WRITE_THROUGH  = 1 << 6;
        /// Uncached.
        const UNCACHED       = 1 << 7;
    }
}

impl MmuFlags {
    /// All cache-mode selector bits.
    pub const CACHE_MODE: Self = Self::WRITE_COMBINE
        .union(Self::WRITE_THROUGH)
        .union(Self::UNCACHED);

    /// The cache-mode part of these flags.
    #[inline]
    #[must_use]
    pub const fn cache_mode(self) -> Self {
        self.intersection(Self::CACHE_MODE)
    }

    /// These flags with write permission removed.
    #[inline]
    #[must_use]
    pub const fn read_only(self) -> Self {
        self.difference(Self::WRITABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_keeps_other_bits() {
        let f = MmuFlags::WRITABLE | MmuFlags::USER | MmuFlags::UNCACHED;
        assert_eq!(f.read_only(), MmuFlags::USER | MmuFlags::UNCACHED);
        assert_eq!(f.cache_mode(), MmuFlags::UNCACHED);
        assert_eq!(MmuFlags::USER.cache_mode(), MmuFlags::empty());
    }
}
