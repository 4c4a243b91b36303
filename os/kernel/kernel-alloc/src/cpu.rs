use core::fmt;

/// Logical index of a processor core.
///
/// Per-core tables in this crate are indexed by it. The caller is
/// responsible for passing the index of the core it is actually running on
/// and for not migrating while per-core state is in use.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CpuId(u16);

impl CpuId {
    /// The bootstrap processor.
    pub const BSP: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl From<u16> for CpuId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}
