use crate::{PAGE_SIZE, VirtualAddress, page_align_down};
use core::fmt;

/// The page-aligned base of a virtual page.
///
/// ### Invariants
/// - The wrapped base address always has its low [`PAGE_SHIFT`](crate::PAGE_SHIFT) bits clear.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(VirtualAddress);

impl VirtualPage {
    /// The page containing `va`.
    #[inline]
    #[must_use]
    pub const fn containing(va: VirtualAddress) -> Self {
        Self(VirtualAddress::new(page_align_down(va.as_u64())))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.0
    }

    /// One past the last byte of the page.
    #[inline]
    #[must_use]
    pub const fn end(self) -> VirtualAddress {
        VirtualAddress::new(self.0.as_u64() + PAGE_SIZE)
    }

    /// The following page.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.end())
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.0.as_u64() && va.as_u64() < self.end().as_u64()
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage({:?})", self.0)
    }
}
