//! # Frame Reference Counts
//!
//! One byte per physical frame, counting how many address-space mappings
//! share it. Counts saturate at [`RefCount::MAX`]: an increment that would
//! pass it fails instead of wrapping, and callers fall back to giving the
//! mapping a private copy.
//!
//! The table is sized once from the allocator's frame limit and indexed
//! directly by frame number.

use alloc::boxed::Box;
use alloc::vec;
use kernel_memory_addresses::PhysicalFrame;
use kernel_sync::SpinLock;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RefCountError {
    #[error("frame {frame:?} is beyond the counted range (limit {limit:?})")]
    OutOfRange {
        frame: PhysicalFrame,
        limit: PhysicalFrame,
    },
    #[error("reference count of frame {frame:?} is saturated")]
    Overflow { frame: PhysicalFrame },
    #[error("reference count of frame {frame:?} is already zero")]
    Underflow { frame: PhysicalFrame },
}

/// A saturating per-frame share counter.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct RefCount(u8);

impl RefCount {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u8::MAX);

    #[inline]
    #[must_use]
    pub const fn new(count: u8) -> Self {
        Self(count)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_saturated(self) -> bool {
        self.0 == u8::MAX
    }

    #[inline]
    #[must_use]
    pub const fn checked_increment(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_decrement(self) -> Option<Self> {
        match self.0.checked_sub(1) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }
}

/// The per-frame reference count table.
///
/// Each operation is atomic with respect to the others; a failed operation
/// leaves the count untouched.
pub struct FrameRefCounts {
    counts: SpinLock<Box<[RefCount]>>,
    limit: PhysicalFrame,
}

impl FrameRefCounts {
    /// A table covering frames `0 .. limit`, all counts zero.
    #[must_use]
    pub fn new(limit: PhysicalFrame) -> Self {
        log::debug!("frame reference table: {} entries", limit.number());
        Self {
            counts: SpinLock::new(vec![RefCount::ZERO; limit.index()].into_boxed_slice()),
            limit,
        }
    }

    #[inline]
    #[must_use]
    pub const fn limit(&self) -> PhysicalFrame {
        self.limit
    }

    #[inline]
    fn check(&self, frame: PhysicalFrame) -> Result<usize, RefCountError> {
        if frame < self.limit {
            Ok(frame.index())
        } else {
            Err(RefCountError::OutOfRange {
                frame,
                limit: self.limit,
            })
        }
    }

    /// Current count of `frame`.
    ///
    /// # Errors
    /// [`RefCountError::OutOfRange`] beyond the table.
    pub fn get(&self, frame: PhysicalFrame) -> Result<u8, RefCountError> {
        let i = self.check(frame)?;
        Ok(self.counts.lock_irq()[i].get())
    }

    /// Overwrite the count of `frame`, returning the previous value.
    ///
    /// # Errors
    /// [`RefCountError::OutOfRange`] beyond the table.
    pub fn set(&self, frame: PhysicalFrame, count: u8) -> Result<u8, RefCountError> {
        let i = self.check(frame)?;
        let mut counts = self.counts.lock_irq();
        let prior = counts[i];
        counts[i] = RefCount::new(count);
        Ok(prior.get())
    }

    /// Add one reference and return the new count.
    ///
    /// # Errors
    /// - [`RefCountError::OutOfRange`] beyond the table.
    /// - [`RefCountError::Overflow`] when the count is saturated.
    pub fn increment(&self, frame: PhysicalFrame) -> Result<u8, RefCountError> {
        let i = self.check(frame)?;
        let mut counts = self.counts.lock_irq();
        let next = counts[i]
            .checked_increment()
            .ok_or(RefCountError::Overflow { frame })?;
        counts[i] = next;
        Ok(next.get())
    }

    /// Drop one reference and return the new count.
    ///
    /// # Errors
    /// - [`RefCountError::OutOfRange`] beyond the table.
    /// - [`RefCountError::Underflow`] when the count is already zero.
    pub fn decrement(&self, frame: PhysicalFrame) -> Result<u8, RefCountError> {
        let i = self.check(frame)?;
        let mut counts = self.counts.lock_irq();
        let next = counts[i]
            .checked_decrement()
            .ok_or(RefCountError::Underflow { frame })?;
        counts[i] = next;
        Ok(next.get())
    }
}
