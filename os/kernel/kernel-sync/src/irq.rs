//! Interrupt masking for locks that may be taken from interrupt context.
//!
//! On bare-metal x86-64 an [`IrqGuard`] snapshots `RFLAGS.IF`, executes `cli`,
//! and restores the flag on drop. On hosted targets (unit tests, tooling) there
//! are no interrupts to mask and the guard is inert.

use crate::{Mutex, MutexGuard, RawLock};
use core::ops::{Deref, DerefMut};

/// A mutex guard that also disables interrupts while held.
///
/// Created via [`Mutex::lock_irq`]. It first masks local interrupts, then
/// acquires the lock, and releases both in reverse order on drop. An interrupt
/// handler on the same core therefore cannot re-enter a critical section
/// protected by the same lock.
///
/// # Examples
///
/// ```rust
/// use kernel_sync::SpinLock;
///
/// static M: SpinLock<u64> = SpinLock::new(0);
///
/// {
///     let mut g = M.lock_irq();
///     *g += 1;
/// }
/// assert_eq!(*M.lock(), 1);
/// ```
pub struct IrqMutexGuard<'a, T: ?Sized, R: RawLock> {
    // Field order matters: the lock is released before interrupts return.
    guard: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T: ?Sized, R: RawLock> Mutex<T, R> {
    /// Acquires the mutex with interrupts disabled for the guard's lifetime.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutexGuard<'_, T, R> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqMutexGuard { guard, _irq: irq }
    }

    /// Like [`try_lock`](Mutex::try_lock), with interrupts disabled while held.
    #[inline]
    pub fn try_lock_irq(&self) -> Option<IrqMutexGuard<'_, T, R>> {
        let irq = IrqGuard::new();
        let guard = self.try_lock()?;
        Some(IrqMutexGuard { guard, _irq: irq })
    }
}

impl<T: ?Sized, R: RawLock> Deref for IrqMutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized, R: RawLock> DerefMut for IrqMutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Whether maskable interrupts are currently enabled on this core.
///
/// Always `false` on hosted targets.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    arch::interrupts_enabled()
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Interrupts are re-enabled on drop **only** if they were enabled when the
/// guard was created, so guards nest.
pub struct IrqGuard {
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = arch::interrupts_enabled();
        if enabled {
            arch::disable();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            arch::enable();
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    /// `RFLAGS.IF`
    const INTERRUPT_FLAG: u64 = 1 << 9;

    #[inline]
    pub fn interrupts_enabled() -> bool {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        r & INTERRUPT_FLAG != 0
    }

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    #[inline]
    pub const fn interrupts_enabled() -> bool {
        false
    }

    #[inline]
    pub const fn disable() {}

    #[inline]
    pub const fn enable() {}
}
