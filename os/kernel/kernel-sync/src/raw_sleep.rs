//! Sleep-capable raw lock.
//!
//! A FIFO ticket lock. A waiter whose ticket is not served after a short spin
//! hands its CPU back through the yield hook the scheduler registered with
//! [`set_yield_hook`]. Until a scheduler exists the hook is a plain spin hint,
//! which makes the lock behave like a ticket spin lock during early boot.

use crate::RawLock;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Spins on the ticket before the waiter yields.
const SPINS_BEFORE_YIELD: u32 = 64;

static YIELD_HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Registers the function waiters call to give up the CPU.
///
/// The scheduler installs this once it can switch threads.
pub fn set_yield_hook(hook: fn()) {
    YIELD_HOOK.store(hook as *mut (), Ordering::Release);
}

fn yield_now() {
    let hook = YIELD_HOOK.load(Ordering::Acquire);
    if hook.is_null() {
        spin_loop();
    } else {
        // SAFETY: only `set_yield_hook` stores into YIELD_HOOK, always a `fn()`.
        let hook = unsafe { core::mem::transmute::<*mut (), fn()>(hook) };
        hook();
    }
}

pub struct RawSleep {
    next: AtomicUsize,
    owner: AtomicUsize,
}

impl Default for RawSleep {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSleep {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
            owner: AtomicUsize::new(0),
        }
    }
}

unsafe impl RawLock for RawSleep {
    const UNLOCKED: Self = Self::new();

    #[inline]
    fn lock(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        let mut spins = 0;
        while self.owner.load(Ordering::Acquire) != ticket {
            if spins < SPINS_BEFORE_YIELD {
                spins += 1;
                spin_loop();
            } else {
                yield_now();
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        let owner = self.owner.load(Ordering::Relaxed);
        self.next
            .compare_exchange(owner, owner.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn is_locked(&self) -> bool {
        self.next.load(Ordering::Relaxed) != self.owner.load(Ordering::Relaxed)
    }

    #[inline]
    unsafe fn unlock(&self) {
        let served = self.owner.load(Ordering::Relaxed);
        self.owner.store(served.wrapping_add(1), Ordering::Release);
    }
}
