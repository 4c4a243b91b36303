//! # Kernel synchronization primitives
//!
//! The memory-management core needs exactly two kinds of lock:
//!
//! | Alias | Raw lock | Behavior under contention |
//! |-------|----------|---------------------------|
//! | [`SpinLock<T>`] | [`RawSpin`] | Busy-waits. Never blocks, usable with interrupts disabled. |
//! | [`SleepMutex<T>`] | [`RawSleep`] | FIFO ticket lock, yields to the scheduler while waiting. |
//!
//! Both are the same [`Mutex<T, R>`] with a different raw lock. Short critical
//! sections that may run in interrupt context take a [`SpinLock`] through
//! [`Mutex::lock_irq`], which also masks local interrupts for the lifetime of
//! the guard (see [`irq`]).
//!
//! ```rust
//! use kernel_sync::{SleepMutex, SpinLock};
//!
//! let counter = SpinLock::new(0_u32);
//! *counter.lock() += 1;
//!
//! let ranges = SleepMutex::new(Vec::<u64>::new());
//! ranges.with_lock(|r| r.push(0x1000));
//! assert_eq!(ranges.lock().len(), 1);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod raw_sleep;
mod raw_spin;

pub use irq::{IrqGuard, IrqMutexGuard};
pub use mutex::{Mutex, MutexGuard, RawLock};
pub use raw_sleep::{RawSleep, set_yield_hook};
pub use raw_spin::RawSpin;

/// Non-blocking, busy-waiting lock.
pub type SpinLock<T> = Mutex<T, RawSpin>;

/// Sleep-capable lock; waiters yield to the scheduler.
pub type SleepMutex<T> = Mutex<T, RawSleep>;
