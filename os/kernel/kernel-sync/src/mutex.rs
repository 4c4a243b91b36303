use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// The lock word behind a [`Mutex`].
///
/// # Safety
/// A successful [`lock`](Self::lock) or [`try_lock`](Self::try_lock) must
/// exclude every other holder until the matching [`unlock`](Self::unlock).
pub unsafe trait RawLock {
    /// The unlocked state.
    const UNLOCKED: Self;

    fn lock(&self);

    fn try_lock(&self) -> bool;

    /// Snapshot; stale as soon as it is returned.
    fn is_locked(&self) -> bool;

    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn unlock(&self);
}

/// A value protected by the raw lock `R`.
pub struct Mutex<T: ?Sized, R> {
    raw: R,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send, R: RawLock + Sync> Sync for Mutex<T, R> {}
unsafe impl<T: ?Sized + Send, R: RawLock + Send> Send for Mutex<T, R> {}

impl<T, R: RawLock> Mutex<T, R> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: R::UNLOCKED,
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized, R: RawLock> Mutex<T, R> {
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.lock();
        MutexGuard::new(self)
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        self.raw.try_lock().then(|| MutexGuard::new(self))
    }

    #[inline]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        f(&mut self.lock())
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Exclusive borrow proves there is no other holder.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T: ?Sized + fmt::Debug, R: RawLock> fmt::Debug for Mutex<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(g) => f.debug_struct("Mutex").field("value", &&*g).finish(),
            None => f.debug_struct("Mutex").field("value", &format_args!("<locked>")).finish(),
        }
    }
}

/// Proof of holding a [`Mutex`]. Releases it on drop.
///
/// Guards stay on the core that took them.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard<'a, T: ?Sized, R: RawLock> {
    mutex: &'a Mutex<T, R>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync, R: RawLock + Sync> Sync for MutexGuard<'_, T, R> {}

impl<'a, T: ?Sized, R: RawLock> MutexGuard<'a, T, R> {
    const fn new(mutex: &'a Mutex<T, R>) -> Self {
        Self {
            mutex,
            _not_send: PhantomData,
        }
    }
}

impl<T: ?Sized, R: RawLock> Deref for MutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized, R: RawLock> DerefMut for MutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock, and `&mut self` makes it unique.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T: ?Sized, R: RawLock> Drop for MutexGuard<'_, T, R> {
    fn drop(&mut self) {
        // SAFETY: constructed only after a successful acquire.
        unsafe { self.mutex.raw.unlock() }
    }
}
