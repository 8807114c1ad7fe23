use crate::{RawLock, RawUnlock};
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// Mutual exclusion around a `T`, with the locking strategy supplied by `R`.
///
/// The guard releases the raw lock on drop, including during unwinding, so a
/// panicking critical section never leaves the lock held.
pub struct Mutex<T, R> {
    raw: R,
    cell: UnsafeCell<T>,
    _no_send_sync: PhantomData<*mut ()>, // !Send/!Sync by default; we implement below
}

unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}
unsafe impl<T: Send, R: Send> Send for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            cell: UnsafeCell::new(value),
            _no_send_sync: PhantomData,
        }
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }
}

pub struct MutexGuard<'a, T, R>
where
    R: RawUnlock,
{
    m: &'a Mutex<T, R>,
}

impl<T, R> Deref for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.m.cell.get() }
    }
}

impl<T, R> DerefMut for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held exclusively.
        unsafe { &mut *self.m.cell.get() }
    }
}

impl<T, R> Drop for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    fn drop(&mut self) {
        // SAFETY: a guard only exists while its lock is held.
        unsafe { self.m.raw.raw_unlock() }
    }
}

impl<T, R> Mutex<T, R>
where
    R: RawLock + RawUnlock,
{
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.raw_lock();
        MutexGuard { m: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        if self.raw.raw_try_lock() {
            Some(MutexGuard { m: self })
        } else {
            None
        }
    }

    /// Closure convenience, built on the guard.
    #[inline]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Racy snapshot of the lock state; only meaningful for assertions.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.raw_is_locked()
    }
}
