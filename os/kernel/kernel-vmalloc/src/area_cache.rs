//! Bounded pool of area descriptor objects.
//!
//! Every interval held by any store costs one unit of the pool. The pool
//! only counts units; the store keeps the storage. Splitting a free interval
//! in two needs a second unit *while the free store lock is held*, so each
//! worker keeps one unit staged, topped up before the lock is taken.

use crate::error::VmallocError;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub(crate) struct AreaCache {
    live: AtomicUsize,
    capacity: usize,
}

/// One staged unit for a worker's next split.
#[derive(Default)]
pub(crate) struct SpareSlot {
    staged: AtomicBool,
}

impl AreaCache {
    pub const fn new(capacity: usize) -> Self {
        Self {
            live: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Take one unit.
    pub fn alloc(&self) -> Result<(), VmallocError> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| VmallocError::ObjectPoolEmpty)
    }

    #[inline]
    pub fn free(&self) {
        self.free_n(1);
    }

    pub fn free_n(&self, n: usize) {
        if n != 0 {
            let before = self.live.fetch_sub(n, Ordering::AcqRel);
            debug_assert!(before >= n, "area cache underflow");
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Stage a unit for `slot` if it has none. Call with no store lock held.
    pub fn preload(&self, slot: &SpareSlot) {
        if slot.staged.load(Ordering::Acquire) || self.alloc().is_err() {
            return;
        }
        if slot
            .staged
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.free();
        }
    }

    /// Consume the staged unit, or fall back to a fresh one.
    pub fn take_spare(&self, slot: &SpareSlot) -> Result<(), VmallocError> {
        if slot.staged.swap(false, Ordering::AcqRel) {
            Ok(())
        } else {
            log::trace!("no staged area object, allocating in place");
            self.alloc()
        }
    }

    /// Return a staged unit to the pool. Returns whether one was staged.
    pub fn unstage(&self, slot: &SpareSlot) -> bool {
        let staged = slot.staged.swap(false, Ordering::AcqRel);
        if staged {
            self.free();
        }
        staged
    }
}

impl SpareSlot {
    pub fn is_staged(&self) -> bool {
        self.staged.load(Ordering::Acquire)
    }
}
