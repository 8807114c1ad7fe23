//! # Kernel synchronization primitives
//!
//! Small, `no_std` building blocks for the memory management crates:
//!
//! * [`Mutex`] parameterized over a raw lock strategy ([`RawSpin`] for short
//!   hot-path sections, [`RawTicket`] where FIFO fairness matters).
//! * [`LazyList`], a lock-free push/take-all list for handing work from
//!   contexts that must not block to a background drainer.
//! * [`PerWorker`], one independent slot per worker (CPU) indexed by id.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod lazy_list;
mod mutex;
mod per_worker;
mod raw_spin;
mod raw_ticket;

pub use lazy_list::{LazyList, LazyListDrain};
pub use mutex::{Mutex, MutexGuard};
pub use per_worker::PerWorker;
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;

pub type SpinMutex<T> = Mutex<T, RawSpin>;
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
    fn raw_is_locked(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}
