//! Error taxonomy of the vmalloc core.
//!
//! `Exhausted` and `ObjectPoolEmpty` are expected outcomes the immediate
//! caller handles. `CallerMisuse` is rejected before any state is touched.
//! `InvariantViolation` means some other part of the system corrupted the
//! allocator's view; it is logged at `error` level where it is detected and
//! the detecting operation backs out.

use crate::mapping::MapError;
use crate::range::VaRange;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmallocError {
    #[error("virtual address space exhausted")]
    Exhausted,
    #[error("vmap area object pool is empty")]
    ObjectPoolEmpty,
    #[error("invariant violation: {0}")]
    InvariantViolation(Violation),
    #[error("caller misuse: {0}")]
    CallerMisuse(Misuse),
    #[error("out of physical pages")]
    OutOfMemory,
    #[error("mapping failed: {0}")]
    Mapping(#[from] MapError),
}

impl VmallocError {
    /// `true` for the two "no forward progress without more memory" outcomes.
    #[inline]
    #[must_use]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(self, Self::Exhausted | Self::ObjectPoolEmpty)
    }
}

impl From<Misuse> for VmallocError {
    fn from(value: Misuse) -> Self {
        Self::CallerMisuse(value)
    }
}

impl From<Violation> for VmallocError {
    fn from(value: Violation) -> Self {
        Self::InvariantViolation(value)
    }
}

/// Internal consistency breaches.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("{new} overlaps with {existing}")]
    Overlap { new: VaRange, existing: VaRange },
    #[error("subtree max at {area} is {cached:#x}, expected {actual:#x}")]
    AugmentMismatch {
        area: VaRange,
        cached: u64,
        actual: u64,
    },
    #[error("address list disagrees with tree order at {area}")]
    OrderMismatch { area: VaRange },
    #[error("tree out of balance at {area}")]
    Unbalanced { area: VaRange },
    #[error("store accounting off: {expected:#x} bytes expected, {actual:#x} found")]
    Accounting { expected: u64, actual: u64 },
    #[error("{candidate} cannot host {size:#x} bytes at {addr:#x}")]
    NoFit {
        candidate: VaRange,
        addr: u64,
        size: u64,
    },
    #[error("block {block}: {free} free + {dirty} dirty exceeds {total} slots")]
    BlockAccounting {
        block: VaRange,
        free: usize,
        dirty: usize,
        total: usize,
    },
}

/// Requests rejected synchronously.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Misuse {
    #[error("zero-sized request")]
    ZeroSize,
    #[error("{value:#x} is not aligned to {align:#x}")]
    Misaligned { value: u64, align: u64 },
    #[error("alignment {0:#x} is not a power of two")]
    BadAlignment(u64),
    #[error("{0} lies outside the managed window")]
    OutOfBounds(VaRange),
    #[error("{size:#x} bytes exceed the limit of {limit:#x}")]
    TooLarge { size: u64, limit: u64 },
    #[error("no area at {0:#x}")]
    UnknownAddress(u64),
    #[error("worker {0} does not exist")]
    UnknownWorker(usize),
    #[error("invalid configuration: {0}")]
    BadConfig(&'static str),
}
