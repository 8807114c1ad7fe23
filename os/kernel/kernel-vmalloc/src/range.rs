//! Half-open virtual address ranges and alignment helpers.

use core::fmt;

/// A `[start, end)` range of virtual addresses.
///
/// Ranges compare by `start` first, which matches the address order the
/// interval stores keep.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VaRange {
    pub start: u64,
    pub end: u64,
}

impl VaRange {
    #[inline]
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "inverted range");
        Self { start, end }
    }

    /// `[start, start + size)`, or `None` if the end would overflow.
    #[inline]
    #[must_use]
    pub const fn from_size(start: u64, size: u64) -> Option<Self> {
        match start.checked_add(size) {
            Some(end) => Some(Self { start, end }),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn size(self) -> u64 {
        self.end - self.start
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.start == self.end
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    #[inline]
    #[must_use]
    pub const fn contains_range(self, other: Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Smallest range covering both `self` and `other`.
    #[inline]
    #[must_use]
    pub const fn span(self, other: Self) -> Self {
        let start = if self.start < other.start {
            self.start
        } else {
            other.start
        };
        let end = if self.end > other.end {
            self.end
        } else {
            other.end
        };
        Self { start, end }
    }
}

impl fmt::Debug for VaRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA[0x{:016X}..0x{:016X})", self.start, self.end)
    }
}

impl fmt::Display for VaRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}-0x{:x}", self.start, self.end)
    }
}

/// Align `v` upwards to `align` (must be a power of two); `None` on overflow.
#[inline]
#[must_use]
pub const fn align_up(v: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match v.checked_add(align - 1) {
        Some(x) => Some(x & !(align - 1)),
        None => None,
    }
}

/// Align `v` downwards to `align` (must be a power of two).
#[inline]
#[must_use]
pub const fn align_down(v: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    v & !(align - 1)
}

#[inline]
#[must_use]
pub const fn is_aligned(v: u64, align: u64) -> bool {
    v & (align - 1) == 0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 4096), Some(0));
        assert_eq!(align_up(1, 4096), Some(4096));
        assert_eq!(align_up(8192, 4096), Some(8192));
        assert_eq!(align_up(u64::MAX - 10, 4096), None);
        assert_eq!(align_down(8191, 4096), 4096);
        assert!(is_aligned(0x20_0000, 0x20_0000));
        assert!(!is_aligned(0x20_1000, 0x20_0000));
    }

    #[test]
    fn range_relations() {
        let a = VaRange::new(0x1000, 0x3000);
        let b = VaRange::new(0x3000, 0x4000);
        assert!(!a.overlaps(b), "touching ranges do not overlap");
        assert!(a.overlaps(VaRange::new(0x2000, 0x5000)));
        assert!(a.contains(0x2fff));
        assert!(!a.contains(0x3000));
        assert_eq!(a.span(b), VaRange::new(0x1000, 0x4000));
        assert!(a.span(b).contains_range(b));
        assert_eq!(VaRange::from_size(u64::MAX, 1), None);
    }
}
