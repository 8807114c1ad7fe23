//! Tunables of a [`VmallocContext`](crate::VmallocContext).

use crate::error::{Misuse, VmallocError};
use crate::range::{VaRange, is_aligned};
use kernel_info::memory::{LARGE_PAGE_SIZE, PAGE_SIZE, VMALLOC_END, VMALLOC_START};

/// Static configuration, validated once at [`init`](crate::VmallocContext::init).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VmallocConfig {
    /// The managed virtual window. Page aligned, non-empty.
    pub range: VaRange,
    /// Number of workers (CPUs). Worker ids are `0..nr_workers`.
    pub nr_workers: usize,
    /// Lazily freed bytes tolerated per `fls(nr_workers)` before a purge.
    pub lazy_unit_bytes: u64,
    /// Largest request, in pages, served from the per-worker block pool.
    pub max_small_pages: usize,
    /// Pages per block. A power of two larger than `max_small_pages`.
    pub block_pages: usize,
    /// Upper bound on live area descriptors (the object pool size).
    pub max_areas: usize,
    /// Try large leaf mappings for big `vmalloc` requests first.
    pub allow_large_mappings: bool,
    /// Size of a large leaf mapping.
    pub large_page_size: u64,
}

impl VmallocConfig {
    pub const DEFAULT_LAZY_UNIT_BYTES: u64 = 32 * 1024 * 1024;
    pub const DEFAULT_MAX_SMALL_PAGES: usize = 64;
    pub const MIN_BLOCK_PAGES: usize = 2 * Self::DEFAULT_MAX_SMALL_PAGES;
    pub const MAX_BLOCK_PAGES: usize = 1024;
    pub const DEFAULT_MAX_AREAS: usize = 1 << 20;

    /// Defaults for an arbitrary window.
    #[must_use]
    pub const fn new(range: VaRange, nr_workers: usize) -> Self {
        Self {
            range,
            nr_workers,
            lazy_unit_bytes: Self::DEFAULT_LAZY_UNIT_BYTES,
            max_small_pages: Self::DEFAULT_MAX_SMALL_PAGES,
            block_pages: default_block_pages(range.size(), nr_workers),
            max_areas: Self::DEFAULT_MAX_AREAS,
            allow_large_mappings: true,
            large_page_size: LARGE_PAGE_SIZE,
        }
    }

    /// Defaults for the kernel's `vmalloc` window.
    #[must_use]
    pub const fn kernel(nr_workers: usize) -> Self {
        Self::new(VaRange::new(VMALLOC_START, VMALLOC_END), nr_workers)
    }

    #[must_use]
    pub const fn with_lazy_unit_bytes(mut self, bytes: u64) -> Self {
        self.lazy_unit_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_max_small_pages(mut self, pages: usize) -> Self {
        self.max_small_pages = pages;
        self
    }

    #[must_use]
    pub const fn with_block_pages(mut self, pages: usize) -> Self {
        self.block_pages = pages;
        self
    }

    #[must_use]
    pub const fn with_max_areas(mut self, areas: usize) -> Self {
        self.max_areas = areas;
        self
    }

    #[must_use]
    pub const fn with_large_mappings(mut self, allow: bool) -> Self {
        self.allow_large_mappings = allow;
        self
    }

    /// Lazily freed bytes beyond which a purge is attempted.
    ///
    /// Scales with the log of the worker count since TLB flush cost does too.
    #[must_use]
    pub const fn lazy_max_bytes(&self) -> u64 {
        fls(self.nr_workers) as u64 * self.lazy_unit_bytes
    }

    /// Bytes covered by one block of the per-worker pool.
    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_pages as u64 * PAGE_SIZE
    }

    /// Largest request, in bytes, served from the block pool.
    #[must_use]
    pub const fn max_small_size(&self) -> u64 {
        self.max_small_pages as u64 * PAGE_SIZE
    }

    /// Check the configuration is usable.
    ///
    /// # Errors
    /// [`Misuse::BadConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), VmallocError> {
        let bad = |what: &'static str| -> Result<(), VmallocError> {
            Err(VmallocError::CallerMisuse(Misuse::BadConfig(what)))
        };

        if self.range.is_empty() || self.range.start > self.range.end {
            return bad("range is empty");
        }
        if !is_aligned(self.range.start, PAGE_SIZE) || !is_aligned(self.range.end, PAGE_SIZE) {
            return bad("range is not page aligned");
        }
        if self.nr_workers == 0 {
            return bad("at least one worker is required");
        }
        if self.max_small_pages == 0 || !self.max_small_pages.is_power_of_two() {
            return bad("max_small_pages must be a non-zero power of two");
        }
        if !self.block_pages.is_power_of_two() || self.block_pages <= self.max_small_pages {
            return bad("block_pages must be a power of two above max_small_pages");
        }
        if self.block_size() > self.range.size() {
            return bad("a block does not fit the range");
        }
        if self.max_areas < 2 {
            return bad("max_areas leaves no room for a single allocation");
        }
        if !self.large_page_size.is_power_of_two() || self.large_page_size < PAGE_SIZE {
            return bad("large_page_size must be a power of two of at least a page");
        }
        Ok(())
    }
}

impl Default for VmallocConfig {
    fn default() -> Self {
        Self::kernel(1)
    }
}

/// Find-last-set: 1-based index of the most significant set bit, 0 for 0.
#[must_use]
pub const fn fls(n: usize) -> u32 {
    usize::BITS - n.leading_zeros()
}

/// Block size in pages for a window of `window_bytes` shared by `nr_workers`.
///
/// A sixteenth of the per-worker share of the window, rounded down to a power
/// of two and clamped to `[MIN_BLOCK_PAGES, MAX_BLOCK_PAGES]`.
#[must_use]
pub const fn default_block_pages(window_bytes: u64, nr_workers: usize) -> usize {
    let pages = window_bytes / PAGE_SIZE;
    let workers = if nr_workers == 0 {
        1
    } else {
        nr_workers.next_power_of_two()
    };
    let share = pages / workers as u64 / 16;
    let share = if share > VmallocConfig::MAX_BLOCK_PAGES as u64 {
        VmallocConfig::MAX_BLOCK_PAGES
    } else if share < VmallocConfig::MIN_BLOCK_PAGES as u64 {
        VmallocConfig::MIN_BLOCK_PAGES
    } else {
        share as usize
    };
    1 << (usize::BITS - 1 - share.leading_zeros())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fls_matches_bit_width() {
        assert_eq!(fls(0), 0);
        assert_eq!(fls(1), 1);
        assert_eq!(fls(4), 3);
        assert_eq!(fls(7), 3);
        assert_eq!(fls(8), 4);
    }

    #[test]
    fn lazy_threshold_scales_with_workers() {
        let one = VmallocConfig::kernel(1);
        let eight = VmallocConfig::kernel(8);
        assert_eq!(one.lazy_max_bytes(), 32 * 1024 * 1024);
        assert_eq!(eight.lazy_max_bytes(), 4 * 32 * 1024 * 1024);
    }

    #[test]
    fn block_pages_are_clamped() {
        assert_eq!(default_block_pages(1 << 46, 1), VmallocConfig::MAX_BLOCK_PAGES);
        assert_eq!(default_block_pages(1 << 20, 64), VmallocConfig::MIN_BLOCK_PAGES);
        // 64 MiB window: 16384 pages / 1 / 16
        assert_eq!(default_block_pages(64 << 20, 1), 1024);
        // 48 MiB window: 768 rounds down to 512
        assert_eq!(default_block_pages(48 << 20, 1), 512);
    }

    #[test]
    fn kernel_defaults_validate() {
        assert!(VmallocConfig::kernel(4).validate().is_ok());
    }

    #[test]
    fn bad_configs_are_rejected() {
        let base = VmallocConfig::new(VaRange::new(0x10_0000, 0x1010_0000), 2);
        assert!(base.validate().is_ok());

        let unaligned = VmallocConfig {
            range: VaRange::new(0x10_0001, 0x1010_0000),
            ..base
        };
        assert!(unaligned.validate().is_err());
        assert!(
            VmallocConfig {
                nr_workers: 0,
                ..base
            }
            .validate()
            .is_err()
        );
        assert!(base.with_block_pages(64).validate().is_err());
        assert!(base.with_block_pages(300).validate().is_err());
        assert!(base.with_max_areas(1).validate().is_err());
    }
}
