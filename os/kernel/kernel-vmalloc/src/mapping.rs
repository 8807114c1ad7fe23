//! # Mapping engine and page supplier seams
//!
//! The allocator decides *where* things live in the kernel window; it never
//! touches page tables or physical memory itself. Two collaborators do:
//!
//! * [`MappingEngine`] installs and removes translations and invalidates
//!   stale TLB entries for a range.
//! * [`PageSupplier`] hands out and takes back physical frames.
//!
//! Both are called with no allocator lock held, except that
//! [`MappingEngine::flush_tlb_range`] runs while the caller holds the purge
//! serialization lock (never a store lock).

use crate::range::VaRange;
use bitfield_struct::bitfield;
use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE};

/// Access rights requested for a mapping.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Protection {
    /// Readable. Kernel mappings are always readable.
    #[bits(default = true)]
    pub read: bool,

    /// Writable.
    pub write: bool,

    /// Executable.
    pub execute: bool,

    /// Caching disabled (device memory, `ioremap`).
    pub uncached: bool,

    #[bits(4)]
    __: u8,
}

impl Protection {
    /// `PAGE_KERNEL`: read and write, no execute.
    #[must_use]
    pub const fn kernel() -> Self {
        Self::new().with_write(true)
    }

    /// Read-only data.
    #[must_use]
    pub const fn kernel_ro() -> Self {
        Self::new()
    }

    /// Read and execute (module text).
    #[must_use]
    pub const fn kernel_exec() -> Self {
        Self::new().with_execute(true)
    }
}

/// A naturally aligned run of `2^order` physical pages.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalFrame {
    pub addr: u64,
    pub order: u32,
}

impl PhysicalFrame {
    #[must_use]
    pub const fn new(addr: u64, order: u32) -> Self {
        Self { addr, order }
    }

    /// Single base page.
    #[must_use]
    pub const fn page(addr: u64) -> Self {
        Self { addr, order: 0 }
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        PAGE_SIZE << self.order
    }

    #[must_use]
    pub const fn nr_pages(&self) -> u64 {
        1 << self.order
    }

    /// Physical address backing the `index`-th base page of this frame.
    #[must_use]
    pub const fn page_addr(&self, index: u64) -> u64 {
        self.addr + (index << PAGE_SHIFT)
    }
}

/// Reasons a [`MappingEngine`] could not install a mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// Intermediate page tables could not be allocated.
    #[error("out of memory for page tables")]
    OutOfTableMemory,
    /// A translation already exists inside the target range.
    #[error("address {0:#x} is already mapped")]
    AlreadyMapped(u64),
    /// The frames do not cover the target range exactly.
    #[error("frames cover {frames:#x} bytes, range needs {range:#x}")]
    SizeMismatch { frames: u64, range: u64 },
}

/// Page-table manipulation on behalf of the allocator.
///
/// Implementations must be all-or-nothing per call: a failed [`map`](Self::map)
/// leaves no translation behind in `range`.
pub trait MappingEngine: Send + Sync {
    /// Map `frames`, in order, contiguously into `range`.
    ///
    /// # Errors
    /// Any [`MapError`]; the range is left unmapped.
    fn map(&self, range: VaRange, frames: &[PhysicalFrame], prot: Protection)
    -> Result<(), MapError>;

    /// Remove every translation in `range` without invalidating the TLB.
    fn unmap(&self, range: VaRange);

    /// Invalidate TLB entries covering `range` on all CPUs.
    fn flush_tlb_range(&self, range: VaRange);

    /// Map `range` using leaf entries of `page_size` bytes.
    ///
    /// Returns `false` (having mapped nothing) when large leaves are not
    /// available; the caller then falls back to base pages.
    fn try_large_mapping(
        &self,
        range: VaRange,
        frames: &[PhysicalFrame],
        prot: Protection,
        page_size: u64,
    ) -> bool {
        let _ = (range, frames, prot, page_size);
        false
    }
}

/// Source of physical frames.
pub trait PageSupplier: Send + Sync {
    /// Allocate a naturally aligned frame of `2^order` pages.
    fn alloc_frame(&self, order: u32) -> Option<PhysicalFrame>;

    /// Return a frame previously handed out by [`alloc_frame`](Self::alloc_frame).
    fn free_frame(&self, frame: PhysicalFrame);

    /// Total base pages this supplier could ever hand out, if known.
    fn total_pages(&self) -> Option<u64> {
        None
    }
}

/// Sum of the sizes of `frames` in bytes.
pub(crate) fn frames_size(frames: &[PhysicalFrame]) -> u64 {
    frames.iter().map(PhysicalFrame::size).sum()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn protection_presets() {
        let p = Protection::kernel();
        assert!(p.read() && p.write() && !p.execute());
        assert!(!Protection::kernel_ro().write());
        assert!(Protection::kernel_exec().execute());
        assert_eq!(Protection::kernel().into_bits() & 0b11, 0b11);
    }

    #[test]
    fn frame_sizes() {
        let f = PhysicalFrame::new(0x20_0000, 9);
        assert_eq!(f.size(), 0x20_0000);
        assert_eq!(f.nr_pages(), 512);
        assert_eq!(f.page_addr(3), 0x20_3000);
        assert_eq!(frames_size(&[f, PhysicalFrame::page(0x1000)]), 0x20_1000);
    }
}
