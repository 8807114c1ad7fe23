//! # Virtual areas
//!
//! The `vmalloc`/`vmap` surface on top of the interval allocator. Every area
//! created here gets a [`VmArea`] descriptor, looked up by start address, and
//! the busy interval behind it is tagged with the descriptor's [`VmAreaId`].
//!
//! Areas carry a trailing guard page unless created with
//! [`VmFlags::NO_GUARD`]; the guard is reserved but never mapped, so running
//! off the end of an area faults instead of scribbling over the next one.

use crate::VmallocContext;
use crate::error::{Misuse, VmallocError};
use crate::mapping::{MappingEngine, PageSupplier, PhysicalFrame, Protection, frames_size};
use crate::range::{VaRange, align_up, is_aligned};
use crate::store::AreaOwner;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::cmp::max;
use core::sync::atomic::Ordering;
use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE};
use log::{debug, warn};

bitflags! {
    /// Properties of a [`VmArea`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct VmFlags: u32 {
        /// Device memory mapped by `ioremap`.
        const IOREMAP = 1 << 0;
        /// Backed by pages allocated by `vmalloc`.
        const ALLOC = 1 << 1;
        /// Caller-provided pages mapped by `vmap`.
        const MAP = 1 << 2;
        /// Reserved but not yet populated.
        const UNINITIALIZED = 1 << 5;
        /// No trailing guard page.
        const NO_GUARD = 1 << 6;
        /// Never try large mappings for this area.
        const NO_HUGE_VMAP = 1 << 10;
        /// `vmap` takes ownership of the frames; `vfree` returns them.
        const MAP_PUT_PAGES = 1 << 12;
    }
}

/// Identity of a [`VmArea`], unique for the context's lifetime.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VmAreaId(pub(crate) u64);

/// Descriptor of a virtual area.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmArea {
    pub id: VmAreaId,
    /// Reserved interval, guard page included.
    pub range: VaRange,
    /// Usable bytes from `range.start`.
    pub size: u64,
    pub flags: VmFlags,
    /// Frames backing the area, when the area owns them.
    pub frames: Vec<PhysicalFrame>,
    /// log2 of the pages per frame in `frames`.
    pub page_order: u32,
}

impl VmArea {
    #[inline]
    #[must_use]
    pub const fn addr(&self) -> u64 {
        self.range.start
    }

    /// The part of the area that may be mapped.
    #[inline]
    #[must_use]
    pub const fn usable(&self) -> VaRange {
        VaRange::new(self.range.start, self.range.start + self.size)
    }

    /// Base pages backing the area.
    #[must_use]
    pub fn nr_pages(&self) -> u64 {
        self.frames.iter().map(PhysicalFrame::nr_pages).sum()
    }
}

impl<M: MappingEngine, P: PageSupplier> VmallocContext<M, P> {
    /// Reserve an area of `size` bytes (rounded up to pages) without mapping it.
    ///
    /// # Errors
    /// As for [`reserve`](Self::reserve).
    pub fn get_vm_area(
        &self,
        worker: usize,
        size: u64,
        align: u64,
        flags: VmFlags,
        within: VaRange,
    ) -> Result<VmArea, VmallocError> {
        if size == 0 {
            return Err(Misuse::ZeroSize.into());
        }
        let size = align_up(size, PAGE_SIZE).ok_or(VmallocError::Exhausted)?;
        let reserved = if flags.contains(VmFlags::NO_GUARD) {
            size
        } else {
            size.checked_add(PAGE_SIZE).ok_or(VmallocError::Exhausted)?
        };

        let id = VmAreaId(self.next_area_id.fetch_add(1, Ordering::Relaxed));
        let range = self.alloc_area(worker, reserved, align, within, AreaOwner::VmArea(id))?;
        let area = VmArea {
            id,
            range,
            size,
            flags: flags | VmFlags::UNINITIALIZED,
            frames: Vec::new(),
            page_order: 0,
        };
        self.areas
            .with_lock(|areas| areas.insert(range.start, area.clone()));
        Ok(area)
    }

    /// Allocate `size` bytes of virtually contiguous, page-backed memory.
    ///
    /// # Errors
    /// * [`VmallocError::OutOfMemory`] if the page supplier runs dry.
    /// * [`VmallocError::Mapping`] if the mapping engine refuses.
    /// * Anything [`get_vm_area`](Self::get_vm_area) reports.
    pub fn vmalloc(&self, worker: usize, size: u64, prot: Protection) -> Result<u64, VmallocError> {
        self.vmalloc_range(worker, size, PAGE_SIZE, self.config.range, prot, VmFlags::empty())
    }

    /// [`vmalloc`](Self::vmalloc) with explicit alignment, window and flags.
    ///
    /// # Errors
    /// As for [`vmalloc`](Self::vmalloc).
    pub fn vmalloc_range(
        &self,
        worker: usize,
        size: u64,
        align: u64,
        within: VaRange,
        prot: Protection,
        flags: VmFlags,
    ) -> Result<u64, VmallocError> {
        if size == 0 {
            return Err(Misuse::ZeroSize.into());
        }
        let size = align_up(size, PAGE_SIZE).ok_or(VmallocError::Exhausted)?;
        if self
            .pages
            .total_pages()
            .is_some_and(|total| size >> PAGE_SHIFT > total)
        {
            return Err(VmallocError::OutOfMemory);
        }

        let large = self.config.large_page_size;
        if self.config.allow_large_mappings
            && !flags.contains(VmFlags::NO_HUGE_VMAP)
            && size >= large
        {
            let large_size = align_up(size, large).ok_or(VmallocError::Exhausted)?;
            match self.vmalloc_area(worker, large_size, max(align, large), within, prot, flags, large) {
                Ok(addr) => return Ok(addr),
                Err(e) => debug!("vmalloc: large mapping of {size:#x} failed ({e}), using base pages"),
            }
        }
        self.vmalloc_area(worker, size, align, within, prot, flags, PAGE_SIZE)
    }

    #[allow(clippy::too_many_arguments)]
    fn vmalloc_area(
        &self,
        worker: usize,
        size: u64,
        align: u64,
        within: VaRange,
        prot: Protection,
        flags: VmFlags,
        page_size: u64,
    ) -> Result<u64, VmallocError> {
        let area = self.get_vm_area(worker, size, align, flags | VmFlags::ALLOC, within)?;
        let usable = area.usable();
        let order = page_size.trailing_zeros() - PAGE_SHIFT;

        let frames = match self.alloc_frames(usable.size(), order) {
            Ok(frames) => frames,
            Err(e) => {
                self.discard_area(&area);
                return Err(e);
            }
        };

        let mapped = if page_size > PAGE_SIZE {
            if self.engine.try_large_mapping(usable, &frames, prot, page_size) {
                Ok(())
            } else {
                Err(VmallocError::Exhausted)
            }
        } else {
            self.engine.map(usable, &frames, prot).map_err(VmallocError::from)
        };
        if let Err(e) = mapped {
            self.free_frames(&frames);
            self.discard_area(&area);
            return Err(e);
        }

        let nr_pages = usable.size() >> PAGE_SHIFT;
        self.nr_vmalloc_pages.fetch_add(nr_pages, Ordering::AcqRel);
        self.areas.with_lock(|areas| {
            if let Some(a) = areas.get_mut(&area.addr()) {
                a.frames = frames;
                a.page_order = order;
                a.flags.remove(VmFlags::UNINITIALIZED);
            }
        });
        Ok(area.addr())
    }

    /// Map caller-provided `frames` into a fresh area.
    ///
    /// With [`VmFlags::MAP_PUT_PAGES`] the area takes ownership of the
    /// frames and [`vfree`](Self::vfree) returns them to the supplier.
    ///
    /// # Errors
    /// [`VmallocError::Mapping`] if the engine refuses; nothing stays reserved.
    pub fn vmap(
        &self,
        worker: usize,
        frames: &[PhysicalFrame],
        flags: VmFlags,
        prot: Protection,
    ) -> Result<u64, VmallocError> {
        let size = frames_size(frames);
        let area = self.get_vm_area(worker, size, PAGE_SIZE, flags | VmFlags::MAP, self.config.range)?;

        if let Err(e) = self.engine.map(area.usable(), frames, prot) {
            self.discard_area(&area);
            return Err(e.into());
        }
        self.areas.with_lock(|areas| {
            if let Some(a) = areas.get_mut(&area.addr()) {
                if flags.contains(VmFlags::MAP_PUT_PAGES) {
                    a.frames = frames.to_vec();
                }
                a.flags.remove(VmFlags::UNINITIALIZED);
            }
        });
        Ok(area.addr())
    }

    /// Release an area from [`vmalloc`](Self::vmalloc) or
    /// [`vmap`](Self::vmap), returning owned frames to the supplier.
    ///
    /// # Errors
    /// [`Misuse::Misaligned`] or [`Misuse::UnknownAddress`] for addresses
    /// that do not start an area.
    pub fn vfree(&self, addr: u64) -> Result<(), VmallocError> {
        self.remove_area(addr, true)
    }

    /// Release an area, leaving its frames with the caller.
    ///
    /// # Errors
    /// As for [`vfree`](Self::vfree).
    pub fn vunmap(&self, addr: u64) -> Result<(), VmallocError> {
        self.remove_area(addr, false)
    }

    /// Queue `addr` for release from a context that must not block.
    ///
    /// Returns `true` if the worker's queue was empty, in which case the
    /// caller should schedule [`drain_deferred`](Self::drain_deferred).
    ///
    /// # Errors
    /// [`Misuse::UnknownWorker`].
    pub fn vfree_atomic(&self, worker: usize, addr: u64) -> Result<bool, VmallocError> {
        let queue = self
            .deferred
            .get(worker)
            .ok_or(VmallocError::CallerMisuse(Misuse::UnknownWorker(worker)))?;
        if addr == 0 {
            return Ok(false);
        }
        Ok(queue.push(addr))
    }

    /// Release everything queued by [`vfree_atomic`](Self::vfree_atomic).
    ///
    /// Returns the number of addresses processed.
    pub fn drain_deferred(&self) -> usize {
        let mut drained = 0;
        for queue in &self.deferred {
            for addr in queue.take_all() {
                if let Err(e) = self.vfree(addr) {
                    warn!("vmalloc: deferred release of {addr:#x} failed: {e}");
                }
                drained += 1;
            }
        }
        drained
    }

    /// Map `frames` for short-lived use, through the block pool when small.
    ///
    /// # Errors
    /// Reservation or mapping failures; nothing stays reserved.
    pub fn vm_map_ram(
        &self,
        worker: usize,
        frames: &[PhysicalFrame],
        prot: Protection,
    ) -> Result<u64, VmallocError> {
        let size = frames_size(frames);
        let handle = if size <= self.config.max_small_size() {
            self.reserve_small(worker, size)?
        } else {
            self.reserve(worker, size, PAGE_SIZE, self.config.range)?
        };
        let range = handle.range();
        if let Err(e) = self.engine.map(range, frames, prot) {
            let pages = size >> PAGE_SHIFT;
            if let Err(unwind) = self.vm_unmap_ram(range.start, pages) {
                warn!("vmalloc: unwinding {range} failed: {unwind}");
            }
            return Err(e.into());
        }
        Ok(range.start)
    }

    /// Undo [`vm_map_ram`](Self::vm_map_ram) of `count` pages at `addr`.
    ///
    /// # Errors
    /// [`Misuse`] for addresses that were not returned by `vm_map_ram`.
    pub fn vm_unmap_ram(&self, addr: u64, count: u64) -> Result<(), VmallocError> {
        if count == 0 {
            return Err(Misuse::ZeroSize.into());
        }
        let size = count
            .checked_mul(PAGE_SIZE)
            .ok_or(Misuse::TooLarge {
                size: u64::MAX,
                limit: self.config.range.size(),
            })?;
        let range = VaRange::from_size(addr, size).ok_or(Misuse::UnknownAddress(addr))?;
        if !is_aligned(addr, PAGE_SIZE) {
            return Err(Misuse::Misaligned {
                value: addr,
                align: PAGE_SIZE,
            }
            .into());
        }
        if !self.config.range.contains_range(range) {
            return Err(Misuse::OutOfBounds(range).into());
        }

        if size <= self.config.max_small_size() {
            return self.free_small(addr, size);
        }
        self.take_busy(addr, AreaOwner::Unowned, Some(size))?;
        self.engine.unmap(range);
        self.retire_lazy(range)
    }

    /// Snapshot of the area containing `addr`.
    pub fn find_vm_area(&self, addr: u64) -> Option<VmArea> {
        let busy = self
            .busy
            .with_lock(|busy| busy.find_enclosing(addr).map(|id| *busy.area(id)))?;
        let AreaOwner::VmArea(id) = busy.owner else {
            return None;
        };
        self.areas.with_lock(|areas| {
            areas
                .get(&busy.range.start)
                .filter(|area| area.id == id)
                .cloned()
        })
    }

    /// Base pages currently backing `vmalloc` areas.
    pub fn vmalloc_nr_pages(&self) -> u64 {
        self.nr_vmalloc_pages.load(Ordering::Acquire)
    }

    fn remove_area(&self, addr: u64, deallocate: bool) -> Result<(), VmallocError> {
        if !is_aligned(addr, PAGE_SIZE) {
            warn!("vmalloc: trying to free bad address {addr:#x}");
            return Err(Misuse::Misaligned {
                value: addr,
                align: PAGE_SIZE,
            }
            .into());
        }
        let Some(area) = self.areas.with_lock(|areas| areas.remove(&addr)) else {
            warn!("vmalloc: trying to free nonexistent area at {addr:#x}");
            return Err(Misuse::UnknownAddress(addr).into());
        };

        let owner = AreaOwner::VmArea(area.id);
        if let Err(e) = self.take_busy(area.addr(), owner, Some(area.range.size())) {
            self.areas.with_lock(|areas| areas.insert(addr, area));
            return Err(e);
        }
        self.engine.unmap(area.usable());
        self.retire_lazy(area.range)?;

        if deallocate {
            self.free_frames(&area.frames);
            if area.flags.contains(VmFlags::ALLOC) {
                self.nr_vmalloc_pages
                    .fetch_sub(area.nr_pages(), Ordering::AcqRel);
            }
        }
        Ok(())
    }

    /// Unwind an area that never got translations.
    fn discard_area(&self, area: &VmArea) {
        let addr = area.addr();
        self.areas.with_lock(|areas| areas.remove(&addr));
        if let Err(e) = self.free_busy(addr, AreaOwner::VmArea(area.id)) {
            warn!("vmalloc: unwinding area at {addr:#x} failed: {e}");
        }
    }

    fn alloc_frames(&self, bytes: u64, order: u32) -> Result<Vec<PhysicalFrame>, VmallocError> {
        let frame_size = PAGE_SIZE << order;
        let count = bytes / frame_size;
        let mut frames = Vec::new();
        for _ in 0..count {
            match self.pages.alloc_frame(order) {
                Some(frame) => frames.push(frame),
                None => {
                    self.free_frames(&frames);
                    return Err(VmallocError::OutOfMemory);
                }
            }
        }
        Ok(frames)
    }

    fn free_frames(&self, frames: &[PhysicalFrame]) {
        for &frame in frames {
            self.pages.free_frame(frame);
        }
    }
}
