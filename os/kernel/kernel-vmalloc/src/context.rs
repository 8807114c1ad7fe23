//! # Allocator context and the interval allocator
//!
//! [`VmallocContext`] owns the three interval stores, the object cache, the
//! purge machinery, the per-worker block pool and the VM area descriptors.
//! There are no globals: a kernel creates one context at boot and hands out
//! `&VmallocContext` to whoever needs kernel virtual address space.
//!
//! ## Locking
//!
//! Each store has its own spin lock. An operation holds at most one of them
//! at a time and moves intervals between stores by removing under one lock
//! and inserting under the next, in the order Busy, Free, Purgatory. The
//! purge lock is a ticket lock held across a whole purge pass; store locks
//! nest inside it, never the other way around.
//!
//! ## Reservation
//!
//! [`reserve`](VmallocContext::reserve) looks up the lowest-addressed free
//! interval that can host the request, carves the request out of it, and
//! records the result in the busy store. When nothing fits it purges lazily
//! freed intervals and tries again, then asks the registered reclaim
//! notifiers for help and tries a last time.

use crate::area_cache::{AreaCache, SpareSlot};
use crate::block::BlockPool;
use crate::config::VmallocConfig;
use crate::error::{Misuse, Violation, VmallocError};
use crate::mapping::{MappingEngine, PageSupplier};
use crate::notifier::{NotifierChain, NotifierId};
use crate::range::{VaRange, align_up, is_aligned};
use crate::store::{AreaOwner, AreaStore, FitType, NodeId, VmapArea};
use crate::vm_area::VmArea;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::cmp::max;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel_info::memory::PAGE_SIZE;
use kernel_sync::{LazyList, PerWorker, SpinMutex, TicketMutex};
use log::{debug, trace, warn};

/// A reserved interval, returned by [`VmallocContext::reserve`] and
/// [`VmallocContext::reserve_small`].
///
/// The handle is the caller's proof of ownership; giving it back releases
/// the interval.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a handle leaks its address range"]
pub struct VmapHandle {
    range: VaRange,
}

impl VmapHandle {
    pub(crate) const fn new(range: VaRange) -> Self {
        Self { range }
    }

    #[inline]
    #[must_use]
    pub const fn addr(&self) -> u64 {
        self.range.start
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.range.size()
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> VaRange {
        self.range
    }
}

/// What [`VmallocContext::shutdown`] found still allocated.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Busy intervals that were never released.
    pub live_areas: usize,
    /// Bytes covered by those intervals.
    pub live_bytes: u64,
    /// Deferred releases processed during shutdown.
    pub drained: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Attempt {
    First,
    AfterPurge,
    AfterReclaim,
}

pub struct VmallocContext<M, P> {
    pub(crate) config: VmallocConfig,
    pub(crate) busy: SpinMutex<AreaStore>,
    pub(crate) free: SpinMutex<AreaStore>,
    pub(crate) purge: SpinMutex<AreaStore>,
    pub(crate) cache: AreaCache,
    pub(crate) spares: PerWorker<SpareSlot>,
    pub(crate) lazy_bytes: AtomicU64,
    pub(crate) force_purge: AtomicBool,
    pub(crate) purge_lock: TicketMutex<()>,
    pub(crate) notifiers: SpinMutex<NotifierChain>,
    pub(crate) blocks: BlockPool,
    pub(crate) areas: SpinMutex<BTreeMap<u64, VmArea>>,
    pub(crate) deferred: PerWorker<LazyList<u64>>,
    pub(crate) next_area_id: AtomicU64,
    pub(crate) nr_vmalloc_pages: AtomicU64,
    pub(crate) engine: M,
    pub(crate) pages: P,
}

impl<M: MappingEngine, P: PageSupplier> VmallocContext<M, P> {
    /// Create a context managing `config.range`, all of it free.
    ///
    /// # Errors
    /// [`Misuse::BadConfig`] if the configuration does not validate.
    pub fn init(config: VmallocConfig, engine: M, pages: P) -> Result<Self, VmallocError> {
        config.validate()?;

        let cache = AreaCache::new(config.max_areas);
        let mut free = AreaStore::new();
        cache.alloc()?;
        free.insert(VmapArea::unowned(config.range))?;

        debug!(
            "vmalloc: managing {} with {} workers, lazy threshold {:#x}, {} pages per block",
            config.range,
            config.nr_workers,
            config.lazy_max_bytes(),
            config.block_pages
        );

        Ok(Self {
            config,
            busy: SpinMutex::new(AreaStore::new()),
            free: SpinMutex::new(free),
            purge: SpinMutex::new(AreaStore::new()),
            cache,
            spares: PerWorker::new(config.nr_workers, |_| SpareSlot::default()),
            lazy_bytes: AtomicU64::new(0),
            force_purge: AtomicBool::new(false),
            purge_lock: TicketMutex::new(()),
            notifiers: SpinMutex::new(NotifierChain::default()),
            blocks: BlockPool::new(config.nr_workers),
            areas: SpinMutex::new(BTreeMap::new()),
            deferred: PerWorker::new(config.nr_workers, |_| LazyList::new()),
            next_area_id: AtomicU64::new(1),
            nr_vmalloc_pages: AtomicU64::new(0),
            engine,
            pages,
        })
    }

    /// Tear the context down.
    ///
    /// Deferred releases are processed, fragmented blocks reclaimed and every
    /// lazily freed interval purged. Whatever is still busy afterwards is
    /// reported, not released.
    pub fn shutdown(self) -> ShutdownReport {
        let drained = self.drain_deferred();
        self.unmap_aliases();
        for slot in &self.spares {
            self.cache.unstage(slot);
        }

        let (live_areas, live_bytes) = self.busy.with_lock(|busy| (busy.len(), busy.bytes()));
        if live_areas != 0 {
            warn!("vmalloc: shutting down with {live_areas} live areas ({live_bytes:#x} bytes)");
        }
        ShutdownReport {
            live_areas,
            live_bytes,
            drained,
        }
    }

    #[inline]
    pub const fn config(&self) -> &VmallocConfig {
        &self.config
    }

    #[inline]
    pub const fn engine(&self) -> &M {
        &self.engine
    }

    #[inline]
    pub const fn page_supplier(&self) -> &P {
        &self.pages
    }

    /// Reserve `size` bytes aligned to `align` inside `within`.
    ///
    /// # Errors
    /// * [`VmallocError::Exhausted`] when nothing fits even after a purge and
    ///   a round of reclaim notifiers.
    /// * [`VmallocError::ObjectPoolEmpty`] when no descriptor is available
    ///   for the new interval.
    /// * [`VmallocError::CallerMisuse`] for malformed requests.
    pub fn reserve(
        &self,
        worker: usize,
        size: u64,
        align: u64,
        within: VaRange,
    ) -> Result<VmapHandle, VmallocError> {
        self.alloc_area(worker, size, align, within, AreaOwner::Unowned)
            .map(VmapHandle::new)
    }

    /// Give back a reservation. Translations are removed now; the interval
    /// becomes reusable after the next purge.
    ///
    /// # Errors
    /// [`Misuse::UnknownAddress`] if the handle does not name exactly one
    /// busy interval from [`reserve`](Self::reserve). Nothing is unmapped
    /// in that case.
    pub fn release(&self, handle: VmapHandle) -> Result<(), VmallocError> {
        let range = handle.range();
        let area = self.take_busy(range.start, AreaOwner::Unowned, Some(range.size()))?;
        self.engine.unmap(area.range);
        self.retire_lazy(area.range)
    }

    /// Busy to Free immediately, without waiting for a purge.
    ///
    /// Only valid for intervals that never had translations installed, such
    /// as a reservation whose mapping step failed.
    ///
    /// # Errors
    /// [`Misuse::UnknownAddress`] if `addr` does not start a busy interval
    /// obtained from [`reserve`](Self::reserve).
    pub fn free_area(&self, addr: u64) -> Result<(), VmallocError> {
        self.free_busy(addr, AreaOwner::Unowned)
    }

    /// [`free_area`](Self::free_area) for an interval tagged with `owner`.
    pub(crate) fn free_busy(&self, addr: u64, owner: AreaOwner) -> Result<(), VmallocError> {
        let area = self.take_busy(addr, owner, None)?;
        let merged = self
            .free
            .with_lock(|free| free.merge_or_insert(VmapArea::unowned(area.range)));
        match merged {
            Ok((_, retired)) => {
                self.cache.free_n(retired);
                Ok(())
            }
            Err(e) => {
                self.cache.free();
                Err(e)
            }
        }
    }

    /// Register a reclaim notifier, called before a reservation fails for good.
    pub fn register_reclaim_notifier(
        &self,
        f: impl Fn(u64) -> u64 + Send + Sync + 'static,
    ) -> NotifierId {
        self.notifiers.with_lock(|chain| chain.register(Arc::new(f)))
    }

    pub fn unregister_reclaim_notifier(&self, id: NotifierId) -> bool {
        self.notifiers.with_lock(|chain| chain.unregister(id))
    }

    /// Call every reclaim notifier once; returns the bytes they report freed.
    pub(crate) fn notify_reclaim(&self, size: u64) -> u64 {
        let chain = self.notifiers.with_lock(|chain| chain.snapshot());
        if chain.is_empty() {
            return 0;
        }
        let freed = chain.iter().map(|f| f(size)).fold(0u64, u64::saturating_add);
        debug!(
            "vmalloc: {} reclaim notifiers released {freed:#x} bytes for a {size:#x} request",
            chain.len()
        );
        freed
    }

    pub(crate) fn spare(&self, worker: usize) -> Result<&SpareSlot, VmallocError> {
        self.spares
            .get(worker)
            .ok_or(VmallocError::CallerMisuse(Misuse::UnknownWorker(worker)))
    }

    fn check_request(&self, size: u64, align: u64, within: VaRange) -> Result<(), Misuse> {
        if size == 0 {
            return Err(Misuse::ZeroSize);
        }
        if !is_aligned(size, PAGE_SIZE) {
            return Err(Misuse::Misaligned {
                value: size,
                align: PAGE_SIZE,
            });
        }
        if !align.is_power_of_two() {
            return Err(Misuse::BadAlignment(align));
        }
        if within.start >= within.end || !self.config.range.contains_range(within) {
            return Err(Misuse::OutOfBounds(within));
        }
        Ok(())
    }

    /// Reserve an interval and record it as busy with `owner`.
    pub(crate) fn alloc_area(
        &self,
        worker: usize,
        size: u64,
        align: u64,
        within: VaRange,
        owner: AreaOwner,
    ) -> Result<VaRange, VmallocError> {
        self.check_request(size, align, within)?;
        let align = max(align, PAGE_SIZE);
        let spare = self.spare(worker)?;

        let mut attempt = Attempt::First;
        let start = loop {
            // The unit for the busy entry, then the spare, both before the lock.
            let carved = self.cache.alloc().and_then(|()| {
                self.cache.preload(spare);
                self.free
                    .with_lock(|free| self.carve(free, spare, size, align, within))
                    .inspect_err(|_| self.cache.free())
            });
            match carved {
                Ok(start) => break start,
                Err(e) if e.is_exhaustion() => {}
                Err(e) => return Err(e),
            }

            attempt = match attempt {
                Attempt::First => {
                    trace!("vmalloc: no fit for {size:#x}, purging and retrying");
                    self.purge_lazy();
                    Attempt::AfterPurge
                }
                Attempt::AfterPurge => {
                    if self.notify_reclaim(size) > 0 {
                        self.purge_lazy();
                    }
                    Attempt::AfterReclaim
                }
                Attempt::AfterReclaim => {
                    warn!("vmalloc: no space for {size:#x} bytes in {}", self.config.range);
                    return Err(VmallocError::Exhausted);
                }
            };
        };

        let range = VaRange::new(start, start + size);
        debug_assert!(is_aligned(start, align) && within.contains_range(range));

        if let Err(e) = self.busy.with_lock(|busy| busy.insert(VmapArea { range, owner })) {
            // Hand the carved range back; it was never visible to anyone.
            self.cache.free();
            self.insert_free(range);
            return Err(e);
        }
        trace!("vmalloc: reserved {range} for {owner:?} on worker {worker}");
        Ok(range)
    }

    /// Cut `[nva, nva + size)` out of the lowest fitting free interval.
    ///
    /// Runs under the free store lock.
    fn carve(
        &self,
        free: &mut AreaStore,
        spare: &SpareSlot,
        size: u64,
        align: u64,
        within: VaRange,
    ) -> Result<u64, VmallocError> {
        // The slack makes pruning pick nodes that fit at any alignment. When
        // that yields nothing usable below `within.end`, a lower node that is
        // exactly large enough and suitably aligned may still do.
        let search = search_size(size, align, within);
        let (id, nva) = lowest_fit(free, size, align, within, search)
            .or_else(|| {
                (search != size)
                    .then(|| lowest_fit(free, size, align, within, size))
                    .flatten()
            })
            .ok_or(VmallocError::Exhausted)?;
        let va = free.area(id).range;

        let Some(fit) = FitType::classify(va, nva, size) else {
            log::error!("vmalloc: lowest fit {va} cannot host {size:#x} at {nva:#x}");
            return Err(Violation::NoFit {
                candidate: va,
                addr: nva,
                size,
            }
            .into());
        };

        match fit {
            FitType::Full => {
                free.remove(id);
                self.cache.free();
            }
            FitType::LeftEdge => free.set_range(id, VaRange::new(nva + size, va.end)),
            FitType::RightEdge => free.set_range(id, VaRange::new(va.start, nva)),
            FitType::Interior => {
                self.cache.take_spare(spare)?;
                free.set_range(id, VaRange::new(nva + size, va.end));
                if let Err(e) = free.insert(VmapArea::unowned(VaRange::new(va.start, nva))) {
                    self.cache.free();
                    return Err(e);
                }
            }
        }
        Ok(nva)
    }

    /// Remove the busy interval starting at `addr`, keeping its unit.
    ///
    /// The interval must be tagged with `owner` and, if given, be `size`
    /// bytes long; otherwise it stays busy.
    pub(crate) fn take_busy(
        &self,
        addr: u64,
        owner: AreaOwner,
        size: Option<u64>,
    ) -> Result<VmapArea, VmallocError> {
        self.busy
            .with_lock(|busy| {
                let id = busy.find_exact(addr)?;
                let area = busy.area(id);
                let matches = area.owner == owner && size.is_none_or(|s| s == area.range.size());
                matches.then(|| busy.remove(id))
            })
            .ok_or_else(|| {
                warn!("vmalloc: trying to free nonexistent area at {addr:#x}");
                VmallocError::CallerMisuse(Misuse::UnknownAddress(addr))
            })
    }

    /// Busy to Purgatory, for the interval at `addr` tagged with `owner`.
    pub(crate) fn release_lazy(
        &self,
        addr: u64,
        owner: AreaOwner,
        size: Option<u64>,
    ) -> Result<VaRange, VmallocError> {
        let area = self.take_busy(addr, owner, size)?;
        self.retire_lazy(area.range)?;
        Ok(area.range)
    }

    /// Park a range already taken out of Busy in the purgatory.
    pub(crate) fn retire_lazy(&self, range: VaRange) -> Result<(), VmallocError> {
        let pending = self.lazy_bytes.fetch_add(range.size(), Ordering::AcqRel) + range.size();

        match self
            .purge
            .with_lock(|purge| purge.merge_or_insert(VmapArea::unowned(range)))
        {
            Ok((_, retired)) => self.cache.free_n(retired),
            Err(e) => {
                self.lazy_bytes.fetch_sub(range.size(), Ordering::AcqRel);
                self.cache.free();
                return Err(e);
            }
        }

        if pending > self.config.lazy_max_bytes() || self.force_purge.swap(false, Ordering::AcqRel) {
            self.try_purge_lazy();
        }
        Ok(())
    }

    /// Put a range straight back into the free store.
    fn insert_free(&self, range: VaRange) {
        if self.cache.alloc().is_err() {
            log::error!("vmalloc: no descriptor to return {range} to the free store, leaking it");
            return;
        }
        match self
            .free
            .with_lock(|free| free.merge_or_insert(VmapArea::unowned(range)))
        {
            Ok((_, retired)) => self.cache.free_n(retired),
            Err(_) => self.cache.free(),
        }
    }
}

/// Lowest node of `free` pruned by `search` that hosts the request inside
/// `within`, with the address the request would start at.
fn lowest_fit(
    free: &AreaStore,
    size: u64,
    align: u64,
    within: VaRange,
    search: u64,
) -> Option<(NodeId, u64)> {
    let id = free.find_lowest_fit(size, align, within.start, search)?;
    let va = free.area(id).range;
    let nva = align_up(max(va.start, within.start), align)?;
    let end = nva.checked_add(size)?;
    (end <= within.end).then_some((id, nva))
}

/// Size used to prune the free tree for a request.
///
/// Alignment slack only matters for over-page alignment, and not at all when
/// the request spans the whole search window.
fn search_size(size: u64, align: u64, within: VaRange) -> u64 {
    if align <= PAGE_SIZE || within.size() == size {
        size
    } else {
        size.saturating_add(align - 1)
    }
}
