//! Lazy TLB purge.
//!
//! Released intervals park in the purgatory store with their translations
//! already removed but possibly still cached in some CPU's TLB. A purge pass
//! detaches the whole purgatory at once, issues a single flush over the span
//! it covers, and only then merges the intervals back into the free store.

use crate::VmallocContext;
use crate::mapping::{MappingEngine, PageSupplier};
use crate::range::VaRange;
use crate::store::{AreaStore, VmapArea};
use core::mem;
use core::sync::atomic::Ordering;
use log::debug;

impl<M: MappingEngine, P: PageSupplier> VmallocContext<M, P> {
    /// Purge unless another purge is already running.
    ///
    /// Returns `true` if this call purged at least one interval.
    pub fn try_purge_lazy(&self) -> bool {
        match self.purge_lock.try_lock() {
            Some(_serialized) => self.purge_locked(None),
            None => false,
        }
    }

    /// Reclaim fragmented blocks on every worker, then purge.
    ///
    /// Waits for a concurrent purge to finish first.
    pub fn purge_lazy(&self) {
        let _serialized = self.purge_lock.lock();
        self.purge_fragmented_blocks_all();
        self.purge_locked(None);
    }

    /// Flush every lazily kept translation, including the dirty slots of
    /// live blocks, so that no stale alias of a freed page survives.
    pub fn unmap_aliases(&self) {
        let dirty = self.collect_dirty_span();

        let _serialized = self.purge_lock.lock();
        self.purge_fragmented_blocks_all();
        if !self.purge_locked(dirty)
            && let Some(span) = dirty
        {
            debug!("vmalloc: flushing dirty block span {span}");
            self.engine.flush_tlb_range(span);
        }
    }

    /// Make the next release trigger a purge regardless of the threshold.
    pub fn set_nonlazy(&self) {
        self.force_purge.store(true, Ordering::Release);
    }

    /// Bytes waiting in the purgatory.
    pub fn lazy_bytes(&self) -> u64 {
        self.lazy_bytes.load(Ordering::Acquire)
    }

    /// Purge threshold for this context.
    pub const fn lazy_max_bytes(&self) -> u64 {
        self.config.lazy_max_bytes()
    }

    /// One purge pass; `extra` widens the flush. Caller holds `purge_lock`.
    fn purge_locked(&self, extra: Option<VaRange>) -> bool {
        let batch = self.purge.with_lock(mem::take::<AreaStore>);
        if batch.is_empty() {
            return false;
        }
        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return false;
        };

        let mut span = VaRange::new(first.range.start, last.range.end);
        if let Some(extra) = extra {
            span = span.span(extra);
        }
        self.engine.flush_tlb_range(span);

        let count = batch.len();
        let released = batch.bytes();
        let mut retired = 0;
        let mut dropped = 0;
        self.free.with_lock(|free| {
            for area in batch.iter() {
                match free.merge_or_insert(VmapArea::unowned(area.range)) {
                    Ok((_, n)) => retired += n,
                    Err(_) => dropped += 1,
                }
            }
        });
        self.cache.free_n(retired + dropped);
        self.lazy_bytes.fetch_sub(released, Ordering::AcqRel);

        debug!("vmalloc: purged {count} areas ({released:#x} bytes), flushed {span}");
        true
    }
}
