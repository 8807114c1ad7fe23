//! Read-only views for diagnostics and tests.

use crate::VmallocContext;
use crate::error::{Violation, VmallocError};
use crate::mapping::{MappingEngine, PageSupplier};
use crate::store::{AreaStore, VmapArea};
use alloc::vec::Vec;
use kernel_sync::SpinMutex;

/// Counters across all stores.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct VmallocStats {
    pub busy_areas: usize,
    pub busy_bytes: u64,
    pub free_areas: usize,
    pub free_bytes: u64,
    /// Largest single free interval.
    pub largest_free: u64,
    pub purge_areas: usize,
    pub purge_bytes: u64,
    pub lazy_bytes: u64,
    /// Area objects taken from the pool, staged spares included.
    pub live_area_objects: usize,
    pub staged_spares: usize,
    pub blocks: usize,
    pub vmalloc_pages: u64,
}

fn snapshot(store: &SpinMutex<AreaStore>) -> Vec<VmapArea> {
    store.with_lock(|s| s.iter().copied().collect())
}

impl<M: MappingEngine, P: PageSupplier> VmallocContext<M, P> {
    /// Busy intervals in address order.
    pub fn busy_areas(&self) -> Vec<VmapArea> {
        snapshot(&self.busy)
    }

    /// Intervals waiting for a purge, in address order.
    pub fn purgatory_areas(&self) -> Vec<VmapArea> {
        snapshot(&self.purge)
    }

    /// Free intervals in address order.
    pub fn free_areas(&self) -> Vec<VmapArea> {
        snapshot(&self.free)
    }

    pub fn stats(&self) -> VmallocStats {
        let (busy_areas, busy_bytes) = self.busy.with_lock(|s| (s.len(), s.bytes()));
        let (free_areas, free_bytes, largest_free) =
            self.free.with_lock(|s| (s.len(), s.bytes(), s.max_size()));
        let (purge_areas, purge_bytes) = self.purge.with_lock(|s| (s.len(), s.bytes()));
        VmallocStats {
            busy_areas,
            busy_bytes,
            free_areas,
            free_bytes,
            largest_free,
            purge_areas,
            purge_bytes,
            lazy_bytes: self.lazy_bytes(),
            live_area_objects: self.cache.live(),
            staged_spares: self.spares.iter().filter(|s| s.is_staged()).count(),
            blocks: self.nr_blocks(),
            vmalloc_pages: self.vmalloc_nr_pages(),
        }
    }

    /// Verify every store and their combined accounting.
    ///
    /// The cross-store checks read the stores one after another, so they are
    /// only meaningful while no other thread mutates the context.
    ///
    /// # Errors
    /// The first [`Violation`] found.
    pub fn check_invariants(&self) -> Result<(), VmallocError> {
        for store in [&self.busy, &self.free, &self.purge] {
            store.with_lock(|s| s.check_invariants())?;
        }

        let mut all: Vec<VmapArea> = self.busy_areas();
        all.extend(self.free_areas());
        all.extend(self.purgatory_areas());
        all.sort_unstable_by_key(|a| a.range.start);

        for pair in all.windows(2) {
            if pair[0].range.overlaps(pair[1].range) {
                log::error!("vmalloc: {} overlaps {} across stores", pair[0].range, pair[1].range);
                return Err(Violation::Overlap {
                    new: pair[1].range,
                    existing: pair[0].range,
                }
                .into());
            }
        }

        let covered: u64 = all.iter().map(|a| a.range.size()).sum();
        if covered != self.config.range.size() {
            return Err(Violation::Accounting {
                expected: self.config.range.size(),
                actual: covered,
            }
            .into());
        }

        let stats = self.stats();
        let objects = all.len() + stats.staged_spares;
        if objects != stats.live_area_objects {
            return Err(Violation::Accounting {
                expected: stats.live_area_objects as u64,
                actual: objects as u64,
            }
            .into());
        }
        if stats.purge_bytes != stats.lazy_bytes {
            return Err(Violation::Accounting {
                expected: stats.lazy_bytes,
                actual: stats.purge_bytes,
            }
            .into());
        }
        Ok(())
    }
}
