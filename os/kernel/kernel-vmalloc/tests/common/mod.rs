#![allow(dead_code)]

use kernel_vmalloc::{
    MapError, MappingEngine, PageSupplier, PhysicalFrame, Protection, VaRange, VmallocConfig,
    VmallocContext,
};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

pub const P: u64 = 4096;

/// Page-granular fake page tables that remember every call.
#[derive(Default)]
pub struct RecordingEngine {
    pub pages: Mutex<BTreeMap<u64, u64>>,
    pub flushes: Mutex<Vec<VaRange>>,
    pub unmaps: Mutex<Vec<VaRange>>,
    pub fail_maps: AtomicUsize,
    pub allow_large: AtomicBool,
    pub large_attempts: AtomicUsize,
}

impl RecordingEngine {
    pub fn mapped_pages(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    pub fn translate(&self, va: u64) -> Option<u64> {
        self.pages.lock().unwrap().get(&(va & !(P - 1))).copied()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.lock().unwrap().len()
    }

    pub fn last_flush(&self) -> Option<VaRange> {
        self.flushes.lock().unwrap().last().copied()
    }

    fn install(&self, range: VaRange, frames: &[PhysicalFrame]) -> Result<(), MapError> {
        let bytes: u64 = frames.iter().map(PhysicalFrame::size).sum();
        if bytes != range.size() {
            return Err(MapError::SizeMismatch {
                frames: bytes,
                range: range.size(),
            });
        }
        let mut pages = self.pages.lock().unwrap();
        if let Some((&va, _)) = pages.range(range.start..range.end).next() {
            return Err(MapError::AlreadyMapped(va));
        }
        let mut va = range.start;
        for frame in frames {
            for i in 0..frame.nr_pages() {
                pages.insert(va, frame.page_addr(i));
                va += P;
            }
        }
        Ok(())
    }
}

impl MappingEngine for RecordingEngine {
    fn map(
        &self,
        range: VaRange,
        frames: &[PhysicalFrame],
        _prot: Protection,
    ) -> Result<(), MapError> {
        if self
            .fail_maps
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MapError::OutOfTableMemory);
        }
        self.install(range, frames)
    }

    fn unmap(&self, range: VaRange) {
        let mut pages = self.pages.lock().unwrap();
        let doomed: Vec<u64> = pages.range(range.start..range.end).map(|(&va, _)| va).collect();
        for va in doomed {
            pages.remove(&va);
        }
        drop(pages);
        self.unmaps.lock().unwrap().push(range);
    }

    fn flush_tlb_range(&self, range: VaRange) {
        self.flushes.lock().unwrap().push(range);
    }

    fn try_large_mapping(
        &self,
        range: VaRange,
        frames: &[PhysicalFrame],
        _prot: Protection,
        page_size: u64,
    ) -> bool {
        self.large_attempts.fetch_add(1, Ordering::AcqRel);
        self.allow_large.load(Ordering::Acquire)
            && range.start % page_size == 0
            && self.install(range, frames).is_ok()
    }
}

/// Bump allocator of fake physical frames with a page limit.
pub struct PoolPages {
    next: AtomicU64,
    limit: u64,
    pub outstanding: AtomicU64,
    pub refuse_large: AtomicBool,
}

impl PoolPages {
    pub fn new(limit: u64) -> Self {
        Self {
            next: AtomicU64::new(0x1_0000_0000),
            limit,
            outstanding: AtomicU64::new(0),
            refuse_large: AtomicBool::new(false),
        }
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl PageSupplier for PoolPages {
    fn alloc_frame(&self, order: u32) -> Option<PhysicalFrame> {
        if order > 0 && self.refuse_large.load(Ordering::Acquire) {
            return None;
        }
        let pages = 1u64 << order;
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n + pages <= self.limit).then_some(n + pages)
            })
            .ok()?;
        let size = P << order;
        let mut addr = self.next.fetch_add(2 * size, Ordering::AcqRel);
        addr = (addr + size - 1) & !(size - 1);
        Some(PhysicalFrame::new(addr, order))
    }

    fn free_frame(&self, frame: PhysicalFrame) {
        self.outstanding.fetch_sub(frame.nr_pages(), Ordering::AcqRel);
    }

    fn total_pages(&self) -> Option<u64> {
        Some(self.limit)
    }
}

pub type Vm = VmallocContext<RecordingEngine, PoolPages>;

pub const BASE: u64 = 0x4000_0000;

/// A 64 MiB window at 1 GiB with 128-page blocks.
pub fn config(workers: usize) -> VmallocConfig {
    VmallocConfig::new(VaRange::new(BASE, BASE + (64 << 20)), workers).with_block_pages(128)
}

pub fn vm(workers: usize) -> Vm {
    vm_with(config(workers))
}

pub fn vm_with(config: VmallocConfig) -> Vm {
    VmallocContext::init(config, RecordingEngine::default(), PoolPages::new(1 << 16)).unwrap()
}

pub fn free_ranges(vm: &Vm) -> Vec<(u64, u64)> {
    vm.free_areas()
        .iter()
        .map(|a| (a.range.start, a.range.end))
        .collect()
}

/// xorshift64*, deterministic.
pub struct Rng(pub u64);

impl Rng {
    pub fn next(&mut self) -> u64 {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        self.0.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}
