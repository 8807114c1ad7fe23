//! # Per-worker block pool
//!
//! Small mappings (up to [`VmallocConfig::max_small_pages`] pages) are too
//! frequent to pay for a tree insert, a tree removal and a TLB flush each.
//! Instead each worker carves them from *blocks*: one busy interval of
//! [`VmallocConfig::block_pages`] pages, handed out in power-of-two slot
//! runs by bumping a cursor.
//!
//! Freed slots are never reused. They become *dirty*: unmapped, but possibly
//! still in some TLB. A block whose slots are all dirty is dead weight and is
//! released as a whole into the lazy purge pipeline, which flushes it along
//! with everything else. A block whose remaining slots are all free or dirty
//! (nobody holds a live slot) is *fragmented*: it stops serving allocations
//! and waits on its worker's fragmented list until
//! [`purge_fragmented_blocks`](VmallocContext::purge_fragmented_blocks)
//! retires it.
//!
//! Blocks are indexed by start address for release and linked into their
//! creating worker's queue while they still have free slots. Lock order is
//! queue, then block.
//!
//! [`VmallocConfig::max_small_pages`]: crate::VmallocConfig::max_small_pages
//! [`VmallocConfig::block_pages`]: crate::VmallocConfig::block_pages

use crate::VmallocContext;
use crate::context::VmapHandle;
use crate::error::{Misuse, Violation, VmallocError};
use crate::mapping::{MappingEngine, PageSupplier};
use crate::range::{VaRange, is_aligned};
use crate::store::AreaOwner;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::{max, min};
use kernel_info::memory::PAGE_SIZE;
use kernel_sync::{PerWorker, SpinMutex};
use log::{debug, error, trace};

pub(crate) struct VmapBlock {
    va: VaRange,
    worker: usize,
    total: usize,
    free: usize,
    dirty: usize,
    dirty_min: usize,
    dirty_max: usize,
    /// One bit per slot released since the block was created.
    released: Vec<u64>,
    dead: bool,
}

impl VmapBlock {
    fn new(va: VaRange, worker: usize, total: usize, taken: usize) -> Self {
        Self {
            va,
            worker,
            total,
            free: total - taken,
            dirty: 0,
            dirty_min: total,
            dirty_max: 0,
            released: vec![0; total.div_ceil(64)],
            dead: false,
        }
    }

    fn any_released(&self, offset: usize, slots: usize) -> bool {
        (offset..offset + slots).any(|i| self.released[i / 64] & (1 << (i % 64)) != 0)
    }

    fn mark_released(&mut self, offset: usize, slots: usize) {
        for i in offset..offset + slots {
            self.released[i / 64] |= 1 << (i % 64);
        }
    }

    /// Slots nobody will ever hand out again and nobody holds.
    const fn is_fragmented(&self) -> bool {
        self.free + self.dirty == self.total && self.dirty != self.total
    }

    fn retire(&mut self) {
        self.free = 0;
        self.dirty = self.total;
        self.dirty_min = 0;
        self.dirty_max = self.total;
        self.dead = true;
    }

    const fn dirty_range(&self) -> Option<VaRange> {
        if self.dirty_min >= self.dirty_max {
            return None;
        }
        let start = self.va.start + self.dirty_min as u64 * PAGE_SIZE;
        let end = self.va.start + self.dirty_max as u64 * PAGE_SIZE;
        Some(VaRange::new(start, end))
    }
}

type BlockRef = Arc<SpinMutex<VmapBlock>>;

pub(crate) struct BlockPool {
    queues: PerWorker<SpinMutex<Vec<BlockRef>>>,
    /// Unlinked blocks with no live slot, per worker.
    fragmented: PerWorker<SpinMutex<Vec<BlockRef>>>,
    index: SpinMutex<BTreeMap<u64, BlockRef>>,
}

impl BlockPool {
    pub fn new(nr_workers: usize) -> Self {
        Self {
            queues: PerWorker::new(nr_workers, |_| SpinMutex::new(Vec::new())),
            fragmented: PerWorker::new(nr_workers, |_| SpinMutex::new(Vec::new())),
            index: SpinMutex::new(BTreeMap::new()),
        }
    }

    pub fn count(&self) -> usize {
        self.index.with_lock(|index| index.len())
    }

    fn lookup(&self, addr: u64) -> Option<BlockRef> {
        self.index.with_lock(|index| {
            index
                .range(..=addr)
                .next_back()
                .map(|(_, block)| Arc::clone(block))
        })
    }
}

/// Bump-allocate `slots` from the first block in `queue` that has room.
fn alloc_from_queue(queue: &mut Vec<BlockRef>, slots: usize) -> Option<u64> {
    let mut hit = None;
    for (i, block) in queue.iter().enumerate() {
        let mut vb = block.lock();
        if vb.dead || vb.free < slots {
            continue;
        }
        let offset = vb.total - vb.free;
        vb.free -= slots;
        hit = Some((i, vb.va.start + offset as u64 * PAGE_SIZE, vb.free == 0));
        break;
    }
    let (i, addr, full) = hit?;
    if full {
        queue.remove(i);
    }
    Some(addr)
}

impl<M: MappingEngine, P: PageSupplier> VmallocContext<M, P> {
    fn small_slots(&self, size: u64) -> Result<usize, VmallocError> {
        if size == 0 {
            return Err(Misuse::ZeroSize.into());
        }
        if !is_aligned(size, PAGE_SIZE) {
            return Err(Misuse::Misaligned {
                value: size,
                align: PAGE_SIZE,
            }
            .into());
        }
        let limit = self.config.max_small_size();
        if size > limit {
            return Err(Misuse::TooLarge { size, limit }.into());
        }
        // Bounded by max_small_pages, which fits a usize.
        #[allow(clippy::cast_possible_truncation)]
        let pages = (size / PAGE_SIZE) as usize;
        Ok(pages.next_power_of_two())
    }

    /// Reserve `size` bytes from `worker`'s blocks.
    ///
    /// The returned range is `size` bytes; internally it occupies the next
    /// power of two of pages.
    ///
    /// # Errors
    /// * [`Misuse::TooLarge`] above [`max_small_size`](crate::VmallocConfig::max_small_size).
    /// * [`VmallocError::Exhausted`] if a new block cannot be reserved.
    pub fn reserve_small(&self, worker: usize, size: u64) -> Result<VmapHandle, VmallocError> {
        let slots = self.small_slots(size)?;
        let queue = self
            .blocks
            .queues
            .get(worker)
            .ok_or(VmallocError::CallerMisuse(Misuse::UnknownWorker(worker)))?;

        let addr = match queue.with_lock(|q| alloc_from_queue(q, slots)) {
            Some(addr) => addr,
            None => self.new_block(worker, slots)?,
        };
        Ok(VmapHandle::new(VaRange::new(addr, addr + size)))
    }

    /// Give back `size` bytes obtained from [`reserve_small`](Self::reserve_small).
    ///
    /// The slots are unmapped without a flush and marked dirty.
    ///
    /// # Errors
    /// [`Misuse::UnknownAddress`] if the handle is not inside a block, or
    /// [`Violation::BlockAccounting`] if its slots were already released.
    pub fn release_small(&self, handle: VmapHandle, size: u64) -> Result<(), VmallocError> {
        self.free_small(handle.addr(), size)
    }

    pub(crate) fn free_small(&self, addr: u64, size: u64) -> Result<(), VmallocError> {
        let slots = self.small_slots(size)?;
        let unknown = VmallocError::CallerMisuse(Misuse::UnknownAddress(addr));
        let block = self.blocks.lookup(addr).ok_or(unknown)?;

        let check = |vb: &VmapBlock| -> Result<usize, VmallocError> {
            if vb.dead || !vb.va.contains(addr) || !is_aligned(addr, PAGE_SIZE) {
                return Err(unknown);
            }
            #[allow(clippy::cast_possible_truncation)]
            let offset = ((addr - vb.va.start) / PAGE_SIZE) as usize;
            if offset + slots > vb.total - vb.free {
                return Err(unknown);
            }
            if vb.free + vb.dirty + slots > vb.total || vb.any_released(offset, slots) {
                error!("vmalloc: double release of {addr:#x} in block {}", vb.va);
                return Err(Violation::BlockAccounting {
                    block: vb.va,
                    free: vb.free,
                    dirty: vb.dirty + slots,
                    total: vb.total,
                }
                .into());
            }
            Ok(offset)
        };

        block.with_lock(|vb| check(vb))?;
        self.engine.unmap(VaRange::new(addr, addr + size));

        let (dead, fragmented) = block.with_lock(|vb| -> Result<(bool, bool), VmallocError> {
            let offset = check(vb)?;
            vb.mark_released(offset, slots);
            vb.dirty_min = min(vb.dirty_min, offset);
            vb.dirty_max = max(vb.dirty_max, offset + slots);
            vb.dirty += slots;
            if vb.dirty == vb.total {
                debug_assert_eq!(vb.free, 0);
                vb.dead = true;
            }
            Ok((vb.dead, vb.is_fragmented()))
        })?;

        if dead {
            self.free_block(&block);
        } else if fragmented {
            self.unlink_fragmented(&block);
        }
        Ok(())
    }

    /// Move a block without live slots from its queue to the fragmented list.
    fn unlink_fragmented(&self, block: &BlockRef) {
        let worker = block.with_lock(|vb| vb.worker);
        let (Some(queue), Some(fragmented)) = (
            self.blocks.queues.get(worker),
            self.blocks.fragmented.get(worker),
        ) else {
            return;
        };
        let unlinked = queue.with_lock(|q| {
            let Some(i) = q.iter().position(|b| Arc::ptr_eq(b, block)) else {
                return false;
            };
            // The block lock was dropped after the release; recheck.
            if !q[i].lock().is_fragmented() {
                return false;
            }
            q.remove(i);
            true
        });
        if unlinked {
            trace!("vmalloc: block on worker {worker} is fragmented");
            fragmented.with_lock(|f| f.push(Arc::clone(block)));
        }
    }

    /// Retire every fragmented block of `worker`.
    pub fn purge_fragmented_blocks(&self, worker: usize) {
        let Some(fragmented) = self.blocks.fragmented.get(worker) else {
            return;
        };
        let victims = fragmented.with_lock(core::mem::take);
        for block in &victims {
            let retired = block.with_lock(|vb| {
                if vb.dead || !vb.is_fragmented() {
                    return false;
                }
                vb.retire();
                true
            });
            if retired {
                self.free_block(block);
            }
        }
    }

    pub(crate) fn purge_fragmented_blocks_all(&self) {
        for worker in 0..self.blocks.queues.len() {
            self.purge_fragmented_blocks(worker);
        }
    }

    /// Union of the dirty ranges of all linked blocks; resets them.
    pub(crate) fn collect_dirty_span(&self) -> Option<VaRange> {
        let mut span: Option<VaRange> = None;
        let lists = self.blocks.queues.iter().chain(self.blocks.fragmented.iter());
        for queue in lists {
            queue.with_lock(|q| {
                for block in q.iter() {
                    let mut vb = block.lock();
                    if vb.dirty == 0 || vb.dirty == vb.total {
                        continue;
                    }
                    if let Some(range) = vb.dirty_range() {
                        span = Some(span.map_or(range, |s| s.span(range)));
                        vb.dirty_min = vb.total;
                        vb.dirty_max = 0;
                    }
                }
            });
        }
        span
    }

    /// Number of live blocks across all workers.
    pub fn nr_blocks(&self) -> usize {
        self.blocks.count()
    }

    fn new_block(&self, worker: usize, slots: usize) -> Result<u64, VmallocError> {
        let block_size = self.config.block_size();
        let va = self.alloc_area(worker, block_size, block_size, self.config.range, AreaOwner::Block)?;
        let block = Arc::new(SpinMutex::new(VmapBlock::new(
            va,
            worker,
            self.config.block_pages,
            slots,
        )));

        self.blocks
            .index
            .with_lock(|index| index.insert(va.start, Arc::clone(&block)));
        if let Some(queue) = self.blocks.queues.get(worker) {
            queue.with_lock(|q| q.push(block));
        }
        debug!("vmalloc: new block {va} on worker {worker}");
        Ok(va.start)
    }

    /// Drop a dead block and release its interval lazily.
    fn free_block(&self, block: &BlockRef) {
        let va = block.with_lock(|vb| {
            debug_assert!(vb.dead);
            vb.va
        });
        self.blocks.index.with_lock(|index| index.remove(&va.start));
        debug!("vmalloc: freeing block {va}");
        if let Err(e) = self.release_lazy(va.start, AreaOwner::Block, Some(va.size())) {
            error!("vmalloc: block {va} lost its busy interval: {e}");
        }
    }
}
