//! # Kernel Virtual Area Allocator
//!
//! This crate hands out ranges of the kernel's `vmalloc` window: virtually
//! contiguous areas backed by physically scattered pages. It decides *where*
//! an area lives and when its address range may be reused; installing the
//! translations and supplying the pages is left to the kernel through the
//! [`MappingEngine`] and [`PageSupplier`] traits.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Virtual Areas (vm_area)                │
//! │    • vmalloc / vmap / vfree / vm_map_ram            │
//! │    • Guard pages, area descriptors                  │
//! └──────────┬──────────────────────────────┬───────────┘
//!            │                              │ small requests
//!            │                 ┌────────────▼───────────┐
//!            │                 │ Per-Worker Block Pool  │
//!            │                 │ (block)                │
//!            │                 └────────────┬───────────┘
//! ┌──────────▼──────────────────────────────▼───────────┐
//! │           Interval Allocator (context)              │
//! │    • Lowest-address fit, four-way split             │
//! │    • Purge / reclaim / retry on exhaustion          │
//! └──────────┬──────────────────────────────────────────┘
//!            │
//! ┌──────────▼──────────────────────────────────────────┐
//! │     Interval Stores (store): Busy · Free · Purge    │
//! │    • Augmented AVL tree + address-ordered list      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Interval Lifecycle
//!
//! ```text
//!   reserve             release               purge pass
//! Free ───────▶ Busy ───────────▶ Purgatory ─────────────▶ Free
//!  (split)                        (unmapped,   (one TLB flush
//!                                  maybe still   per batch,
//!                                  in a TLB)     merge on insert)
//! ```
//!
//! An interval in the purgatory has no translations left but may still be
//! cached by some CPU's TLB, so its addresses must not be handed out again
//! until a purge pass has flushed them. Batching the flush is what makes
//! freeing cheap: a single ranged invalidation covers everything released
//! since the last pass.
//!
//! ## Concurrency
//!
//! Every operation takes `&self`. The Busy, Free and Purgatory stores each
//! have their own lock and no operation holds two of them at once. Small
//! requests are served per worker (CPU) from the block pool, and callers that
//! must not sleep can only queue releases with
//! [`vfree_atomic`](VmallocContext::vfree_atomic).
//!
//! ## Usage
//!
//! ```rust
//! use kernel_vmalloc::{
//!     MapError, MappingEngine, PageSupplier, PhysicalFrame, Protection, VaRange,
//!     VmallocConfig, VmallocContext,
//! };
//!
//! struct NoTables;
//!
//! impl MappingEngine for NoTables {
//!     fn map(&self, _: VaRange, _: &[PhysicalFrame], _: Protection) -> Result<(), MapError> {
//!         Ok(())
//!     }
//!     fn unmap(&self, _: VaRange) {}
//!     fn flush_tlb_range(&self, _: VaRange) {}
//! }
//!
//! struct Bump(core::sync::atomic::AtomicU64);
//!
//! impl PageSupplier for Bump {
//!     fn alloc_frame(&self, order: u32) -> Option<PhysicalFrame> {
//!         let size = 4096u64 << order;
//!         let addr = self.0.fetch_add(size, core::sync::atomic::Ordering::Relaxed);
//!         Some(PhysicalFrame::new(addr, order))
//!     }
//!     fn free_frame(&self, _: PhysicalFrame) {}
//! }
//!
//! let config = VmallocConfig::new(VaRange::new(0x4000_0000, 0x8000_0000), 2);
//! let vm = VmallocContext::init(config, NoTables, Bump(0.into())).unwrap();
//!
//! let addr = vm.vmalloc(0, 3 * 4096, Protection::kernel()).unwrap();
//! assert_eq!(vm.find_vm_area(addr).unwrap().size, 3 * 4096);
//! vm.vfree(addr).unwrap();
//! assert_eq!(vm.shutdown().live_areas, 0);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

mod area_cache;
mod block;
mod config;
mod context;
mod diag;
mod error;
mod mapping;
mod notifier;
mod purge;
mod range;
mod store;
mod vm_area;

pub use config::{VmallocConfig, default_block_pages, fls};
pub use context::{ShutdownReport, VmallocContext, VmapHandle};
pub use diag::VmallocStats;
pub use error::{Misuse, Violation, VmallocError};
pub use mapping::{MapError, MappingEngine, PageSupplier, PhysicalFrame, Protection};
pub use notifier::{NotifierId, ReclaimFn};
pub use range::{VaRange, align_down, align_up, is_aligned};
pub use store::{AreaOwner, VmapArea};
pub use vm_area::{VmArea, VmAreaId, VmFlags};
