//! # Kernel Memory Layout Constants
//!
//! This crate is the single source of truth for the virtual memory layout
//! shared by the kernel's memory management crates. Everything here is a
//! `const` so that consumers can fold it at compile time and so that layout
//! mistakes are caught by compile-time assertions rather than at boot.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//! USERSPACE_END         ├─────────────────────────────────┤ 0xffff_0000_0000_0000
//!                       │        Guard Region             │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! VMALLOC_START         ├─────────────────────────────────┤ 0xffff_c900_0000_0000
//!                       │   vmalloc / vmap window         │
//!                       │   (non-contiguous backing)      │
//! VMALLOC_END           ├─────────────────────────────────┤ 0xffff_e8ff_ffff_f000
//!                       │        Guard Region             │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Granules
//!
//! * [`PAGE_SIZE`](memory::PAGE_SIZE): the base 4 KiB translation granule.
//!   Every interval handed out of the vmalloc window starts and ends on it.
//! * [`LARGE_PAGE_SIZE`](memory::LARGE_PAGE_SIZE): the 2 MiB PMD-level leaf
//!   size used when a large, naturally aligned area may be mapped coarsely.
//!
//! ## Usage
//! ```rust
//! use kernel_info::memory::{PAGE_SIZE, VMALLOC_END, VMALLOC_START};
//!
//! let pages = (VMALLOC_END - VMALLOC_START) / PAGE_SIZE;
//! assert!(pages > 0);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
