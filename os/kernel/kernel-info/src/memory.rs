//! # Memory Layout

/// End of userspace VA range after which Kernel space begins.
pub const USERSPACE_END: u64 = 0xffff_0000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the kernel virtual window handed out by `vmalloc`/`vmap`.
///
/// Sits right above the 64 TiB reserved for the direct map.
pub const VMALLOC_START: u64 = 0xffff_c900_0000_0000;

/// Exclusive end of the `vmalloc` window (32 TiB).
pub const VMALLOC_END: u64 = 0xffff_e8ff_ffff_f000;

/// Size of the `vmalloc` window in bytes.
pub const VMALLOC_SIZE: u64 = VMALLOC_END - VMALLOC_START;

/// Where the kernel executes (VMA), matches your linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Base translation granule (4 KiB).
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Size of a PMD-level leaf mapping (2 MiB).
pub const LARGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// log2 of [`LARGE_PAGE_SIZE`].
pub const LARGE_PAGE_SHIFT: u32 = 21;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(LARGE_PAGE_SIZE == 1 << LARGE_PAGE_SHIFT);
    assert!(HHDM_BASE >= USERSPACE_END);
    assert!(VMALLOC_START > HHDM_BASE);
    assert!(VMALLOC_END > VMALLOC_START);
    assert!(KERNEL_BASE > VMALLOC_END);
    assert!(VMALLOC_START.is_multiple_of(LARGE_PAGE_SIZE));
    assert!(VMALLOC_END.is_multiple_of(PAGE_SIZE));
};
