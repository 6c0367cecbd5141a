//! # Kernel virtual-memory layout
//!
//! One place for every fixed virtual address the memory subsystems agree on.
//! The constants are asserted for consistency at compile time.

/// Base of the direct-mapped window: physical address `pa` is readable at
/// `DMA_BASE + pa` once the kernel page table is live.
///
/// Occupies exactly one top-level page-table slot (slot 256, the first slot
/// of the higher half), which keeps the early bootstrap mapping to a single
/// borrowed level-3 table of 1 GiB leaves.
pub const DMA_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Size of the direct-mapped window in bytes (512 GiB).
///
/// Physical memory beyond this is not reachable through the window; the
/// allocators never hand out frames above it.
pub const DMA_SIZE: u64 = 512 * GIB;

/// Base of the kernel virtual-address heap served by the range allocator.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_FE00_0000_0000;

/// Where the kernel image executes; matches the linker script of the boot
/// image.
pub const KERNEL_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// Base of the per-CPU table; each CPU owns one page-pinned slot.
pub const PER_CPU_BASE: u64 = 0xFFFF_FF00_0000_0000;

/// Where the bootstrap stack is remapped in the kernel address space.
pub const BOOT_STACK_BASE: u64 = 0xFFFF_FF80_0000_0000;

/// Kernel stack size per CPU.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

const GIB: u64 = 1024 * 1024 * 1024;

const _: () = {
    // The window must fill whole top-level slots, starting on one.
    assert!(DMA_BASE % (512 * GIB) == 0);
    assert!(DMA_SIZE % GIB == 0);
    // Heap and image live above the window; nothing may alias it.
    assert!(KERNEL_HEAP_BASE >= DMA_BASE + DMA_SIZE);
    assert!(PER_CPU_BASE > KERNEL_HEAP_BASE);
    assert!(BOOT_STACK_BASE > PER_CPU_BASE);
    assert!(KERNEL_BASE > BOOT_STACK_BASE);
    assert!(KERNEL_STACK_SIZE % 4096 == 0);
};
