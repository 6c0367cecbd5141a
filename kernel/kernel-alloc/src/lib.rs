//! # Kernel allocators
//!
//! The allocation stack of the kernel, bottom up:
//!
//! - [`boot_map`]: the parsed physical memory map and the one-shot early
//!   allocator that carves from it before anything else exists.
//! - [`buddy`]: the buddy page allocator (BPA) owning all usable frames;
//!   rank-indexed free lists with per-rank buddy-pair bitmaps.
//! - [`object`]: the object memory allocator (OMA); fixed-size slots carved
//!   from page-run buckets, bootstrappable from a raw pool before the BPA
//!   is armed.
//! - [`vheap`]: the virtual-address heap handing out kernel address ranges.
//! - [`universal`]: the universal allocator (UMA) routing arbitrary sizes
//!   to per-rank object pools or whole page runs.
//!
//! The layers are tied together through two seams instead of globals, which
//! is what lets every piece run (and be tested) on a host: a
//! [`FrameSource`] provides page runs plus window translation, and a
//! [`BucketBacking`] (blanket-implemented for every `FrameSource`) feeds
//! bucket growth of object allocators.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod boot_map;
pub mod buddy;
pub mod object;
pub mod universal;
pub mod vheap;

pub(crate) mod pool;

pub use boot_map::{BootMemMap, MemMapEntry};
pub use buddy::{BuddyPageAllocator, MAX_RANK};
pub use object::{BucketPolicy, ObjectAllocator};
pub use universal::UniversalAllocator;
pub use vheap::VirtHeap;

use core::ptr::NonNull;
use kernel_memory_addresses::PhysicalAddress;

/// Page-run allocation plus window translation; the physical ground every
/// higher allocator stands on.
///
/// In the kernel this is the buddy allocator paired with the direct-mapped
/// window; in tests it is a fake arena.
pub trait FrameSource {
    /// Allocate a naturally aligned run of `1 << rank` pages.
    fn alloc_run(&self, rank: u8) -> Option<PhysicalAddress>;

    /// Release a run previously obtained at the same rank.
    ///
    /// # Safety
    /// `base` must come from [`alloc_run`](Self::alloc_run) with this exact
    /// `rank`, and must not be freed twice.
    unsafe fn free_run(&self, base: PhysicalAddress, rank: u8);

    /// The window pointer for a physical address owned by this source.
    fn window(&self, pa: PhysicalAddress) -> NonNull<u8>;

    /// The physical address behind a window pointer, or `None` when the
    /// pointer lies outside the window.
    fn unwindow(&self, ptr: NonNull<u8>) -> Option<PhysicalAddress>;
}

/// Where an object allocator gets (and returns) bucket memory.
pub trait BucketBacking {
    /// A fresh run of `1 << rank` pages, as a window pointer.
    fn alloc_bucket(&self, rank: u8) -> Option<NonNull<u8>>;

    /// Return a bucket run.
    ///
    /// # Safety
    /// `base` must come from [`alloc_bucket`](Self::alloc_bucket) with the
    /// same `rank`.
    unsafe fn free_bucket(&self, base: NonNull<u8>, rank: u8);
}

impl<T: FrameSource> BucketBacking for T {
    fn alloc_bucket(&self, rank: u8) -> Option<NonNull<u8>> {
        self.alloc_run(rank).map(|pa| self.window(pa))
    }

    unsafe fn free_bucket(&self, base: NonNull<u8>, rank: u8) {
        let pa = self
            .unwindow(base)
            .expect("bucket pointer must lie in the window");
        unsafe {
            self.free_run(pa, rank);
        }
    }
}

/// Backing for pools that must never grow or shrink: the bootstrap pools
/// carved out by the early allocator.
pub struct NoGrowth;

impl BucketBacking for NoGrowth {
    fn alloc_bucket(&self, _rank: u8) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn free_bucket(&self, _base: NonNull<u8>, _rank: u8) {
        unreachable!("pinned pools never return buckets");
    }
}

/// `ceil(log2(x))` for `x >= 1`.
#[inline]
#[must_use]
pub(crate) const fn ceil_log2(x: u64) -> u32 {
    x.next_power_of_two().trailing_zeros()
}
