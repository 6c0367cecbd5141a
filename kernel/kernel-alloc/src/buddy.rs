//! # Buddy Page Allocator
//!
//! Owns every usable physical frame. Free memory is kept as naturally
//! aligned power-of-two page runs on per-rank free lists (rank `r` holds
//! `2^r`-page runs); a per-rank bitmap stores one bit per *buddy pair*,
//! defined as the XOR of the two buddies' free states:
//!
//! > `bit[r][i] == 1` iff exactly one of the two rank-`r` buddies of pair
//! > `i` is on the rank-`r` free list.
//!
//! Keeping the XOR means every list insertion or removal is a plain toggle,
//! and the free path can decide "can I merge with my buddy?" with a single
//! bit test: the run being freed is not on the list, so a set bit proves
//! the buddy is.
//!
//! Allocation splits the first sufficiently large run downward, pushing
//! upper halves back; freeing merges upward while the buddy bit stays set.
//! Both loops are bounded by [`MAX_RANK`], and a single spin lock covers
//! every operation end to end.
//!
//! The free-list nodes come from an internal object pool bootstrapped over
//! memory the early allocator provides, which is what breaks the "buddy
//! needs nodes, nodes need pages" cycle during bring-up.

use crate::object::{BucketPolicy, ObjectAllocator};
use crate::{FrameSource, NoGrowth};
use core::ptr::{self, NonNull};
use kernel_memory_addresses::{PageIndex, PageSize, PhysicalAddress, Size4K};
use kernel_sync::SpinLock;
use log::info;

/// Number of ranks; the largest run is `2^(MAX_RANK - 1)` pages (16 MiB).
pub const MAX_RANK: usize = 13;

/// A free run of `2^rank` pages starting at page `base`.
#[repr(C)]
struct FreeNode {
    base: u32,
    prev: *mut FreeNode,
    next: *mut FreeNode,
}

/// Free list plus buddy-pair bitmap of one rank.
struct FreeArea {
    head: *mut FreeNode,
    bitmap: *mut u8,
}

struct BuddyInner {
    areas: [FreeArea; MAX_RANK],
    /// Pool for [`FreeNode`]s; pinned bootstrap bucket, never grows.
    nodes: ObjectAllocator,
    allocated_pages: u64,
}

// Safety: all raw pointers are guarded by the allocator's spin lock.
unsafe impl Send for BuddyInner {}

/// The buddy page allocator (BPA).
///
/// All public operations lock internally; the allocator is shared by
/// reference across every CPU.
pub struct BuddyPageAllocator {
    inner: SpinLock<BuddyInner>,
}

impl BuddyPageAllocator {
    /// Bytes of bitmap backing needed for `max_pages` physical pages,
    /// across all ranks. The caller reserves this via the early allocator.
    #[must_use]
    pub fn bitmap_bytes(max_pages: u32) -> usize {
        (0..MAX_RANK)
            .map(|rank| rank_bitmap_bytes(max_pages, rank))
            .sum()
    }

    /// Pages (a power of two) of node-pool backing needed for `max_pages`
    /// physical pages.
    ///
    /// Sized for one node per two pages, the worst case of an alternating
    /// allocated/free pattern at rank 0.
    #[must_use]
    pub fn node_pool_pages(max_pages: u32) -> u32 {
        let nodes = (max_pages / 2).max(64);
        let bytes = u64::from(nodes) * size_of::<FreeNode>() as u64;
        (bytes.div_ceil(Size4K::SIZE) as u32).next_power_of_two()
    }

    /// Arm the allocator over the free ranges of the memory map.
    ///
    /// `free_ranges` yields `(base_page, pages)` runs; each is decomposed
    /// into maximal naturally aligned power-of-two runs and seeded onto the
    /// free lists. Pages backing `bitmap` and `node_pool` themselves must
    /// not be part of any range.
    ///
    /// # Safety
    /// - `bitmap` must point at [`bitmap_bytes`](Self::bitmap_bytes)`(max_pages)`
    ///   writable bytes exclusively owned by the allocator.
    /// - `node_pool` must point at `node_pool_pages * 4096` writable bytes,
    ///   exclusively owned, with `node_pool_pages` a power of two.
    #[must_use]
    pub unsafe fn new(
        max_pages: u32,
        bitmap: NonNull<u8>,
        node_pool: NonNull<u8>,
        node_pool_pages: u32,
        free_ranges: impl Iterator<Item = (u32, u32)>,
    ) -> Self {
        // All-zero bitmaps say "no run is free", the right starting point
        // for toggle-maintained XOR bits.
        // SAFETY: the caller sized the region via bitmap_bytes().
        unsafe {
            ptr::write_bytes(bitmap.as_ptr(), 0, Self::bitmap_bytes(max_pages));
        }

        let mut offset = 0usize;
        let areas = core::array::from_fn(|rank| {
            let area = FreeArea {
                head: ptr::null_mut(),
                // SAFETY: offsets stay within the sized region.
                bitmap: unsafe { bitmap.as_ptr().add(offset) },
            };
            offset += rank_bitmap_bytes(max_pages, rank);
            area
        });

        // SAFETY: forwarded caller contract.
        let nodes = unsafe {
            ObjectAllocator::from_raw_pool(
                size_of::<FreeNode>() as u32,
                node_pool,
                node_pool_pages,
                BucketPolicy::Pinned,
            )
        };

        let mut inner = BuddyInner {
            areas,
            nodes,
            allocated_pages: 0,
        };

        let mut seeded = 0u64;
        for (base, pages) in free_ranges {
            seed_run(&mut inner, base, pages);
            seeded += u64::from(pages);
        }
        info!(
            "buddy allocator armed: {seeded} free pages, bitmap {} bytes, node pool {} pages",
            Self::bitmap_bytes(max_pages),
            node_pool_pages,
        );

        Self {
            inner: SpinLock::new(inner),
        }
    }

    /// Allocate a naturally aligned run of `2^rank` pages.
    ///
    /// Splits the closest larger run on demand; returns `None` when no rank
    /// at or above the request has a free run. Never retries.
    #[must_use]
    pub fn alloc_pages(&self, rank: u8) -> Option<PhysicalAddress> {
        assert!((rank as usize) < MAX_RANK);
        self.inner.with_lock(|inner| {
            let mut r = rank as usize;
            while r < MAX_RANK && inner.areas[r].head.is_null() {
                r += 1;
            }
            if r == MAX_RANK {
                return None;
            }

            let base = pop_head(inner, r);
            while r > rank as usize {
                r -= 1;
                push(inner, r, base + (1u32 << r));
            }

            inner.allocated_pages += 1u64 << rank;
            Some(PageIndex::new(base).addr())
        })
    }

    /// Release a run obtained from [`alloc_pages`](Self::alloc_pages) with
    /// the same `rank`, merging with its buddy as long as the buddy is free
    /// at the same rank.
    ///
    /// # Safety
    /// `base` must be the exact address returned by an outstanding
    /// rank-`rank` allocation; double frees corrupt the buddy state.
    pub unsafe fn free_pages(&self, base: PhysicalAddress, rank: u8) {
        assert!((rank as usize) < MAX_RANK);
        assert!(
            base.is_aligned(Size4K::SIZE << rank),
            "run base must be aligned to its rank"
        );

        self.inner.with_lock(|inner| {
            let mut page = base.index().as_u32();
            let mut r = rank as usize;
            // The run being freed is absent from the list, so a set pair
            // bit proves its buddy is free: merge and retry one rank up.
            while r < MAX_RANK - 1 && bit(inner, r, page) {
                let buddy = page ^ (1u32 << r);
                remove(inner, r, buddy);
                page &= !(1u32 << r);
                r += 1;
            }
            push(inner, r, page);
            inner.allocated_pages -= 1u64 << rank;
        });
    }

    /// Pages currently handed out.
    #[must_use]
    pub fn allocated_pages(&self) -> u64 {
        self.inner.with_lock(|inner| inner.allocated_pages)
    }

    /// Number of free runs on the rank-`rank` list (diagnostic).
    #[must_use]
    pub fn free_runs(&self, rank: u8) -> u32 {
        self.inner.with_lock(|inner| {
            let mut count = 0;
            let mut node = inner.areas[rank as usize].head;
            while !node.is_null() {
                // SAFETY: list nodes are valid while linked.
                unsafe {
                    count += 1;
                    node = (*node).next;
                }
            }
            count
        })
    }

    /// The buddy-pair bit covering `base_page` at `rank` (diagnostic).
    #[must_use]
    pub fn pair_bit(&self, rank: u8, base_page: u32) -> bool {
        self.inner.with_lock(|inner| bit(inner, rank as usize, base_page))
    }

    /// Verify the buddy invariant against the free lists, for tests.
    #[cfg(test)]
    fn assert_buddy_invariant(&self, max_pages: u32) {
        self.inner.with_lock(|inner| {
            for rank in 0..MAX_RANK {
                let mut free = std::collections::HashSet::new();
                let mut node = inner.areas[rank].head;
                while !node.is_null() {
                    unsafe {
                        free.insert((*node).base);
                        node = (*node).next;
                    }
                }
                let span = 1u32 << (rank + 1);
                let mut base = 0u32;
                while base < max_pages {
                    let lower_free = free.contains(&base);
                    let upper_free = free.contains(&(base + span / 2));
                    assert_eq!(
                        bit(inner, rank, base),
                        lower_free ^ upper_free,
                        "buddy bit mismatch at rank {rank}, pair base {base}"
                    );
                    base += span;
                }
            }
        });
    }
}

impl FrameSource for BuddyPageAllocator {
    fn alloc_run(&self, rank: u8) -> Option<PhysicalAddress> {
        self.alloc_pages(rank)
    }

    unsafe fn free_run(&self, base: PhysicalAddress, rank: u8) {
        unsafe {
            self.free_pages(base, rank);
        }
    }

    fn window(&self, pa: PhysicalAddress) -> NonNull<u8> {
        let va = kernel_vmem::DirectMap::virt(pa);
        // SAFETY: the window base is far above zero.
        unsafe { NonNull::new_unchecked(va.as_mut_ptr()) }
    }

    fn unwindow(&self, ptr: NonNull<u8>) -> Option<PhysicalAddress> {
        kernel_vmem::DirectMap::phys(kernel_memory_addresses::VirtualAddress::from_ptr(
            ptr.as_ptr(),
        ))
    }
}

/// Bitmap bytes of one rank: one bit per buddy pair, at least one byte.
fn rank_bitmap_bytes(max_pages: u32, rank: usize) -> usize {
    let pairs = (max_pages as usize).div_ceil(1 << (rank + 1));
    pairs.div_ceil(8).max(1)
}

/// Decompose `[base, base + pages)` into maximal naturally aligned
/// power-of-two runs and push each onto its rank's list.
fn seed_run(inner: &mut BuddyInner, mut base: u32, mut pages: u32) {
    while pages != 0 {
        let mut rank = (31 - pages.leading_zeros()) as usize;
        if rank >= MAX_RANK {
            rank = MAX_RANK - 1;
        }
        while base % (1u32 << rank) != 0 {
            rank -= 1;
        }
        push(inner, rank, base);
        base += 1u32 << rank;
        pages -= 1u32 << rank;
    }
}

/// Link a fresh node for `base` onto the rank list and toggle its pair bit.
fn push(inner: &mut BuddyInner, rank: usize, base: u32) {
    let node = inner
        .nodes
        .alloc(&NoGrowth)
        .expect("buddy free-list node pool exhausted")
        .cast::<FreeNode>()
        .as_ptr();
    let area = &mut inner.areas[rank];
    // SAFETY: the node pool hands out exclusively owned, sufficiently sized
    // slots; the current head (if any) is a valid node.
    unsafe {
        node.write(FreeNode {
            base,
            prev: ptr::null_mut(),
            next: area.head,
        });
        if !area.head.is_null() {
            (*area.head).prev = node;
        }
    }
    area.head = node;
    toggle(inner, rank, base);
}

/// Pop the head of the rank list, toggle its pair bit, return its base.
fn pop_head(inner: &mut BuddyInner, rank: usize) -> u32 {
    let node = inner.areas[rank].head;
    debug_assert!(!node.is_null());
    // SAFETY: the head is a valid node while linked.
    let base = unsafe {
        inner.areas[rank].head = (*node).next;
        if !(*node).next.is_null() {
            (*(*node).next).prev = ptr::null_mut();
        }
        (*node).base
    };
    // SAFETY: the node came from this pool and is now unlinked.
    unsafe {
        inner
            .nodes
            .free(&NoGrowth, NonNull::new_unchecked(node.cast()));
    }
    toggle(inner, rank, base);
    base
}

/// Unlink the node with `base` from the rank list and toggle its pair bit.
///
/// The node must exist: its presence was proven by the pair bit.
fn remove(inner: &mut BuddyInner, rank: usize, base: u32) {
    let mut node = inner.areas[rank].head;
    // SAFETY: list nodes are valid while linked.
    unsafe {
        while !node.is_null() && (*node).base != base {
            node = (*node).next;
        }
        assert!(!node.is_null(), "buddy bit set but run {base} not listed");

        let prev = (*node).prev;
        let next = (*node).next;
        if prev.is_null() {
            inner.areas[rank].head = next;
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
        inner
            .nodes
            .free(&NoGrowth, NonNull::new_unchecked(node.cast()));
    }
    toggle(inner, rank, base);
}

fn toggle(inner: &mut BuddyInner, rank: usize, base: u32) {
    let pair = (base >> (1 + rank)) as usize;
    // SAFETY: pair / 8 lies within this rank's bitmap slice.
    unsafe {
        *inner.areas[rank].bitmap.add(pair / 8) ^= 1 << (pair % 8);
    }
}

fn bit(inner: &BuddyInner, rank: usize, base: u32) -> bool {
    let pair = (base >> (1 + rank)) as usize;
    // SAFETY: pair / 8 lies within this rank's bitmap slice.
    unsafe { *inner.areas[rank].bitmap.add(pair / 8) & (1 << (pair % 8)) != 0 }
}
