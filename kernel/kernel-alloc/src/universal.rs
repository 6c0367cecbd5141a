//! # Universal Memory Allocator
//!
//! The front door for arbitrary-size kernel allocations. Small requests
//! (up to half a page) are rounded up to a power-of-two size class and
//! served by a per-class [`ObjectAllocator`]; anything larger becomes a
//! whole page run from the buddy allocator, returned through the
//! direct-mapped window and recorded in a search tree so `free` can
//! recover the run's base and rank from the bare pointer.

use crate::object::{BucketPolicy, ObjectAllocator};
use crate::pool::NodePool;
use crate::{FrameSource, MAX_RANK, ceil_log2};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::{PageSize, Size4K};
use kernel_sync::SpinLock;

/// Smallest size class: `1 << MIN_RANK` = 16 bytes.
pub const MIN_RANK: u32 = 4;

/// Number of small size classes (16 bytes through half a page).
pub const SMALL_RANKS: usize = 8;

/// Largest request served from the object pools.
pub const MAX_SMALL_SIZE: usize = 1 << (MIN_RANK as usize + SMALL_RANKS - 1);

/// One recorded large allocation: the run's base page and rank.
#[repr(C)]
struct TreeNode {
    /// Physical base page of the run; the search key.
    key: u32,
    rank: u8,
    left: *mut TreeNode,
    right: *mut TreeNode,
}

/// Search tree over outstanding large allocations, keyed by base page.
struct LargeAllocs {
    root: *mut TreeNode,
    nodes: NodePool<TreeNode>,
    count: usize,
}

// Safety: the tree is only touched under the universal allocator's lock.
unsafe impl Send for LargeAllocs {}

impl LargeAllocs {
    const fn new() -> Self {
        Self {
            root: ptr::null_mut(),
            nodes: NodePool::new(64),
            count: 0,
        }
    }

    /// Record `(key, rank)`; `None` when the node pool cannot grow.
    fn insert(&mut self, key: u32, rank: u8, backing: &impl FrameSource) -> Option<()> {
        let node = self.nodes.alloc(backing)?;
        // SAFETY: fresh pool slot.
        unsafe {
            node.as_ptr().write(TreeNode {
                key,
                rank,
                left: ptr::null_mut(),
                right: ptr::null_mut(),
            });
        }

        let mut link: *mut *mut TreeNode = &raw mut self.root;
        // SAFETY: tree nodes are valid while linked.
        unsafe {
            while !(*link).is_null() {
                link = if key < (**link).key {
                    &raw mut (**link).left
                } else {
                    &raw mut (**link).right
                };
            }
            *link = node.as_ptr();
        }
        self.count += 1;
        Some(())
    }

    /// Remove the record with `key` and return its rank.
    fn pop(&mut self, key: u32, backing: &impl FrameSource) -> Option<u8> {
        // SAFETY: tree nodes are valid while linked; `link` always points
        // at a live child slot.
        unsafe {
            let mut link: *mut *mut TreeNode = &raw mut self.root;
            while !(*link).is_null() && (**link).key != key {
                link = if key < (**link).key {
                    &raw mut (**link).left
                } else {
                    &raw mut (**link).right
                };
            }
            let node = *link;
            if node.is_null() {
                return None;
            }

            let replacement = if (*node).left.is_null() {
                (*node).right
            } else if (*node).right.is_null() {
                (*node).left
            } else {
                // Two children: detach the successor (minimum of the right
                // subtree) and put it in place.
                let mut min_link: *mut *mut TreeNode = &raw mut (*node).right;
                while !(**min_link).left.is_null() {
                    min_link = &raw mut (**min_link).left;
                }
                let successor = *min_link;
                *min_link = (*successor).right;
                (*successor).left = (*node).left;
                (*successor).right = (*node).right;
                successor
            };
            *link = replacement;

            let rank = (*node).rank;
            self.nodes
                .free(backing, NonNull::new_unchecked(node));
            self.count -= 1;
            Some(rank)
        }
    }
}

/// The universal memory allocator (UMA).
///
/// Internally locked: the per-class pools each carry a spin lock and the
/// large-allocation tree another, so the allocator is shared by reference.
pub struct UniversalAllocator {
    pools: [SpinLock<ObjectAllocator>; SMALL_RANKS],
    large: SpinLock<LargeAllocs>,
    allocated_bytes: AtomicU64,
}

impl UniversalAllocator {
    #[must_use]
    pub fn new() -> Self {
        let pools = core::array::from_fn(|class| {
            let obj_size = 1u32 << (class as u32 + MIN_RANK);
            // One page worth of objects per bucket, but keep buckets of the
            // big classes from degenerating to a couple of slots.
            let mut capacity = Size4K::SIZE as u32 / obj_size;
            if capacity < 16 {
                capacity *= 2;
            }
            SpinLock::new(ObjectAllocator::with_capacity(
                obj_size,
                capacity,
                BucketPolicy::Recycle,
            ))
        });
        Self {
            pools,
            large: SpinLock::new(LargeAllocs::new()),
            allocated_bytes: AtomicU64::new(0),
        }
    }

    /// Allocate `size` bytes.
    ///
    /// Small requests come from the size-class pools; larger ones are a
    /// power-of-two page run, addressed through the window of `mem`.
    /// Returns `None` when the backing memory is exhausted; never retries.
    pub fn alloc(&self, size: usize, mem: &impl FrameSource) -> Option<NonNull<u8>> {
        assert!(size > 0);

        if size > MAX_SMALL_SIZE {
            let pages = (size as u64).div_ceil(Size4K::SIZE);
            let rank = ceil_log2(pages) as u8;
            assert!((rank as usize) < MAX_RANK, "request beyond the largest run");

            let base = mem.alloc_run(rank)?;
            let recorded = self
                .large
                .with_lock(|tree| tree.insert(base.index().as_u32(), rank, mem));
            if recorded.is_none() {
                // SAFETY: the run was just allocated and never exposed.
                unsafe {
                    mem.free_run(base, rank);
                }
                return None;
            }

            self.allocated_bytes
                .fetch_add((1u64 << rank) * Size4K::SIZE, Ordering::Relaxed);
            return Some(mem.window(base));
        }

        let class = (ceil_log2(size as u64).max(MIN_RANK) - MIN_RANK) as usize;
        let ptr = self.pools[class].with_lock(|pool| pool.alloc(mem))?;
        self.allocated_bytes
            .fetch_add(1u64 << (class as u32 + MIN_RANK), Ordering::Relaxed);
        Some(ptr)
    }

    /// Release an allocation returned by [`alloc`](Self::alloc).
    ///
    /// # Panics
    /// A pointer that is neither owned by a size-class pool nor recorded in
    /// the large tree is a kernel bug and fatal.
    ///
    /// # Safety
    /// `ptr` must come from `alloc` on this allocator, over the same `mem`,
    /// and must not be freed twice.
    pub unsafe fn free(&self, ptr: NonNull<u8>, mem: &impl FrameSource) {
        for (class, pool) in self.pools.iter().enumerate() {
            let released = pool.with_lock(|pool| {
                if pool.owns(ptr) {
                    // SAFETY: ownership just verified.
                    unsafe {
                        pool.free(mem, ptr);
                    }
                    true
                } else {
                    false
                }
            });
            if released {
                self.allocated_bytes
                    .fetch_sub(1u64 << (class as u32 + MIN_RANK), Ordering::Relaxed);
                return;
            }
        }

        let pa = mem
            .unwindow(ptr)
            .expect("freed pointer lies outside every pool and the window");
        assert!(
            pa.is_aligned(Size4K::SIZE),
            "large allocations are page aligned"
        );
        let rank = self
            .large
            .with_lock(|tree| tree.pop(pa.index().as_u32(), mem))
            .expect("no record of this large allocation");
        // SAFETY: the record proves this run came from `mem` at `rank`.
        unsafe {
            mem.free_run(pa, rank);
        }
        self.allocated_bytes
            .fetch_sub((1u64 << rank) * Size4K::SIZE, Ordering::Relaxed);
    }

    /// Bytes currently handed out (size-class granularity for small
    /// allocations, whole runs for large ones).
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Outstanding large allocations (diagnostic).
    #[must_use]
    pub fn large_allocs(&self) -> usize {
        self.large.with_lock(|tree| tree.count)
    }
}

impl Default for UniversalAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BuddyPageAllocator;
    use kernel_memory_addresses::PhysicalAddress;
    use std::alloc::{Layout, alloc_zeroed};

    /// Fake physical memory: a host arena addressed by offsets, with a real
    /// buddy allocator handing out the runs.
    struct TestMem {
        arena: *mut u8,
        bytes: usize,
        bpa: BuddyPageAllocator,
    }

    impl TestMem {
        fn new(pages: u32) -> Self {
            let bytes = pages as usize * 4096;
            let arena =
                unsafe { alloc_zeroed(Layout::from_size_align(bytes, 4096).unwrap()) };

            let bitmap_len = BuddyPageAllocator::bitmap_bytes(pages);
            let bitmap = NonNull::new(unsafe {
                alloc_zeroed(Layout::from_size_align(bitmap_len, 8).unwrap())
            })
            .unwrap();
            let pool_pages = BuddyPageAllocator::node_pool_pages(pages);
            let pool = NonNull::new(unsafe {
                alloc_zeroed(Layout::from_size_align(pool_pages as usize * 4096, 4096).unwrap())
            })
            .unwrap();
            let bpa = unsafe {
                BuddyPageAllocator::new(pages, bitmap, pool, pool_pages, [(0, pages)].into_iter())
            };
            Self { arena, bytes, bpa }
        }
    }

    impl FrameSource for TestMem {
        fn alloc_run(&self, rank: u8) -> Option<PhysicalAddress> {
            self.bpa.alloc_pages(rank)
        }

        unsafe fn free_run(&self, base: PhysicalAddress, rank: u8) {
            unsafe { self.bpa.free_pages(base, rank) }
        }

        fn window(&self, pa: PhysicalAddress) -> NonNull<u8> {
            assert!((pa.as_u64() as usize) < self.bytes);
            NonNull::new(unsafe { self.arena.add(pa.as_u64() as usize) }).unwrap()
        }

        fn unwindow(&self, ptr: NonNull<u8>) -> Option<PhysicalAddress> {
            let offset = (ptr.as_ptr() as usize).checked_sub(self.arena as usize)?;
            (offset < self.bytes).then(|| PhysicalAddress::new(offset as u64))
        }
    }

    #[test]
    fn large_allocation_round_trip() {
        // Three pages round up to a rank-2 run of four.
        let mem = TestMem::new(256);
        let uma = UniversalAllocator::new();
        let before = uma.allocated_bytes();

        let ptr = uma.alloc(3 * 4096, &mem).expect("alloc");
        assert_eq!(uma.large_allocs(), 1);
        assert_eq!(uma.allocated_bytes(), before + 4 * 4096);
        assert_eq!(mem.bpa.allocated_pages(), 4);

        // The pointer is the window address of a rank-aligned run.
        let pa = mem.unwindow(ptr).unwrap();
        assert!(pa.is_aligned(4 * 4096));

        unsafe { uma.free(ptr, &mem) };
        assert_eq!(uma.large_allocs(), 0);
        assert_eq!(uma.allocated_bytes(), before);
        assert_eq!(mem.bpa.allocated_pages(), 0);
    }

    #[test]
    fn small_requests_route_to_their_size_class() {
        let mem = TestMem::new(256);
        let uma = UniversalAllocator::new();

        let p24 = uma.alloc(24, &mem).expect("alloc 24");
        assert_eq!(uma.allocated_bytes(), 32, "rounded to the 32-byte class");

        let p500 = uma.alloc(500, &mem).expect("alloc 500");
        assert_eq!(uma.allocated_bytes(), 32 + 512);

        // The backing region is writable through the returned pointers.
        unsafe {
            ptr::write_bytes(p24.as_ptr(), 0xAB, 24);
            ptr::write_bytes(p500.as_ptr(), 0xCD, 500);
            assert_eq!(*p24.as_ptr(), 0xAB);
        }

        unsafe {
            uma.free(p24, &mem);
            uma.free(p500, &mem);
        }
        assert_eq!(uma.allocated_bytes(), 0);
        assert_eq!(uma.large_allocs(), 0);
    }

    #[test]
    fn boundary_sizes_route_each_way() {
        let mem = TestMem::new(256);
        let uma = UniversalAllocator::new();

        let small = uma.alloc(MAX_SMALL_SIZE, &mem).expect("small side");
        assert_eq!(uma.large_allocs(), 0);

        let large = uma.alloc(MAX_SMALL_SIZE + 1, &mem).expect("large side");
        assert_eq!(uma.large_allocs(), 1);
        assert_eq!(
            uma.allocated_bytes(),
            MAX_SMALL_SIZE as u64 + Size4K::SIZE
        );

        unsafe {
            uma.free(small, &mem);
            uma.free(large, &mem);
        }
        assert_eq!(uma.allocated_bytes(), 0);
    }

    #[test]
    fn many_large_allocs_keep_distinct_records() {
        let mem = TestMem::new(1024);
        let uma = UniversalAllocator::new();

        let mut ptrs = Vec::new();
        for i in 0..12usize {
            let pages = 2 + (i % 5);
            ptrs.push(uma.alloc(pages * 4096, &mem).expect("alloc"));
        }
        assert_eq!(uma.large_allocs(), 12);

        // Free in a shuffled order to exercise all tree-removal shapes.
        for index in [5usize, 0, 11, 3, 8, 1, 10, 2, 7, 4, 9, 6] {
            let ptr = ptrs[index];
            unsafe { uma.free(ptr, &mem) };
        }
        assert_eq!(uma.large_allocs(), 0);
        assert_eq!(uma.allocated_bytes(), 0);
        assert_eq!(mem.bpa.allocated_pages(), 0);
    }

    #[test]
    #[should_panic(expected = "no record")]
    fn unknown_window_pointer_is_fatal() {
        let mem = TestMem::new(64);
        let uma = UniversalAllocator::new();
        let inside = mem.window(PhysicalAddress::new(8 * 4096));
        unsafe { uma.free(inside, &mem) };
    }

    #[test]
    fn object_pools_grow_and_shrink_through_the_buddy() {
        let mem = TestMem::new(256);
        let uma = UniversalAllocator::new();
        let idle_pages = mem.bpa.allocated_pages();

        let mut ptrs = Vec::new();
        for _ in 0..600 {
            ptrs.push(uma.alloc(16, &mem).expect("alloc"));
        }
        assert!(mem.bpa.allocated_pages() > idle_pages);

        for ptr in ptrs.drain(..) {
            unsafe { uma.free(ptr, &mem) };
        }
        assert_eq!(uma.allocated_bytes(), 0);
        // All but at most one bucket per touched pool went back.
        assert!(mem.bpa.allocated_pages() <= idle_pages + 2);
    }
}
