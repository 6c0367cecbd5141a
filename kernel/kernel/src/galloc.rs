//! # Global allocator adapter
//!
//! Lets `alloc`-crate consumers (collections, `Box`, `Arc`) draw from the
//! universal allocator. Installed as the global allocator only for
//! bare-metal builds; hosted test builds keep the std allocator.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

/// The kernel's global allocator, backed by [`vm::kalloc`](crate::vm::kalloc).
pub struct KernelAllocator;

#[cfg(all(not(test), target_os = "none"))]
#[global_allocator]
static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Size classes are power-of-two sized and aligned; allocating
        // max(size, align) guarantees the layout's alignment. Large
        // allocations are naturally aligned whole runs.
        let size = layout.size().max(layout.align()).max(1);
        crate::vm::kalloc(size).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: the pointer came from `alloc` above.
            unsafe {
                crate::vm::kfree(ptr);
            }
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            // SAFETY: a successful allocation covers `layout.size()` bytes.
            unsafe {
                ptr::write_bytes(ptr, 0, layout.size());
            }
        }
        ptr
    }
}
