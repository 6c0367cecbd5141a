//! # Virtual Memory
//!
//! Four-level x86-64 paging for the kernel: architectural entries, typed
//! tables, the address-space mapper and the direct-mapped window.
//!
//! ## Translation walk
//!
//! A canonical 48-bit virtual address indexes four levels of 512-entry
//! tables:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L4   |  L3   |  L2   |  L1   | Offset |
//! ```
//!
//! A walk terminates at L1, or earlier at L2 / L3 when the entry has the
//! size bit set (2 MiB / 1 GiB leaf).
//!
//! ## Seams
//!
//! Two small traits keep the mapper independent of the allocators that feed
//! it (and make it testable on a host):
//!
//! - [`PhysMapper`] turns a physical address into a pointer the CPU can
//!   dereference right now (identity map early, the direct-mapped window
//!   later, a fake RAM array in tests).
//! - [`PtAlloc`] provides and reclaims the 4 KiB frames backing page
//!   tables; in the kernel this is the dedicated page-table object pool.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod dma;
mod entry;
mod flags;
mod space;
mod table;

pub use dma::DirectMap;
pub use entry::{EntryKind, PageEntry};
pub use flags::VmFlags;
pub use space::{AddressSpace, MapError};
pub use table::{ENTRY_COUNT, Level, PageTable};

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Converts physical addresses into pointers usable in the current address
/// space.
///
/// # Safety
/// Implementations promise that the returned reference aliases the physical
/// bytes at `pa` and stays valid for `'a`; callers promise `T` matches those
/// bytes and that aliasing rules are upheld.
pub trait PhysMapper {
    /// A mutable view of the bytes at physical address `pa`.
    ///
    /// # Safety
    /// `pa` must be mapped writable in the current address space and the
    /// caller must not create overlapping views.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Source of 4 KiB frames for page tables.
///
/// Frames are not required to come back zeroed; the mapper clears them
/// before linking.
pub trait PtAlloc {
    /// Allocate one table frame, or `None` when the pool is exhausted.
    fn alloc_table(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a table frame.
    ///
    /// # Safety
    /// No live page-table entry may still reference the frame.
    unsafe fn free_table(&mut self, page: PhysicalPage<Size4K>);
}
