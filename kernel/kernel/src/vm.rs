//! # Virtual-memory bring-up and kernel allocation surface
//!
//! Ties the allocators and the mapper together, in the only order that
//! works:
//!
//! 1. parse the memory map; it doubles as the early allocator;
//! 2. carve the page-table pool out of it (the mapper needs tables before
//!    any allocator exists);
//! 3. build the kernel address space from the bootstrap mappings and
//!    switch to it — the direct-mapped window is live from here on;
//! 4. carve the buddy allocator's bitmap and node-pool backing out of the
//!    map, then seed the buddy allocator with everything still free;
//! 5. arm the heap and the universal allocator.
//!
//! The bootstrap pools stay pinned forever; every later growth of any pool
//! goes through the buddy allocator and the window.

use crate::boot;
use core::ptr::NonNull;
use kernel_alloc::object::{BucketPolicy, ObjectAllocator};
use kernel_alloc::{BootMemMap, BuddyPageAllocator, NoGrowth, UniversalAllocator, VirtHeap};
use kernel_info::handoff::Handoff;
use kernel_info::layout::KERNEL_HEAP_BASE;
use kernel_memory_addresses::{
    PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, pages_for,
};
use kernel_sync::{SpinLock, SyncOnceCell};
use kernel_vmem::{AddressSpace, DirectMap, MapError, PtAlloc, VmFlags};
use log::{info, warn};

/// Pages reserved for the bootstrap page-table pool (enough tables to map
/// the kernel image, the window and a good amount of early traffic).
const PT_POOL_PAGES: u32 = 512;

static DMA: DirectMap = DirectMap;

static BPA: SyncOnceCell<BuddyPageAllocator> = SyncOnceCell::new();
static TABLE_POOL: SyncOnceCell<SpinLock<TablePool>> = SyncOnceCell::new();
static KERNEL_SPACE: SyncOnceCell<AddressSpace<'static, DirectMap>> = SyncOnceCell::new();
static HEAP: SyncOnceCell<SpinLock<VirtHeap>> = SyncOnceCell::new();
static UMA: SyncOnceCell<UniversalAllocator> = SyncOnceCell::new();
/// What was left of the map after bring-up; kept for introspection.
static MEM_MAP: SyncOnceCell<BootMemMap> = SyncOnceCell::new();

/// The page-table frame source: an object pool of table-sized objects,
/// pinned (table pages are never handed back while mappings may reference
/// them), growing through the buddy allocator once it is armed.
struct TablePool {
    oma: ObjectAllocator,
}

impl TablePool {
    fn alloc_slot(&mut self) -> Option<NonNull<u8>> {
        match BPA.get() {
            Some(bpa) => self.oma.alloc(bpa),
            None => self.oma.alloc(&NoGrowth),
        }
    }
}

impl PtAlloc for TablePool {
    fn alloc_table(&mut self) -> Option<PhysicalPage<Size4K>> {
        let slot = self.alloc_slot()?;
        let pa = DirectMap::phys(VirtualAddress::from_ptr(slot.as_ptr()))?;
        Some(pa.page())
    }

    unsafe fn free_table(&mut self, page: PhysicalPage<Size4K>) {
        let va = DirectMap::virt(page.base());
        // SAFETY: table slots are window addresses, far above zero.
        let slot = unsafe { NonNull::new_unchecked(va.as_mut_ptr()) };
        // SAFETY: the frame came from this pool.
        unsafe {
            match BPA.get() {
                Some(bpa) => self.oma.free(bpa, slot),
                None => self.oma.free(&NoGrowth, slot),
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmInitError {
    #[error("the loader provided an empty memory map")]
    EmptyMemoryMap,
    #[error("early allocation of {0} pages failed")]
    EarlyAllocFailed(u32),
    #[error("failed to map {0:#018x}: {1}")]
    Map(u64, MapError),
    #[error("virtual memory is already initialized")]
    AlreadyInitialized,
}

/// Bring the virtual-memory core online. See the module docs for the
/// sequence.
///
/// # Errors
/// All errors are fatal during bring-up; the entry point panics on them.
///
/// # Safety
/// Must run once, on the BSP, after [`arch::preinit`](crate::arch::preinit)
/// (the window must be reachable). `handoff` must be the loader's valid
/// handoff record.
pub unsafe fn init(handoff: &Handoff) -> Result<(), VmInitError> {
    // SAFETY: handoff validity per the caller contract.
    let mut mem_map = unsafe { boot::parse_mem_map(handoff) };
    if mem_map.is_empty() {
        return Err(VmInitError::EmptyMemoryMap);
    }
    mem_map.log_summary();

    // Bootstrap page-table pool, straight from the early allocator.
    let pool_phys = mem_map
        .alloc(PT_POOL_PAGES)
        .ok_or(VmInitError::EarlyAllocFailed(PT_POOL_PAGES))?;
    // SAFETY: freshly carved pages, reached through the early window.
    let oma = unsafe {
        ObjectAllocator::from_raw_pool(
            size_of::<kernel_vmem::PageTable>() as u32,
            NonNull::new_unchecked(DirectMap::virt(pool_phys).as_mut_ptr()),
            PT_POOL_PAGES,
            BucketPolicy::Pinned,
        )
    };
    let mut table_pool = TablePool { oma };

    // The kernel address space, rebuilt from the bootstrap mappings.
    let space =
        AddressSpace::new(&DMA, &mut table_pool).map_err(|e| VmInitError::Map(0, e))?;
    for mapping in boot::bootstrap_mappings(handoff) {
        space
            .map(
                &mut table_pool,
                mapping.virt,
                mapping.phys,
                mapping.pages.into(),
                mapping.flags,
            )
            .map_err(|e| VmInitError::Map(mapping.virt.as_u64(), e))?;
    }

    #[cfg(all(feature = "asm", target_arch = "x86_64"))]
    // SAFETY: the space maps the kernel image, the stack and the window.
    unsafe {
        space.activate();
    }

    // Arm the buddy allocator over what is still free. Its bitmap and node
    // pool are the last early allocations; the pages never return.
    let max_pages = mem_map.page_count();
    let bitmap_pages = pages_for(BuddyPageAllocator::bitmap_bytes(max_pages) as u64) as u32;
    let node_pages = BuddyPageAllocator::node_pool_pages(max_pages);
    let bitmap_phys = mem_map
        .alloc(bitmap_pages)
        .ok_or(VmInitError::EarlyAllocFailed(bitmap_pages))?;
    let node_phys = mem_map
        .alloc(node_pages)
        .ok_or(VmInitError::EarlyAllocFailed(node_pages))?;
    // SAFETY: exclusively carved backing, sized by the helpers above.
    let bpa = unsafe {
        BuddyPageAllocator::new(
            max_pages,
            NonNull::new_unchecked(DirectMap::virt(bitmap_phys).as_mut_ptr()),
            NonNull::new_unchecked(DirectMap::virt(node_phys).as_mut_ptr()),
            node_pages,
            mem_map.free_ranges(),
        )
    };

    BPA.set(bpa).map_err(|_| VmInitError::AlreadyInitialized)?;
    TABLE_POOL
        .set(SpinLock::new(table_pool))
        .map_err(|_| VmInitError::AlreadyInitialized)?;
    KERNEL_SPACE
        .set(space)
        .map_err(|_| VmInitError::AlreadyInitialized)?;
    HEAP.set(SpinLock::new(VirtHeap::new(VirtualAddress::new(
        KERNEL_HEAP_BASE,
    ))))
    .map_err(|_| VmInitError::AlreadyInitialized)?;
    UMA.set(UniversalAllocator::new())
        .map_err(|_| VmInitError::AlreadyInitialized)?;
    MEM_MAP
        .set(mem_map)
        .map_err(|_| VmInitError::AlreadyInitialized)?;

    info!("virtual memory online; kernel heap at {KERNEL_HEAP_BASE:#018x}");
    Ok(())
}

/// The memory map as it looked when bring-up finished (early allocations
/// already carved out). Read-only from here on.
#[must_use]
pub fn mem_map() -> Option<&'static BootMemMap> {
    MEM_MAP.get()
}

/// The kernel address space, once armed.
#[must_use]
pub fn kernel_space() -> Option<&'static AddressSpace<'static, DirectMap>> {
    KERNEL_SPACE.get()
}

/// The buddy allocator, once armed.
#[must_use]
pub fn frames() -> Option<&'static BuddyPageAllocator> {
    BPA.get()
}

/// Map `pages` pages at `virt -> phys` into the kernel address space.
///
/// # Errors
/// Forwards [`MapError`]; partial state remains, see
/// [`AddressSpace::map`].
pub fn mmap(
    virt: VirtualAddress,
    phys: PhysicalAddress,
    pages: u64,
    flags: VmFlags,
) -> Result<VirtualAddress, MapError> {
    let space = KERNEL_SPACE.get().expect("virtual memory is not online");
    TABLE_POOL
        .get()
        .expect("virtual memory is not online")
        .with_lock(|pool| space.map(pool, virt, phys, pages, flags))?;
    Ok(virt)
}

/// Unmap `pages` pages at `virt` from the kernel address space. TLB
/// invalidation stays with the caller.
pub fn unmap(virt: VirtualAddress, pages: u64) {
    let space = KERNEL_SPACE.get().expect("virtual memory is not online");
    TABLE_POOL
        .get()
        .expect("virtual memory is not online")
        .with_lock(|_| space.unmap(virt, pages));
}

/// Map a physical device-register range and return its virtual address.
///
/// The range comes from the kernel heap and is mapped writable, uncached
/// and global. Returns `None` on mapping failure.
#[must_use]
pub fn mmio(phys: PhysicalAddress, pages: u32) -> Option<VirtualAddress> {
    assert!(pages > 0);
    assert!(phys.is_aligned(4096), "device ranges are page aligned");

    let bpa = BPA.get()?;
    let heap = HEAP.get()?;
    let virt = heap.with_lock(|heap| heap.reserve(pages, bpa));
    match mmap(virt, phys, pages.into(), VmFlags::mmio()) {
        Ok(virt) => Some(virt),
        Err(err) => {
            warn!("mmio mapping of {phys} failed: {err}");
            heap.with_lock(|heap| heap.release(virt, pages, bpa));
            None
        }
    }
}

/// Release a device mapping obtained from [`mmio`].
///
/// Lazy: only the address range is returned to the heap; the page-table
/// entries stay until the next mapping of the range overwrites them.
/// Callers must not touch the range after this.
///
/// # Safety
/// `virt` and `pages` must describe exactly one outstanding [`mmio`]
/// mapping.
pub unsafe fn unmmio(virt: VirtualAddress, pages: u32) {
    let bpa = BPA.get().expect("virtual memory is not online");
    HEAP.get()
        .expect("virtual memory is not online")
        .with_lock(|heap| heap.release(virt, pages, bpa));
}

/// Allocate `size` bytes through the universal allocator.
///
/// `None` before [`init`] or when memory is exhausted.
#[must_use]
pub fn kalloc(size: usize) -> Option<NonNull<u8>> {
    let bpa = BPA.get()?;
    UMA.get()?.alloc(size, bpa)
}

/// Release an allocation from [`kalloc`].
///
/// # Safety
/// `ptr` must come from [`kalloc`] and not be freed twice.
pub unsafe fn kfree(ptr: NonNull<u8>) {
    let bpa = BPA.get().expect("virtual memory is not online");
    let uma = UMA.get().expect("virtual memory is not online");
    // SAFETY: forwarded caller contract.
    unsafe {
        uma.free(ptr, bpa);
    }
}

/// Bytes currently handed out by the universal allocator.
#[must_use]
pub fn allocated_bytes() -> u64 {
    UMA.get().map_or(0, UniversalAllocator::allocated_bytes)
}

/// Window translation: the virtual address of a kernel-owned frame.
#[must_use]
pub const fn virt_dma(phys: PhysicalAddress) -> VirtualAddress {
    DirectMap::virt(phys)
}

/// Window translation back: the physical address behind a window address.
#[must_use]
pub const fn phys_dma(virt: VirtualAddress) -> Option<PhysicalAddress> {
    DirectMap::phys(virt)
}
