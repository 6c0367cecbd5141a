//! # Architectural pre-init (x86-64)
//!
//! The little that must happen before the virtual-memory bootstrap can run:
//! enable the execute-disable bit, graft the direct-mapped window into the
//! loader's page table, and rebase the GDT through that window so the
//! loader's low-memory tables stay reachable after the switch.

use kernel_info::layout::{DMA_BASE, DMA_SIZE};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size1G, Size4K,
    VirtualAddress};
use kernel_vmem::{Level, PageEntry, PageTable, PhysMapper, VmFlags};
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use kernel_alloc::BootMemMap;
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use kernel_registers::{ReadRegister, WriteRegister, cr3::Cr3, cr4::Cr4, desc, efer::Efer, tlb};
use core::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PreinitError {
    #[error("early allocation for the window's level-3 table failed")]
    EarlyAllocFailed,
}

/// Released by the BSP once the memory subsystems are online.
static BSP_READY: AtomicBool = AtomicBool::new(false);

/// Identity view used while the loader's 1:1 mapping of low memory is still
/// active.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
struct IdentityMapper;

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl PhysMapper for IdentityMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: only used during pre-init, under the loader's identity
        // mapping of the memory the early allocator hands out.
        unsafe { &mut *(pa.as_u64() as *mut T) }
    }
}

/// Write the direct-mapped window into `root`: one top-level slot pointing
/// at `l3_frame`, which is filled with 512 global, writable, no-execute
/// 1 GiB leaves covering `[0, DMA_SIZE)`.
pub fn build_dma_window(
    mapper: &impl PhysMapper,
    root: PhysicalPage<Size4K>,
    l3_frame: PhysicalPage<Size4K>,
) {
    // SAFETY: both frames are exclusively ours and reachable through the
    // mapper.
    let l3 = unsafe { mapper.phys_to_mut::<PageTable>(l3_frame.base()) };
    l3.zero();
    let flags = VmFlags::WRITE | VmFlags::GLOBAL;
    for i in 0..(DMA_SIZE / Size1G::SIZE) as usize {
        let pa = PhysicalAddress::new(i as u64 * Size1G::SIZE);
        l3.set(i, PageEntry::leaf(pa, flags, true));
    }

    // SAFETY: as above.
    let l4 = unsafe { mapper.phys_to_mut::<PageTable>(root.base()) };
    let slot = Level::L4.index_of(VirtualAddress::new(DMA_BASE));
    l4.set_release(slot, PageEntry::table(l3_frame, VmFlags::WRITE));
}

/// Pre-init on the bootstrap processor.
///
/// Enables `EFER.NXE` (page-table entries carry the execute-disable bit
/// from the first mapping on), turns on global pages and SSE state bits in
/// CR4, builds the early direct-mapped window with one page from the early
/// allocator, and rebases the GDT into the window.
///
/// # Errors
/// [`PreinitError::EarlyAllocFailed`] when the memory map cannot spare one
/// page; fatal for the caller.
///
/// # Safety
/// Must run once, on the BSP, at CPL0, while the loader's identity mapping
/// is still active.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub unsafe fn preinit(early: &mut BootMemMap) -> Result<(), PreinitError> {
    // SAFETY (throughout): CPL0 per the caller contract.
    unsafe {
        Efer::read().with_nxe(true).write();
        Cr4::read()
            .with_pge(true)
            .with_osfxsr(true)
            .with_osxmmexcpt(true)
            .write();
    }

    let l3_phys = early.alloc(1).ok_or(PreinitError::EarlyAllocFailed)?;
    let root = unsafe { Cr3::read() }.root();
    build_dma_window(&IdentityMapper, root, l3_phys.page());
    unsafe {
        tlb::flush_all();
    }

    // The GDT stays at its physical location but is addressed through the
    // window from now on, surviving the removal of the identity mapping.
    unsafe {
        let gdtr = desc::sgdt();
        desc::lgdt(&gdtr.rebased(DMA_BASE));
    }

    Ok(())
}

/// Index of the executing logical processor.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[must_use]
pub fn cpu_index() -> u32 {
    kernel_registers::cpuid::cpu_index()
}

/// Park an application processor until the BSP finished memory bring-up.
pub fn wait_for_bsp() {
    while !BSP_READY.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }
}

/// Let the application processors continue; called by the BSP after
/// [`vm::init`](crate::vm::init).
pub fn release_aps() {
    BSP_READY.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::UnsafeCell;
    use kernel_vmem::EntryKind;

    #[repr(align(4096))]
    struct Frame(UnsafeCell<[u8; 4096]>);

    struct TestPhys {
        frames: Vec<Frame>,
    }

    impl TestPhys {
        fn new(frames: usize) -> Self {
            let mut v = Vec::with_capacity(frames);
            v.resize_with(frames, || Frame(UnsafeCell::new([0; 4096])));
            Self { frames: v }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            unsafe { &mut *self.frames[idx].0.get().cast::<T>() }
        }
    }

    #[test]
    fn window_fills_one_top_level_slot_with_giant_leaves() {
        let phys = TestPhys::new(2);
        let root = PhysicalPage::from_base(PhysicalAddress::zero());
        let l3 = PhysicalPage::from_base(PhysicalAddress::new(4096));

        build_dma_window(&phys, root, l3);

        let l4 = unsafe { phys.phys_to_mut::<PageTable>(root.base()) };
        let slot = Level::L4.index_of(VirtualAddress::new(DMA_BASE));
        assert_eq!(slot, 256, "window starts at the first higher-half slot");
        match l4.get(slot).kind(Level::L4) {
            EntryKind::Table(page) => assert_eq!(page, l3),
            other => panic!("expected a table link, got {other:?}"),
        }
        // No other slot was touched.
        for i in (0..512).filter(|&i| i != slot) {
            assert!(!l4.get(i).present());
        }

        let l3_table = unsafe { phys.phys_to_mut::<PageTable>(l3.base()) };
        for i in 0..512 {
            let entry = l3_table.get(i);
            assert!(entry.present() && entry.large() && entry.global());
            assert!(entry.writable() && entry.no_execute());
            assert_eq!(entry.addr().as_u64(), i as u64 * Size1G::SIZE);
        }
    }
}
