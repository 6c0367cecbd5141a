//! # Boot facade
//!
//! Everything the kernel takes over from the loader: the physical memory
//! map, the mappings the new address space must reproduce before the
//! switch, the framebuffer and the embedded debug-symbol table.

use kernel_alloc::BootMemMap;
use kernel_info::handoff::{DebugTableHeader, FramebufferInfo, Handoff, RawMapEntry};
use kernel_info::layout::{BOOT_STACK_BASE, DMA_BASE, DMA_SIZE, KERNEL_BASE};
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress, pages_for};
use kernel_vmem::{DirectMap, VmFlags};

/// One mapping the kernel address space must contain from the start.
#[derive(Copy, Clone, Debug)]
pub struct BootMapping {
    pub phys: PhysicalAddress,
    pub virt: VirtualAddress,
    pub pages: u32,
    pub flags: VmFlags,
}

/// Parse the loader's memory map out of the handoff.
///
/// # Safety
/// `handoff.mmap_ptr` must point at `handoff.mmap_len` valid
/// [`RawMapEntry`] records, readable at their physical address (the loader
/// identity-maps them; after the switch they are reachable through the
/// window).
#[must_use]
pub unsafe fn parse_mem_map(handoff: &Handoff) -> BootMemMap {
    // SAFETY: forwarded caller contract.
    let raw = unsafe {
        core::slice::from_raw_parts(
            handoff.mmap_ptr as *const RawMapEntry,
            handoff.mmap_len as usize,
        )
    };
    BootMemMap::from_raw(raw)
}

/// The mappings the fresh kernel address space starts from: kernel image,
/// bootstrap stack, direct-mapped window and framebuffer.
///
/// Consumed once by [`vm::init`](crate::vm::init).
#[must_use]
pub fn bootstrap_mappings(handoff: &Handoff) -> [BootMapping; 4] {
    let fb = &handoff.framebuffer;
    [
        // The kernel image keeps its linked address.
        BootMapping {
            phys: PhysicalAddress::new(handoff.kernel_phys),
            virt: VirtualAddress::new(KERNEL_BASE),
            pages: handoff.kernel_pages,
            flags: VmFlags::WRITE | VmFlags::EXEC | VmFlags::GLOBAL,
        },
        // The bootstrap stack moves to its dedicated slot.
        BootMapping {
            phys: PhysicalAddress::new(handoff.stack_phys),
            virt: VirtualAddress::new(BOOT_STACK_BASE),
            pages: handoff.stack_pages,
            flags: VmFlags::WRITE | VmFlags::GLOBAL,
        },
        // All of physical memory behind the window, in giant leaves.
        BootMapping {
            phys: PhysicalAddress::zero(),
            virt: VirtualAddress::new(DMA_BASE),
            pages: (DMA_SIZE >> Size4K::SHIFT) as u32,
            flags: VmFlags::WRITE | VmFlags::GLOBAL | VmFlags::LARGE,
        },
        // The framebuffer is device memory: refine its window pages to
        // uncached.
        BootMapping {
            phys: fb.base_addr(),
            virt: DirectMap::virt(fb.base_addr()),
            pages: pages_for(fb.len()) as u32,
            flags: VmFlags::WRITE | VmFlags::GLOBAL | VmFlags::CACHE_DISABLE,
        },
    ]
}

/// Framebuffer geometry as handed over by the loader.
#[must_use]
pub fn framebuffer(handoff: &Handoff) -> FramebufferInfo {
    handoff.framebuffer
}

/// Logical processors started by the loader.
#[must_use]
pub fn cpu_count(handoff: &Handoff) -> u32 {
    handoff.cpu_count.max(1)
}

/// Find the debug-symbol table inside the module image, if present.
///
/// The table announces itself with two magic words at an arbitrary byte
/// offset; the loader does not align it.
#[must_use]
pub fn find_debug_table(modules: &[u8]) -> Option<usize> {
    if modules.len() < 8 {
        return None;
    }
    (0..=modules.len() - 8).find(|&offset| {
        let first = u32::from_le_bytes(modules[offset..offset + 4].try_into().unwrap_or_default());
        let second =
            u32::from_le_bytes(modules[offset + 4..offset + 8].try_into().unwrap_or_default());
        first == DebugTableHeader::MAGIC && second == DebugTableHeader::MAGIC2
    })
}

/// The debug-symbol table of the loaded module region, if any.
///
/// # Safety
/// Must be called after the window is live; `handoff.modules_ptr` and
/// `modules_len` must describe the module image in physical memory.
#[must_use]
pub unsafe fn debug_table(handoff: &Handoff) -> Option<&'static DebugTableHeader> {
    if handoff.modules_len == 0 {
        return None;
    }
    let base = DirectMap::virt(PhysicalAddress::new(handoff.modules_ptr));
    // SAFETY: forwarded caller contract; the window covers the module image.
    let bytes = unsafe {
        core::slice::from_raw_parts(base.as_ptr::<u8>(), handoff.modules_len as usize)
    };
    let offset = find_debug_table(bytes)?;
    // SAFETY: the header magic was just verified at this offset.
    Some(unsafe { &*base.add_bytes(offset as u64).as_ptr::<DebugTableHeader>() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::handoff::ColorFormat;

    fn handoff() -> Handoff {
        Handoff::new(
            0,
            0,
            0,
            0,
            0x20_0000,
            512,
            4,
            0x80_0000,
            4,
            FramebufferInfo {
                base: 0xFD00_0000,
                scanline: 1024 * 4,
                width: 1024,
                height: 768,
                format: ColorFormat::Bgra,
            },
        )
    }

    #[test]
    fn bootstrap_mappings_cover_the_layout() {
        let mappings = bootstrap_mappings(&handoff());

        assert_eq!(mappings[0].virt.as_u64(), KERNEL_BASE);
        assert_eq!(mappings[0].phys.as_u64(), 0x20_0000);
        assert!(mappings[0].flags.contains(VmFlags::EXEC));

        assert_eq!(mappings[1].virt.as_u64(), BOOT_STACK_BASE);
        assert!(!mappings[1].flags.contains(VmFlags::EXEC));

        assert_eq!(mappings[2].virt.as_u64(), DMA_BASE);
        assert_eq!(u64::from(mappings[2].pages) * 4096, DMA_SIZE);
        assert!(mappings[2].flags.contains(VmFlags::LARGE));

        assert_eq!(mappings[3].virt.as_u64(), DMA_BASE + 0xFD00_0000);
        assert_eq!(mappings[3].pages, 768);
        assert!(mappings[3].flags.contains(VmFlags::CACHE_DISABLE));
    }

    #[test]
    fn debug_table_scan_finds_the_magic_pair() {
        let mut image = vec![0u8; 256];
        image[100..104].copy_from_slice(&DebugTableHeader::MAGIC.to_le_bytes());
        image[104..108].copy_from_slice(&DebugTableHeader::MAGIC2.to_le_bytes());
        assert_eq!(find_debug_table(&image), Some(100));
    }

    #[test]
    fn debug_table_scan_rejects_half_magic() {
        let mut image = vec![0u8; 64];
        image[0..4].copy_from_slice(&DebugTableHeader::MAGIC.to_le_bytes());
        assert_eq!(find_debug_table(&image), None);
        assert_eq!(find_debug_table(&[]), None);
    }
}
