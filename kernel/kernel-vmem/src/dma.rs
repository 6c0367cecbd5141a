use crate::PhysMapper;
use kernel_info::layout::{DMA_BASE, DMA_SIZE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// The direct-mapped window: `[0, DMA_SIZE)` of physical memory visible at
/// `DMA_BASE + pa`.
///
/// Once the kernel address space is live, every physical frame the
/// allocators hand out is readable and writable through this window, which
/// makes phys↔virt translation for kernel-owned memory plain arithmetic.
pub struct DirectMap;

impl DirectMap {
    /// The window address of physical address `pa`.
    ///
    /// Debug-asserts that `pa` lies below the window size.
    #[inline]
    #[must_use]
    pub const fn virt(pa: PhysicalAddress) -> VirtualAddress {
        debug_assert!(pa.as_u64() < DMA_SIZE);
        VirtualAddress::new(DMA_BASE + pa.as_u64())
    }

    /// The physical address behind a window address, or `None` when `va`
    /// lies outside the window.
    #[inline]
    #[must_use]
    pub const fn phys(va: VirtualAddress) -> Option<PhysicalAddress> {
        if Self::contains(va) {
            Some(PhysicalAddress::new(va.as_u64() - DMA_BASE))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn contains(va: VirtualAddress) -> bool {
        va.as_u64() >= DMA_BASE && va.as_u64() < DMA_BASE + DMA_SIZE
    }
}

impl PhysMapper for DirectMap {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: the window maps all of `[0, DMA_SIZE)` writable; the
        // caller vouches for the type and exclusivity.
        unsafe { &mut *Self::virt(pa).as_mut_ptr::<T>() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_arithmetic() {
        let pa = PhysicalAddress::new(0x1234_5678);
        let va = DirectMap::virt(pa);
        assert_eq!(va.as_u64(), DMA_BASE + 0x1234_5678);
        assert_eq!(DirectMap::phys(va), Some(pa));
        assert_eq!(DirectMap::phys(VirtualAddress::new(0x1000)), None);
    }
}
