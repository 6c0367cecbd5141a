use crate::{ReadRegister, WriteRegister};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// CR3 — root of the page-table tree (PCID disabled).
///
/// Carries the physical base of the top-level table plus the cache policy
/// used when the CPU walks it.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct Cr3 {
    #[bits(3)]
    __: u8,

    /// Bit 3 — PWT: write-through caching for top-level table walks.
    pub pwt: bool,

    /// Bit 4 — PCD: cache disable for top-level table walks.
    pub pcd: bool,

    #[bits(7)]
    __: u8,

    /// Bits 12–51 — physical base of the top-level table, shifted right
    /// by 12.
    #[bits(40)]
    root_4k: u64,

    #[bits(12)]
    __: u16,
}

impl Cr3 {
    /// A CR3 value pointing at `root` with default (write-back) caching.
    #[must_use]
    pub const fn with_root(root: PhysicalPage<Size4K>) -> Self {
        Self::new().with_root_4k(root.base().as_u64() >> 12)
    }

    /// The top-level table frame this CR3 points at.
    #[must_use]
    pub const fn root(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_base(PhysicalAddress::new(self.root_4k() << 12))
    }
}

#[cfg(feature = "asm")]
impl ReadRegister for Cr3 {
    unsafe fn read() -> Self {
        let raw: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) raw, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(raw)
    }
}

#[cfg(feature = "asm")]
impl WriteRegister for Cr3 {
    unsafe fn write(self) {
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) self.into_bits(), options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_round_trip() {
        let root = PhysicalPage::from_base(PhysicalAddress::new(0x1234_5000));
        let cr3 = Cr3::with_root(root);
        assert_eq!(cr3.root(), root);
        assert!(!cr3.pwt());
        assert!(!cr3.pcd());
        assert_eq!(cr3.into_bits(), 0x1234_5000);
    }
}
