use crate::{ReadRegister, WriteRegister};
use bitfield_struct::bitfield;

/// CR4 — paging and extension control bits the memory core cares about.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct Cr4 {
    #[bits(4)]
    __: u8,

    /// Bit 4 — PSE: page-size extensions (32-bit large pages; ignored in
    /// long mode but kept visible).
    pub pse: bool,

    /// Bit 5 — PAE: physical-address extensions. Always set in long mode.
    pub pae: bool,

    #[bits(1)]
    __: bool,

    /// Bit 7 — PGE: global-page support; required for `global` leaf
    /// entries to survive CR3 reloads.
    pub pge: bool,

    #[bits(1)]
    __: bool,

    /// Bit 9 — OSFXSR: OS supports `fxsave`/`fxrstor`.
    pub osfxsr: bool,

    /// Bit 10 — OSXMMEXCPT: OS handles SIMD floating-point exceptions.
    pub osxmmexcpt: bool,

    #[bits(7)]
    __: u8,

    /// Bit 18 — OSXSAVE: enables `xsave`/`xgetbv` and AVX state control.
    pub osxsave: bool,

    #[bits(45)]
    __: u64,
}

#[cfg(feature = "asm")]
impl ReadRegister for Cr4 {
    unsafe fn read() -> Self {
        let raw: u64;
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) raw, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(raw)
    }
}

#[cfg(feature = "asm")]
impl WriteRegister for Cr4 {
    unsafe fn write(self) {
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) self.into_bits(), options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_positions() {
        let cr4 = Cr4::new().with_pae(true).with_pge(true).with_osxsave(true);
        assert_eq!(cr4.into_bits(), (1 << 5) | (1 << 7) | (1 << 18));
    }
}
