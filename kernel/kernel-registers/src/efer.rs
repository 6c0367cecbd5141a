use crate::msr;
use crate::{ReadRegister, WriteRegister};
use bitfield_struct::bitfield;

/// `IA32_EFER` (MSR `0xC000_0080`).
///
/// The memory core only flips `NXE` here; the long-mode bits are owned by
/// the loader and read back for sanity checks.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct Efer {
    /// Bit 0 — SCE: `syscall`/`sysret` enable.
    pub sce: bool,

    #[bits(7)]
    __: u8,

    /// Bit 8 — LME: long-mode enable.
    pub lme: bool,

    #[bits(1)]
    __: bool,

    /// Bit 10 — LMA: long mode active (read-only).
    pub lma: bool,

    /// Bit 11 — NXE: honors the execute-disable bit in page-table entries.
    pub nxe: bool,

    /// Bit 12 — SVME: secure virtual machine enable (AMD).
    pub svme: bool,

    #[bits(51)]
    __: u64,
}

impl Efer {
    /// MSR index of `IA32_EFER`.
    pub const INDEX: u32 = 0xC000_0080;
}

#[cfg(feature = "asm")]
impl ReadRegister for Efer {
    unsafe fn read() -> Self {
        Self::from_bits(unsafe { msr::rdmsr(Self::INDEX) })
    }
}

#[cfg(feature = "asm")]
impl WriteRegister for Efer {
    unsafe fn write(self) {
        unsafe { msr::wrmsr(Self::INDEX, self.into_bits()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nxe_is_bit_11() {
        assert_eq!(Efer::new().with_nxe(true).into_bits(), 1 << 11);
        assert_eq!(Efer::new().with_lme(true).into_bits(), 1 << 8);
        assert_eq!(Efer::new().with_lma(true).into_bits(), 1 << 10);
    }
}
