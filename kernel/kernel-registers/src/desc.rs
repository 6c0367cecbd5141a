//! Descriptor-table registers (GDTR / IDTR).

use kernel_memory_addresses::VirtualAddress;

/// The in-memory operand of `lgdt`/`sgdt` and `lidt`/`sidt`.
#[repr(C, packed(2))]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DescriptorTablePointer {
    /// Byte length of the table minus one.
    pub limit: u16,
    /// Linear base address of the table.
    pub base: u64,
}

impl DescriptorTablePointer {
    #[must_use]
    pub const fn new(base: VirtualAddress, limit: u16) -> Self {
        Self {
            limit,
            base: base.as_u64(),
        }
    }

    /// Shift the base, e.g. to rebase a table into the direct-mapped window
    /// after the paging switch.
    #[must_use]
    pub const fn rebased(self, offset: u64) -> Self {
        Self {
            limit: self.limit,
            base: self.base + offset,
        }
    }
}

/// Store the current GDTR.
///
/// # Safety
/// Requires CPL0.
#[cfg(feature = "asm")]
#[must_use]
pub unsafe fn sgdt() -> DescriptorTablePointer {
    let mut gdtr = DescriptorTablePointer { limit: 0, base: 0 };
    unsafe {
        core::arch::asm!("sgdt [{}]", in(reg) &raw mut gdtr, options(nostack, preserves_flags));
    }
    gdtr
}

/// Load the GDTR.
///
/// # Safety
/// Requires CPL0; the table must stay mapped and valid for as long as it is
/// active, and the segment registers must hold selectors valid in it.
#[cfg(feature = "asm")]
pub unsafe fn lgdt(gdtr: &DescriptorTablePointer) {
    unsafe {
        core::arch::asm!(
            "lgdt [{}]",
            in(reg) core::ptr::from_ref(gdtr),
            options(readonly, nostack, preserves_flags)
        );
    }
}

/// Load the IDTR.
///
/// # Safety
/// Requires CPL0; the table must stay mapped and valid while interrupts can
/// be delivered.
#[cfg(feature = "asm")]
pub unsafe fn lidt(idtr: &DescriptorTablePointer) {
    unsafe {
        core::arch::asm!(
            "lidt [{}]",
            in(reg) core::ptr::from_ref(idtr),
            options(readonly, nostack, preserves_flags)
        );
    }
}
