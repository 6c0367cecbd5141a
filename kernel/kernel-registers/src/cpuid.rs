//! CPUID queries used during memory-subsystem bring-up.

/// Output registers of one `cpuid` invocation.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Execute `cpuid` for `leaf` (sub-leaf 0).
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[must_use]
pub fn cpuid(leaf: u32) -> CpuidResult {
    // SAFETY: cpuid is unprivileged and side-effect free.
    let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, 0) };
    CpuidResult {
        eax: r.eax,
        ebx: r.ebx,
        ecx: r.ecx,
        edx: r.edx,
    }
}

/// Index of the executing logical processor.
///
/// Reads the initial APIC id from leaf 1 (`EBX[31:24]`). With more than 256
/// logical processors this is superseded by the local APIC, which is out of
/// scope here.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[must_use]
pub fn cpu_index() -> u32 {
    cpuid(0x1).ebx >> 24
}

/// Whether the CPU implements the execute-disable page-table bit.
///
/// Extended leaf `0x8000_0001`, `EDX[20]`.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[must_use]
pub fn has_no_execute() -> bool {
    cpuid(0x8000_0001).edx & (1 << 20) != 0
}

/// Whether 1 GiB translation leaves are supported.
///
/// Extended leaf `0x8000_0001`, `EDX[26]`.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[must_use]
pub fn has_giant_pages() -> bool {
    cpuid(0x8000_0001).edx & (1 << 26) != 0
}
