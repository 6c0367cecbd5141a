//! # Typed x86-64 register and instruction surface
//!
//! The privileged architectural operations the memory core needs, behind
//! typed wrappers: control registers, model-specific registers, CPUID,
//! descriptor-table registers, TLB maintenance and port I/O.
//!
//! Register values are plain `bitfield-struct` records; the instruction
//! wrappers live behind the `asm` feature so the crate builds (and its value
//! types test) on any host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cpuid;
pub mod cr3;
pub mod cr4;
pub mod desc;
pub mod efer;
pub mod msr;
pub mod port;
pub mod tlb;

/// A register that can be read from the CPU.
pub trait ReadRegister: Sized {
    /// # Safety
    /// Access may be privileged (CPL0) and may have side effects defined by
    /// the architecture.
    unsafe fn read() -> Self;
}

/// A register that can be written to the CPU.
pub trait WriteRegister {
    /// # Safety
    /// Writing control state reconfigures the CPU; the caller must keep the
    /// machine in a consistent state (paging, segmentation, mode bits).
    unsafe fn write(self);
}
