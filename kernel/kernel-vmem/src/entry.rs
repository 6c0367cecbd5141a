use crate::VmFlags;
use crate::table::Level;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// An architectural page-table entry, uniform across all four levels.
///
/// The interpretation depends on the level it sits at:
///
/// - at L4, and at L3/L2 with [`large`](Self::large) clear, the address
///   field references the next-level table;
/// - at L1 always, and at L3/L2 with `large` set, it references a data page
///   of 4 KiB, 1 GiB or 2 MiB respectively.
///
/// Reserved and ignored bits are left zero on every write path.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct PageEntry {
    /// Bit 0 — entry is valid; a clear bit faults the walk.
    pub present: bool,
    /// Bit 1 — writes allowed through this entry.
    pub writable: bool,
    /// Bit 2 — user-mode access allowed through this entry.
    pub user: bool,
    /// Bit 3 — write-through caching.
    pub write_through: bool,
    /// Bit 4 — caching disabled.
    pub cache_disable: bool,
    /// Bit 5 — set by the CPU on first access.
    pub accessed: bool,
    /// Bit 6 — set by the CPU on first write (leaves only).
    pub dirty: bool,
    /// Bit 7 — size: this is a 1 GiB (L3) or 2 MiB (L2) leaf.
    pub large: bool,
    /// Bit 8 — translation survives CR3 reloads (leaves only).
    pub global: bool,
    #[bits(3)]
    __: u8,
    /// Bits 12–51 — physical address of the target, shifted right by 12.
    #[bits(40)]
    addr_4k: u64,
    #[bits(11)]
    __: u16,
    /// Bit 63 — execute-disable (honored once `EFER.NXE` is set).
    pub no_execute: bool,
}

impl PageEntry {
    /// The physical address this entry points at (table base or page base).
    #[inline]
    #[must_use]
    pub const fn addr(self) -> PhysicalAddress {
        PhysicalAddress::new(self.addr_4k() << 12)
    }

    #[inline]
    pub const fn set_addr(&mut self, addr: PhysicalAddress) {
        debug_assert!(addr.is_aligned(4096));
        self.set_addr_4k(addr.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn with_addr(mut self, addr: PhysicalAddress) -> Self {
        self.set_addr(addr);
        self
    }

    /// A non-present entry; the remaining bits are zero.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self::new()
    }

    /// A terminal entry mapping `page` with `flags`.
    ///
    /// `large` must be set iff the entry will sit at L3 or L2 and map a
    /// whole 1 GiB / 2 MiB page.
    #[must_use]
    pub const fn leaf(page: PhysicalAddress, flags: VmFlags, large: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(flags.contains(VmFlags::WRITE))
            .with_user(flags.contains(VmFlags::USER))
            .with_write_through(flags.contains(VmFlags::WRITE_THROUGH))
            .with_cache_disable(flags.contains(VmFlags::CACHE_DISABLE))
            .with_global(flags.contains(VmFlags::GLOBAL))
            .with_no_execute(!flags.contains(VmFlags::EXEC))
            .with_large(large)
            .with_addr(page)
    }

    /// A non-terminal entry linking the next-level table.
    ///
    /// Carries the permissive subset of `flags` (walk permissions are the
    /// intersection of all levels); never `large`, never `global`.
    #[must_use]
    pub const fn table(next: PhysicalPage<Size4K>, flags: VmFlags) -> Self {
        Self::leaf(next.base(), flags, false).with_global(false)
    }

    /// Widen this (non-terminal) entry so a new overlapping mapping is not
    /// masked by a stricter path: write/user granted by any path remain
    /// granted, execute-disable only survives if every path demands it, and
    /// cache-disable only survives if the new path keeps it.
    #[must_use]
    pub const fn prioritized(mut self, flags: VmFlags) -> Self {
        self.set_writable(self.writable() | flags.contains(VmFlags::WRITE));
        self.set_user(self.user() | flags.contains(VmFlags::USER));
        self.set_no_execute(self.no_execute() & !flags.contains(VmFlags::EXEC));
        self.set_cache_disable(self.cache_disable() & flags.contains(VmFlags::CACHE_DISABLE));
        self
    }

    /// What this entry means at `level`.
    #[inline]
    #[must_use]
    pub const fn kind(self, level: Level) -> EntryKind {
        if !self.present() {
            EntryKind::Missing
        } else if level.is_terminal(self.large()) {
            EntryKind::Leaf(self.addr())
        } else {
            EntryKind::Table(PhysicalPage::from_base(self.addr()))
        }
    }
}

/// Decoded meaning of a [`PageEntry`] at a given level.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryKind {
    /// Not present; the walk ends unmapped.
    Missing,
    /// References the next-level table.
    Table(PhysicalPage<Size4K>),
    /// Terminal: maps a data page at this address.
    Leaf(PhysicalAddress),
}
