use bitflags::bitflags;

bitflags! {
    /// Mapping request flags.
    ///
    /// These describe what a caller wants from a mapping; the mapper turns
    /// them into architectural [`PageEntry`](crate::PageEntry) bits. The
    /// default (empty) set maps kernel-only, read-only, non-executable
    /// 4 KiB pages.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct VmFlags: u8 {
        /// Writes allowed through terminal and intermediate entries.
        const WRITE = 1 << 0;
        /// User-mode access permitted at all traversed levels.
        const USER = 1 << 1;
        /// Instruction fetch allowed (clears execute-disable).
        const EXEC = 1 << 2;
        /// Keep the translation across address-space switches.
        const GLOBAL = 1 << 3;
        /// Bypass caches; for device memory.
        const CACHE_DISABLE = 1 << 4;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 5;
        /// Use 2 MiB / 1 GiB leaves where alignment and length permit.
        const LARGE = 1 << 6;
    }
}

impl VmFlags {
    /// The flag set used for memory-mapped device registers.
    #[must_use]
    pub const fn mmio() -> Self {
        Self::WRITE
            .union(Self::CACHE_DISABLE)
            .union(Self::GLOBAL)
    }
}
