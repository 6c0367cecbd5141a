//! # Boot memory map
//!
//! The loader's byte-granular memory map, normalized to page units and kept
//! sorted by base. Before the buddy allocator is armed, this map doubles as
//! the **early allocator**: one-shot page allocations are carved out of its
//! largest free entry and simply vanish from the map, so later consumers
//! (the buddy seeding pass above all) never see those pages as free.
//!
//! Consumed once during bring-up; read-only afterwards.

use kernel_info::handoff::{RawMapEntry, RegionKind};
use kernel_memory_addresses::{PageIndex, PageSize, PhysicalAddress, Size4K};
use log::{info, warn};

/// Upper bound on map entries kept; loaders report a few dozen.
pub const MAX_ENTRIES: usize = 128;

/// One normalized map entry: `pages` pages starting at page `base`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemMapEntry {
    pub base: PageIndex,
    pub pages: u32,
    pub kind: RegionKind,
}

impl MemMapEntry {
    /// First page past the entry.
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.base.as_u32() + self.pages
    }
}

/// The normalized physical memory map.
pub struct BootMemMap {
    entries: [MemMapEntry; MAX_ENTRIES],
    len: usize,
}

impl BootMemMap {
    /// Normalize the loader map: free regions shrink to whole contained
    /// pages, reserved regions grow to page boundaries, everything is
    /// sorted by base. Entries past [`MAX_ENTRIES`] are dropped loudly.
    #[must_use]
    pub fn from_raw(raw: &[RawMapEntry]) -> Self {
        const EMPTY: MemMapEntry = MemMapEntry {
            base: PageIndex::new(0),
            pages: 0,
            kind: RegionKind::Used,
        };
        let mut map = Self {
            entries: [EMPTY; MAX_ENTRIES],
            len: 0,
        };

        for entry in raw {
            let (first, last) = if entry.kind == RegionKind::Free {
                // A partial page cannot be handed out; keep only whole ones.
                (
                    entry.base.div_ceil(Size4K::SIZE),
                    (entry.base + entry.size) >> Size4K::SHIFT,
                )
            } else {
                // Reserved memory must cover every byte it touches.
                (
                    entry.base >> Size4K::SHIFT,
                    (entry.base + entry.size).div_ceil(Size4K::SIZE),
                )
            };
            if last <= first {
                continue;
            }
            if map.len == MAX_ENTRIES {
                warn!("memory map overflow; dropping {entry:?}");
                continue;
            }
            map.entries[map.len] = MemMapEntry {
                base: PageIndex::new(first as u32),
                pages: (last - first) as u32,
                kind: entry.kind,
            };
            map.len += 1;
        }

        // Insertion sort by base; the map is small and nearly sorted.
        for i in 1..map.len {
            let mut j = i;
            while j > 0 && map.entries[j - 1].base > map.entries[j].base {
                map.entries.swap(j - 1, j);
                j -= 1;
            }
        }

        map
    }

    #[must_use]
    pub fn entries(&self) -> &[MemMapEntry] {
        &self.entries[..self.len]
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Highest page number covered by the map, plus one.
    #[must_use]
    pub fn page_count(&self) -> u32 {
        self.entries()
            .iter()
            .map(MemMapEntry::end)
            .max()
            .unwrap_or(0)
    }

    /// Total pages currently marked free.
    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.entries()
            .iter()
            .filter(|e| e.kind == RegionKind::Free)
            .map(|e| u64::from(e.pages))
            .sum()
    }

    /// The free ranges as `(base_page, pages)`, for buddy seeding.
    pub fn free_ranges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.entries()
            .iter()
            .filter(|e| e.kind == RegionKind::Free)
            .map(|e| (e.base.as_u32(), e.pages))
    }

    /// Drop the entry at `index`.
    pub fn remove(&mut self, index: usize) {
        assert!(index < self.len);
        for i in index..self.len - 1 {
            self.entries[i] = self.entries[i + 1];
        }
        self.len -= 1;
    }

    /// Early one-shot allocation: carve `pages` pages out of the largest
    /// free entry.
    ///
    /// The carved pages leave the map for good. Returns `None` when no free
    /// entry is large enough (the caller treats that as fatal during
    /// bring-up).
    #[must_use]
    pub fn alloc(&mut self, pages: u32) -> Option<PhysicalAddress> {
        assert!(pages > 0);
        let index = self
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind == RegionKind::Free && e.pages >= pages)
            .max_by_key(|(_, e)| e.pages)
            .map(|(i, _)| i)?;

        let entry = &mut self.entries[index];
        let base = entry.base;
        entry.base = entry.base.add(pages);
        entry.pages -= pages;
        if entry.pages == 0 {
            self.remove(index);
        }
        Some(base.addr())
    }

    /// Log a bring-up summary of the map.
    pub fn log_summary(&self) {
        info!(
            "memory map: {} entries, {} usable pages, {} pages total",
            self.len,
            self.free_pages(),
            self.page_count()
        );
        for entry in self.entries() {
            info!(
                "  {:#014x}..{:#014x} {:?} ({} pages)",
                entry.base.addr().as_u64(),
                u64::from(entry.end()) * Size4K::SIZE,
                entry.kind,
                entry.pages
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(base: u64, size: u64, kind: RegionKind) -> RawMapEntry {
        RawMapEntry::new(base, size, kind)
    }

    #[test]
    fn normalizes_to_page_units_and_sorts() {
        let map = BootMemMap::from_raw(&[
            raw(0x100_000, 0x80_0000, RegionKind::Free),
            raw(0x0, 0x9F800, RegionKind::Free),
            raw(0xFEE0_0100, 0x100, RegionKind::Device),
        ]);

        let entries = map.entries();
        assert_eq!(entries.len(), 3);

        // Sorted by base; the sub-page tail of the low region is dropped.
        assert_eq!(entries[0].base.as_u32(), 0);
        assert_eq!(entries[0].pages, 0x9F);
        // The device entry is grown outward to page boundaries.
        assert_eq!(entries[2].kind, RegionKind::Device);
        assert_eq!(entries[2].base.addr().as_u64(), 0xFEE0_0000);
        assert_eq!(entries[2].pages, 1);

        assert_eq!(map.page_count(), 0xFEE00 + 1);
    }

    #[test]
    fn unaligned_free_region_shrinks_inward() {
        let map = BootMemMap::from_raw(&[raw(0x1800, 0x3000, RegionKind::Free)]);
        let entries = map.entries();
        // [0x1800, 0x4800) contains whole pages 0x2000..0x4000 only.
        assert_eq!(entries[0].base.addr().as_u64(), 0x2000);
        assert_eq!(entries[0].pages, 2);
    }

    #[test]
    fn early_alloc_carves_from_the_largest_free_entry() {
        let mut map = BootMemMap::from_raw(&[
            raw(0x1000, 4 * 4096, RegionKind::Free),
            raw(0x10_0000, 64 * 4096, RegionKind::Free),
            raw(0x5000, 0x2000, RegionKind::Used),
        ]);
        let before = map.free_pages();

        let got = map.alloc(16).expect("early alloc");
        assert_eq!(got.as_u64(), 0x10_0000, "largest entry serves");
        assert_eq!(map.free_pages(), before - 16);

        // The carved pages are no longer visible to buddy seeding.
        let ranges: Vec<_> = map.free_ranges().collect();
        assert_eq!(ranges, vec![(1, 4), (0x110, 48)]);
    }

    #[test]
    fn fully_consumed_entries_disappear() {
        let mut map = BootMemMap::from_raw(&[raw(0x2000, 2 * 4096, RegionKind::Free)]);
        assert_eq!(map.alloc(2).unwrap().as_u64(), 0x2000);
        assert!(map.alloc(1).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn alloc_never_touches_reserved_memory() {
        let mut map = BootMemMap::from_raw(&[
            raw(0x0, 0x4000, RegionKind::Used),
            raw(0x4000, 0x1000, RegionKind::Free),
        ]);
        assert_eq!(map.alloc(1).unwrap().as_u64(), 0x4000);
        assert!(map.alloc(1).is_none(), "only reserved memory remains");
    }
}
