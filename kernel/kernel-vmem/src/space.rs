use crate::entry::{EntryKind, PageEntry};
use crate::table::{ENTRY_COUNT, Level, PageTable};
use crate::{PhysMapper, PtAlloc, VmFlags};
#[cfg(feature = "asm")]
use kernel_registers::cr3::Cr3;
#[cfg(feature = "asm")]
use kernel_registers::{ReadRegister, WriteRegister};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress,
};
use log::{trace, warn};

/// A single virtual address space, rooted at one top-level table.
///
/// The mapper edits tables through a [`PhysMapper`] and takes page-table
/// frames from a [`PtAlloc`]; it never allocates anything else. Mutation of
/// one address space must be serialized by the caller; concurrent walks of a
/// stable tree are fine, and the split paths publish child tables with a
/// release store so a racing walker sees either the old leaf or the complete
/// child.
///
/// TLB coherence is entirely the caller's: after unmapping or narrowing a
/// live mapping, invalidate the affected range.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

/// A mapping failure.
///
/// The walk may have created intermediate tables and installed part of the
/// requested range before failing; the mapper does not roll back. Callers
/// that need atomicity build into a fresh address space, or unmap the range
/// on error.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("page-table pool exhausted while extending the chain at {0:?}")]
    TableExhausted(Level),
    #[error("virtual or physical address not page aligned")]
    Unaligned,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Create an empty address space with a freshly allocated, zeroed root.
    ///
    /// # Errors
    /// [`MapError::TableExhausted`] when the table pool is dry.
    pub fn new(mapper: &'m M, alloc: &mut impl PtAlloc) -> Result<Self, MapError> {
        let root = alloc
            .alloc_table()
            .ok_or(MapError::TableExhausted(Level::L4))?;
        let space = Self::from_root(mapper, root);
        space.table_mut(root).zero();
        Ok(space)
    }

    /// Wrap an existing root frame.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// The address space the CPU is currently walking, read from CR3.
    ///
    /// # Safety
    /// Requires CPL0 with paging enabled; CR3 must point at a valid root
    /// reachable through `mapper`.
    #[cfg(feature = "asm")]
    #[inline]
    pub unsafe fn from_current(mapper: &'m M) -> Self {
        Self::from_root(mapper, unsafe { Cr3::read() }.root())
    }

    /// Load CR3 with this space's root, switching translation to it.
    ///
    /// # Safety
    /// The space must map the executing code, the current stack and every
    /// datum live across the switch.
    #[cfg(feature = "asm")]
    #[inline]
    pub unsafe fn activate(&self) {
        unsafe {
            Cr3::with_root(self.root).write();
        }
    }

    /// The root table frame.
    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// Map `pages` 4 KiB pages from `va` onto contiguous physical memory at
    /// `pa`.
    ///
    /// With [`VmFlags::LARGE`], 2 MiB or 1 GiB leaves are used when `va`,
    /// `pa` and the run length permit; when the remaining length drops below
    /// a large-page span mid-run, the mapper downgrades and continues.
    /// Existing coarser mappings in the way are carved into finer tables;
    /// intermediate entries on the path are widened so no prior permission
    /// is lost.
    ///
    /// # Errors
    /// - [`MapError::Unaligned`] when `va` or `pa` carries an offset.
    /// - [`MapError::TableExhausted`] when the table pool is dry. Partial
    ///   state remains (see [`MapError`]).
    pub fn map(
        &self,
        alloc: &mut impl PtAlloc,
        va: VirtualAddress,
        pa: PhysicalAddress,
        pages: u64,
        flags: VmFlags,
    ) -> Result<(), MapError> {
        if !va.is_aligned(Size4K::SIZE) || !pa.is_aligned(Size4K::SIZE) {
            return Err(MapError::Unaligned);
        }

        let mut leaf_level = Self::initial_leaf_level(va, pa, pages, flags);
        let mut mapped = 0u64;
        while mapped < pages {
            let cur_va = va.add_bytes(mapped * Size4K::SIZE);
            let cur_pa = pa.add_bytes(mapped * Size4K::SIZE);

            // Downgrade once the tail no longer fills a whole leaf.
            let mut span_pages = leaf_level.span() >> Size4K::SHIFT;
            while pages - mapped < span_pages {
                leaf_level = match leaf_level.next_down() {
                    Some(level) => level,
                    None => break,
                };
                span_pages = leaf_level.span() >> Size4K::SHIFT;
            }

            self.map_chunk(alloc, cur_va, cur_pa, leaf_level, flags)?;
            mapped += span_pages;
        }

        trace!("mapped {va} -> {pa}, {pages} pages, {flags:?}");
        Ok(())
    }

    /// The coarsest leaf level the whole request qualifies for.
    ///
    /// Decided once up front: a run that starts unaligned is mapped with
    /// 4 KiB pages throughout, mirroring how the request was made.
    fn initial_leaf_level(
        va: VirtualAddress,
        pa: PhysicalAddress,
        pages: u64,
        flags: VmFlags,
    ) -> Level {
        if !flags.contains(VmFlags::LARGE) {
            return Level::L1;
        }
        if pages >= Size2M::FRAMES && va.is_aligned(Size2M::SIZE) && pa.is_aligned(Size2M::SIZE) {
            if pages >= Size1G::FRAMES
                && va.is_aligned(Size1G::SIZE)
                && pa.is_aligned(Size1G::SIZE)
            {
                return Level::L3;
            }
            return Level::L2;
        }
        Level::L1
    }

    /// Install one leaf of `leaf_level` at `va -> pa`, extending or carving
    /// the chain above it as needed.
    fn map_chunk(
        &self,
        alloc: &mut impl PtAlloc,
        va: VirtualAddress,
        pa: PhysicalAddress,
        leaf_level: Level,
        flags: VmFlags,
    ) -> Result<(), MapError> {
        let mut table = self.table_mut(self.root);
        let mut level = Level::L4;

        while level != leaf_level {
            let idx = level.index_of(va);
            let entry = table.get(idx);
            let next = match entry.kind(level) {
                EntryKind::Table(page) => {
                    table.set(idx, entry.prioritized(flags));
                    page
                }
                EntryKind::Missing => {
                    let page = alloc
                        .alloc_table()
                        .ok_or(MapError::TableExhausted(level))?;
                    self.table_mut(page).zero();
                    table.set_release(idx, PageEntry::table(page, flags));
                    page
                }
                EntryKind::Leaf(_) => {
                    // A coarser mapping is in the way; subdivide it, then
                    // widen the new link like any other intermediate.
                    let page = self.demote(alloc, table, idx, level)?;
                    let link = table.get(idx);
                    table.set(idx, link.prioritized(flags));
                    page
                }
            };
            table = self.table_mut(next);
            level = match level.next_down() {
                Some(next_level) => next_level,
                None => break,
            };
        }

        let large = matches!(leaf_level, Level::L2 | Level::L3);
        table.set(leaf_level.index_of(va), PageEntry::leaf(pa, flags, large));
        Ok(())
    }

    /// Split the large leaf at `table[idx]` (level L3 or L2) into a child
    /// table of 512 next-finer entries covering the same range with the same
    /// flags.
    ///
    /// The child is fully populated before the parent entry is rewritten
    /// with a release store, so a concurrent walker sees the old leaf or the
    /// complete child.
    fn demote(
        &self,
        alloc: &mut impl PtAlloc,
        table: &mut PageTable,
        idx: usize,
        level: Level,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let old = table.get(idx);
        debug_assert!(old.large());

        let child_page = alloc
            .alloc_table()
            .ok_or(MapError::TableExhausted(level))?;
        let child = self.table_mut(child_page);

        // Children of a 1 GiB leaf are 2 MiB leaves; children of a 2 MiB
        // leaf are plain PTEs.
        let child_large = level == Level::L3;
        let stride = match level.next_down() {
            Some(next) => next.span(),
            None => Size4K::SIZE,
        };

        let template = old.with_large(child_large);
        for i in 0..ENTRY_COUNT {
            child.set(
                i,
                template.with_addr(old.addr().add_bytes(i as u64 * stride)),
            );
        }

        let link = old
            .with_large(false)
            .with_global(false)
            .with_addr(child_page.base());
        table.set_release(idx, link);

        trace!("split {level:?} leaf [{idx}] into {} x {stride:#x}", ENTRY_COUNT);
        Ok(child_page)
    }

    /// Translate `va`, honoring large leaves.
    ///
    /// Returns `None` for any unmapped address.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = self.table_mut(self.root);
        let mut level = Level::L4;
        loop {
            let entry = table.get(level.index_of(va));
            match entry.kind(level) {
                EntryKind::Missing => return None,
                EntryKind::Leaf(base) => {
                    let offset = va.as_u64() & (level.span() - 1);
                    return Some(base.add_bytes(offset));
                }
                EntryKind::Table(page) => {
                    table = self.table_mut(page);
                    level = level.next_down()?;
                }
            }
        }
    }

    /// Unmap `pages` 4 KiB pages starting at `va`.
    ///
    /// Clears PTEs, and whole 2 MiB / 1 GiB leaves when the request covers
    /// them exactly. Large leaves only partially covered are left mapped
    /// (subdividing on unmap would need table frames); emptied child tables
    /// are not reclaimed and 4 KiB runs are not recomposed into large
    /// pages. TLB invalidation stays with the caller.
    pub fn unmap(&self, va: VirtualAddress, pages: u64) {
        debug_assert!(va.is_aligned(Size4K::SIZE));
        let mut done = 0u64;
        while done < pages {
            let cur = va.add_bytes(done * Size4K::SIZE);
            done += self.unmap_step(cur, pages - done);
        }
    }

    /// Handle one walk at `va`; returns the number of pages consumed.
    fn unmap_step(&self, va: VirtualAddress, remaining: u64) -> u64 {
        let mut table = self.table_mut(self.root);
        let mut level = Level::L4;
        loop {
            let idx = level.index_of(va);
            let entry = table.get(idx);
            match entry.kind(level) {
                EntryKind::Missing => return Self::pages_to_boundary(va, level, remaining),
                EntryKind::Leaf(_) => {
                    let span_pages = level.span() >> Size4K::SHIFT;
                    if level == Level::L1 {
                        table.set(idx, PageEntry::empty());
                        return 1;
                    }
                    if va.is_aligned(level.span()) && remaining >= span_pages {
                        table.set(idx, PageEntry::empty());
                        return span_pages;
                    }
                    // Partially covered large leaf: leave it mapped, skip it.
                    warn!("unmap {va} falls inside a {level:?} leaf; leaving it mapped");
                    return Self::pages_to_boundary(va, level, remaining);
                }
                EntryKind::Table(page) => {
                    table = self.table_mut(page);
                    level = match level.next_down() {
                        Some(next) => next,
                        None => return 1,
                    };
                }
            }
        }
    }

    /// Pages from `va` to the end of the `level` entry span, capped at
    /// `remaining`.
    fn pages_to_boundary(va: VirtualAddress, level: Level, remaining: u64) -> u64 {
        let span = level.span();
        let to_boundary = (span - (va.as_u64() & (span - 1))) >> Size4K::SHIFT;
        to_boundary.min(remaining).max(1)
    }

    /// Log every present entry of the tree, for bring-up debugging.
    pub fn dump(&self) {
        trace!("address space @ {:?}", self.root);
        self.dump_table(self.root, Level::L4, 0);
    }

    fn dump_table(&self, page: PhysicalPage<Size4K>, level: Level, base: u64) {
        let table = self.table_mut(page);
        for i in 0..ENTRY_COUNT {
            let entry = table.get(i);
            if !entry.present() {
                continue;
            }
            let mut va = base + i as u64 * level.span();
            if level == Level::L4 && i >= ENTRY_COUNT / 2 {
                // Sign-extend into the canonical upper half.
                va |= 0xFFFF_0000_0000_0000;
            }
            match entry.kind(level) {
                EntryKind::Leaf(pa) => {
                    trace!(
                        "{level:?}[{i}] {va:#018x} -> {pa} ({:#x} bytes)",
                        level.span()
                    );
                }
                EntryKind::Table(next) => {
                    trace!("{level:?}[{i}] {va:#018x} -> table {:?}", next);
                    if let Some(next_level) = level.next_down() {
                        self.dump_table(next, next_level, va);
                    }
                }
                EntryKind::Missing => {}
            }
        }
    }

    /// Borrow the table in `page` through the mapper.
    fn table_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        // SAFETY: table frames come from PtAlloc and are only reached
        // through this walk; the mapper yields writable views.
        unsafe { self.mapper.phys_to_mut::<PageTable>(page.base()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A 4 KiB-aligned frame acting as fake physical RAM.
    #[repr(align(4096))]
    struct Frame(core::cell::UnsafeCell<[u8; 4096]>);

    /// Fake RAM plus the mapper that resolves fake physical addresses
    /// (`index * 4096`) to the backing frames.
    struct TestPhys {
        frames: Vec<Frame>,
    }

    impl TestPhys {
        fn new(frames: usize) -> Self {
            let mut v = Vec::with_capacity(frames);
            v.resize_with(frames, || Frame(core::cell::UnsafeCell::new([0; 4096])));
            Self { frames: v }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            assert_eq!(pa.as_u64() & 0xFFF, 0);
            let ptr = self.frames[idx].0.get();
            unsafe { &mut *ptr.cast::<T>() }
        }
    }

    /// Bump allocator handing out the fake frames top-down so table frames
    /// never collide with the low addresses the tests map.
    struct Bump {
        next: u64,
        end: u64,
    }

    impl Bump {
        fn new(first_frame: u64, frames: u64) -> Self {
            Self {
                next: first_frame * 4096,
                end: (first_frame + frames) * 4096,
            }
        }
    }

    impl PtAlloc for Bump {
        fn alloc_table(&mut self) -> Option<PhysicalPage<Size4K>> {
            if self.next >= self.end {
                return None;
            }
            let page = PhysicalPage::from_base(PhysicalAddress::new(self.next));
            self.next += 4096;
            Some(page)
        }

        unsafe fn free_table(&mut self, _page: PhysicalPage<Size4K>) {}
    }

    fn setup(frames: usize) -> (TestPhys, Bump) {
        (TestPhys::new(frames), Bump::new(0, frames as u64))
    }

    fn space<'m>(phys: &'m TestPhys, alloc: &mut Bump) -> AddressSpace<'m, TestPhys> {
        AddressSpace::new(phys, alloc).expect("root")
    }

    #[test]
    fn map_one_4k_builds_the_chain() {
        let (phys, mut alloc) = setup(16);
        let aspace = space(&phys, &mut alloc);

        let va = VirtualAddress::new(0xFFFF_8000_0000_0000);
        let pa = PhysicalAddress::new(0x30_0000);
        aspace
            .map(&mut alloc, va, pa, 1, VmFlags::WRITE | VmFlags::GLOBAL)
            .expect("map");

        // Walk by hand: root -> L3 -> L2 -> L1.
        let l4 = unsafe { phys.phys_to_mut::<PageTable>(aspace.root_page().base()) };
        let e4 = l4.get(Level::L4.index_of(va));
        assert!(e4.present() && !e4.large() && !e4.global());

        let l3 = unsafe { phys.phys_to_mut::<PageTable>(e4.addr()) };
        let e3 = l3.get(Level::L3.index_of(va));
        assert!(e3.present() && !e3.large());

        let l2 = unsafe { phys.phys_to_mut::<PageTable>(e3.addr()) };
        let e2 = l2.get(Level::L2.index_of(va));
        assert!(e2.present() && !e2.large());

        let l1 = unsafe { phys.phys_to_mut::<PageTable>(e2.addr()) };
        let e1 = l1.get(Level::L1.index_of(va));
        assert!(e1.present() && e1.writable() && e1.global() && e1.no_execute());
        assert_eq!(e1.addr(), pa);

        assert_eq!(aspace.translate(va), Some(pa));
        assert_eq!(aspace.translate(va.add_bytes(0x123)), Some(pa.add_bytes(0x123)));
        assert_eq!(aspace.translate(va.add_bytes(4096)), None);
    }

    #[test]
    fn large_run_uses_one_giant_leaf() {
        let (phys, mut alloc) = setup(8);
        let aspace = space(&phys, &mut alloc);

        let va = VirtualAddress::new(0x0000_0040_0000_0000);
        let pa = PhysicalAddress::zero();
        aspace
            .map(
                &mut alloc,
                va,
                pa,
                Size1G::FRAMES,
                VmFlags::WRITE | VmFlags::LARGE,
            )
            .expect("map");

        let l4 = unsafe { phys.phys_to_mut::<PageTable>(aspace.root_page().base()) };
        let l3 = unsafe { phys.phys_to_mut::<PageTable>(l4.get(Level::L4.index_of(va)).addr()) };
        let e3 = l3.get(Level::L3.index_of(va));
        assert!(e3.present() && e3.large());
        assert_eq!(e3.addr(), pa);

        // Only root, L3 and nothing below were allocated.
        assert_eq!(
            aspace.translate(va.add_bytes(123 * 4096)),
            Some(PhysicalAddress::new(123 * 4096))
        );
    }

    #[test]
    fn overmap_demotes_twice_down_to_4k() {
        // Scenario: a 1 GiB leaf is later overridden by a single 4 KiB page.
        let (phys, mut alloc) = setup(32);
        let aspace = space(&phys, &mut alloc);

        let va = VirtualAddress::new(0x4000_0000);
        aspace
            .map(
                &mut alloc,
                va,
                PhysicalAddress::zero(),
                262_144,
                VmFlags::WRITE | VmFlags::LARGE,
            )
            .expect("giant map");

        let fine_pa = PhysicalAddress::new(0x1000_0000);
        aspace
            .map(&mut alloc, va, fine_pa, 1, VmFlags::WRITE)
            .expect("overmap");

        // The L3 entry turned into a table of 512 2 MiB leaves...
        let l4 = unsafe { phys.phys_to_mut::<PageTable>(aspace.root_page().base()) };
        let l3 = unsafe { phys.phys_to_mut::<PageTable>(l4.get(Level::L4.index_of(va)).addr()) };
        let e3 = l3.get(Level::L3.index_of(va));
        assert!(e3.present() && !e3.large());

        let l2 = unsafe { phys.phys_to_mut::<PageTable>(e3.addr()) };
        let e2_0 = l2.get(0);
        assert!(e2_0.present() && !e2_0.large(), "first slot further split");
        for i in 1..ENTRY_COUNT {
            let e = l2.get(i);
            assert!(e.present() && e.large());
            assert_eq!(e.addr().as_u64(), i as u64 * Size2M::SIZE);
        }

        // ...whose first slot was split again into PTEs.
        let l1 = unsafe { phys.phys_to_mut::<PageTable>(e2_0.addr()) };
        let e1_0 = l1.get(0);
        assert!(e1_0.present() && !e1_0.large());
        assert_eq!(e1_0.addr(), fine_pa);
        for i in 1..ENTRY_COUNT {
            assert_eq!(l1.get(i).addr().as_u64(), i as u64 * Size4K::SIZE);
        }

        // Translations: the override wins on page 0, the split leaves keep
        // backing the rest.
        assert_eq!(aspace.translate(va), Some(fine_pa));
        assert_eq!(
            aspace.translate(va.add_bytes(Size4K::SIZE)),
            Some(PhysicalAddress::new(Size4K::SIZE))
        );
        assert_eq!(
            aspace.translate(va.add_bytes(Size2M::SIZE)),
            Some(PhysicalAddress::new(Size2M::SIZE))
        );
    }

    #[test]
    fn downgrades_when_the_tail_is_short() {
        let (phys, mut alloc) = setup(16);
        let aspace = space(&phys, &mut alloc);

        // 513 pages, 2 MiB aligned: one 2 MiB leaf plus one PTE.
        let va = VirtualAddress::new(0x20_0000);
        let pa = PhysicalAddress::new(0x4000_0000);
        aspace
            .map(&mut alloc, va, pa, 513, VmFlags::WRITE | VmFlags::LARGE)
            .expect("map");

        let l4 = unsafe { phys.phys_to_mut::<PageTable>(aspace.root_page().base()) };
        let l3 = unsafe { phys.phys_to_mut::<PageTable>(l4.get(Level::L4.index_of(va)).addr()) };
        let l2 = unsafe { phys.phys_to_mut::<PageTable>(l3.get(Level::L3.index_of(va)).addr()) };

        let head = l2.get(Level::L2.index_of(va));
        assert!(head.present() && head.large());
        assert_eq!(head.addr(), pa);

        let tail = l2.get(Level::L2.index_of(va) + 1);
        assert!(tail.present() && !tail.large());

        assert_eq!(
            aspace.translate(va.add_bytes(Size2M::SIZE)),
            Some(pa.add_bytes(Size2M::SIZE))
        );
        assert_eq!(aspace.translate(va.add_bytes(Size2M::SIZE + Size4K::SIZE)), None);
    }

    #[test]
    fn intermediate_flags_widen_but_leaves_keep_theirs() {
        let (phys, mut alloc) = setup(16);
        let aspace = space(&phys, &mut alloc);

        let ro = VirtualAddress::new(0x1000_0000);
        let rw = VirtualAddress::new(0x1000_1000);
        aspace
            .map(&mut alloc, ro, PhysicalAddress::new(0x5000), 1, VmFlags::empty())
            .expect("ro map");
        aspace
            .map(
                &mut alloc,
                rw,
                PhysicalAddress::new(0x6000),
                1,
                VmFlags::WRITE | VmFlags::EXEC,
            )
            .expect("rw map");

        let l4 = unsafe { phys.phys_to_mut::<PageTable>(aspace.root_page().base()) };
        let e4 = l4.get(Level::L4.index_of(ro));
        assert!(e4.writable() && !e4.no_execute(), "path widened");

        let l3 = unsafe { phys.phys_to_mut::<PageTable>(e4.addr()) };
        let l2 = unsafe { phys.phys_to_mut::<PageTable>(l3.get(Level::L3.index_of(ro)).addr()) };
        let l1 = unsafe { phys.phys_to_mut::<PageTable>(l2.get(Level::L2.index_of(ro)).addr()) };

        let ro_leaf = l1.get(Level::L1.index_of(ro));
        assert!(!ro_leaf.writable() && ro_leaf.no_execute(), "leaf untouched");
        let rw_leaf = l1.get(Level::L1.index_of(rw));
        assert!(rw_leaf.writable() && !rw_leaf.no_execute());
    }

    #[test]
    fn unmap_clears_only_the_requested_pages() {
        let (phys, mut alloc) = setup(16);
        let aspace = space(&phys, &mut alloc);

        let va = VirtualAddress::new(0x7000_0000);
        aspace
            .map(&mut alloc, va, PhysicalAddress::new(0x9000), 2, VmFlags::WRITE)
            .expect("map");

        aspace.unmap(va, 1);
        assert_eq!(aspace.translate(va), None);
        assert_eq!(
            aspace.translate(va.add_bytes(Size4K::SIZE)),
            Some(PhysicalAddress::new(0xA000))
        );
    }

    #[test]
    fn unmap_covers_whole_large_leaves() {
        let (phys, mut alloc) = setup(16);
        let aspace = space(&phys, &mut alloc);

        let va = VirtualAddress::new(0x4000_0000);
        aspace
            .map(
                &mut alloc,
                va,
                PhysicalAddress::zero(),
                Size2M::FRAMES,
                VmFlags::WRITE | VmFlags::LARGE,
            )
            .expect("map");
        assert!(aspace.translate(va).is_some());

        aspace.unmap(va, Size2M::FRAMES);
        assert_eq!(aspace.translate(va), None);
        assert_eq!(aspace.translate(va.add_bytes(Size2M::SIZE - 4096)), None);
    }

    #[test]
    fn unaligned_requests_are_rejected() {
        let (phys, mut alloc) = setup(8);
        let aspace = space(&phys, &mut alloc);
        assert_eq!(
            aspace.map(
                &mut alloc,
                VirtualAddress::new(0x123),
                PhysicalAddress::zero(),
                1,
                VmFlags::empty()
            ),
            Err(MapError::Unaligned)
        );
    }

    #[test]
    fn exhausted_table_pool_reports_the_level() {
        let phys = TestPhys::new(8);
        // Room for the root and one more table only.
        let mut tiny = Bump::new(0, 2);
        let aspace = space(&phys, &mut tiny);
        let result = aspace.map(
            &mut tiny,
            VirtualAddress::new(0x1000),
            PhysicalAddress::zero(),
            1,
            VmFlags::empty(),
        );
        assert_eq!(result, Err(MapError::TableExhausted(Level::L3)));
    }
}
