use alloc::boxed::Box;
use core::{alloc::AllocError, fmt, ptr};

use bitflags::bitflags;
use dataview::Pod;

use super::{
    PAGE_SHIFT, PAGE_SIZE, PageRound as _, PhysAddr, PhysPageNum, SUPER_PAGE_SIZE, VirtAddr,
    level_page_size, page::PageFrameAllocator,
};
use crate::{arch, error::KernelError};

/// One node of the Sv39 page-table tree: 512 64-bit entries.
///
/// The root node doubles as the address-space handle; interior nodes are
/// owned by the parent entry that points at them.
#[repr(transparent)]
#[derive(Pod)]
pub struct PageTable([PtEntry; 512]);

impl PageTable {
    /// Allocates a new empty page table.
    pub(super) fn try_allocate() -> Result<Box<Self, PageFrameAllocator>, KernelError> {
        let pt = Box::try_new_zeroed_in(PageFrameAllocator)
            .map_err(|AllocError| KernelError::NoFreePage)?;
        Ok(unsafe { pt.assume_init() })
    }

    /// Returns the page-table index that corresponds to virtual address `va`
    ///
    /// The RISC-V Sv39 scheme has three levels of page-table
    /// pages. A page-table page contains 512 64-bit PTEs.
    /// A 64-bit virtual address is split into five fields:
    /// ```text
    ///     39..=63 -- must be zero.
    ///     30..=38 -- 9 bits of level-2 index.
    ///     21..=29 -- 9 bits of level-1 index.
    ///     12..=20 -- 9 bits of level-0 index.
    ///      0..=11 -- 12 bits byte offset with the page.
    /// ```
    fn entry_index(level: usize, va: VirtAddr) -> usize {
        assert!(level <= 2);
        let shift = PAGE_SHIFT + (9 * level);
        (va.addr() >> shift) & 0x1ff
    }

    /// Returns the physical address containing this page table
    pub(super) fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new(ptr::from_ref(self).expose_provenance())
    }

    /// Returns the physical page number of the physical page containing
    /// this page table
    pub(super) fn phys_page_num(&self) -> PhysPageNum {
        self.phys_addr().phys_page_num()
    }

    /// Creates a 4096-byte leaf PTE for virtual address `va` that refers
    /// to physical address `pa`.
    ///
    /// `va` and `pa` MUST be page-aligned.
    ///
    /// Returns `Err()` if a needed page-table page could not be allocated.
    ///
    /// # Panics
    ///
    /// Panics if the address is already mapped, at either granularity.
    pub fn map_page(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        perm: PtEntryFlags,
    ) -> Result<(), KernelError> {
        assert!(va.is_page_aligned(), "va={va:#x}");
        assert!(pa.is_page_aligned(), "pa={pa:#x}");
        assert!(perm.intersects(PtEntryFlags::RWX), "perm={perm:?}");

        self.update_leaf_entry(va, 0, true, |pte| {
            assert!(!pte.is_valid(), "remap over a live entry: va={va:#x}");
            pte.set_phys_addr(pa, perm | PtEntryFlags::V);
        })
    }

    /// Creates 4096-byte leaf PTEs for virtual addresses starting at `va`
    /// that refer to physical addresses starting at `pa`.
    ///
    /// `va`, `pa` and `size` MUST be page-aligned.
    ///
    /// On page-table exhaustion the entries installed so far are left in
    /// place and an error is returned; the caller unwinds with an unmap of
    /// the prefix.
    pub fn map_pages(
        &mut self,
        va: VirtAddr,
        size: usize,
        pa: PhysAddr,
        perm: PtEntryFlags,
    ) -> Result<(), KernelError> {
        assert!(va.is_page_aligned(), "va={va:#x}");
        assert!(size.is_page_aligned(), "size={size:#x}");
        assert_ne!(size, 0, "size={size:#x}");

        let mut va = va;
        let mut pa = pa;
        let last = va.byte_add(size - PAGE_SIZE);
        loop {
            self.map_page(va, pa, perm)?;
            if va == last {
                return Ok(());
            }

            va = va.byte_add(PAGE_SIZE);
            pa = pa.byte_add(PAGE_SIZE);
        }
    }

    /// Creates a super-page leaf PTE at level 1 for virtual address `va`
    /// that refers to physical address `pa`.
    ///
    /// `va` and `pa` MUST be 2 MiB-aligned.
    pub fn map_super_page(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        perm: PtEntryFlags,
    ) -> Result<(), KernelError> {
        assert!(va.is_super_page_aligned(), "va={va:#x}");
        assert!(pa.is_super_page_aligned(), "pa={pa:#x}");
        assert!(perm.intersects(PtEntryFlags::RWX), "perm={perm:?}");

        self.update_leaf_entry(va, 1, true, |pte| {
            assert!(!pte.is_valid(), "remap over a live entry: va={va:#x}");
            pte.set_phys_addr(pa, perm | PtEntryFlags::V);
        })
    }

    /// Creates super-page leaf PTEs for virtual addresses starting at `va`
    /// that refer to physical addresses starting at `pa`.
    ///
    /// `va`, `pa` and `size` MUST be 2 MiB-aligned.
    pub fn map_super_pages(
        &mut self,
        va: VirtAddr,
        size: usize,
        pa: PhysAddr,
        perm: PtEntryFlags,
    ) -> Result<(), KernelError> {
        assert!(va.is_super_page_aligned(), "va={va:#x}");
        assert!(size.is_super_page_aligned(), "size={size:#x}");
        assert_ne!(size, 0, "size={size:#x}");

        let mut va = va;
        let mut pa = pa;
        let last = va.byte_add(size - SUPER_PAGE_SIZE);
        loop {
            self.map_super_page(va, pa, perm)?;
            if va == last {
                return Ok(());
            }

            va = va.byte_add(SUPER_PAGE_SIZE);
            pa = pa.byte_add(SUPER_PAGE_SIZE);
        }
    }

    /// Unmaps `npages` 4096-byte pages of the range starting at `va`,
    /// yielding `(level, physical address)` for every mapping removed.
    ///
    /// Holes in the range are legal and are skipped. A super page wholly
    /// inside the range is removed as one level-1 unit; a super page the
    /// range only clips is first demoted to 4096-byte mappings.
    pub(super) fn unmap_pages(&mut self, va: VirtAddr, npages: usize) -> UnmapPages<'_> {
        assert!(va.is_page_aligned(), "va={va:#x}");

        let end = va.byte_add(npages * PAGE_SIZE);
        UnmapPages {
            pt: self,
            va,
            end,
            cleared: false,
        }
    }

    /// Replaces the super-page leaf at `super_va` with a level-0 table
    /// whose 512 entries cover the same physical range with the same
    /// permissions.
    ///
    /// After this the super page no longer exists as a unit; its
    /// constituent pages are freed one at a time by later unmaps. If the
    /// table allocation fails the original leaf is put back and an error
    /// is returned.
    pub(super) fn demote_super_page(&mut self, super_va: VirtAddr) -> Result<(), KernelError> {
        assert!(super_va.is_super_page_aligned(), "super_va={super_va:#x}");

        let pte = self
            .level1_entry_mut(super_va)
            .ok_or(KernelError::VirtualPageNotMapped(super_va))?;
        assert!(pte.is_leaf(), "demoting a non-leaf entry: va={super_va:#x}");

        let pa = pte.phys_addr();
        let flags = pte.flags();
        pte.clear();
        arch::sfence_vma();

        let mut table = match Self::try_allocate() {
            Ok(table) => table,
            Err(e) => {
                // Put the original leaf back, verbatim.
                let pte = self.level1_entry_mut(super_va).unwrap();
                pte.set_phys_addr(pa, flags);
                return Err(e);
            }
        };
        for (i, child) in table.0.iter_mut().enumerate() {
            child.set_phys_addr(pa.byte_add(i * PAGE_SIZE), flags);
        }

        let pte = self.level1_entry_mut(super_va).unwrap();
        pte.set_page_table(table);
        arch::sfence_vma();

        Ok(())
    }

    /// Returns the leaf PTE that translates `va`, together with the level
    /// it was found at (1 for a super page, 0 for a base page).
    pub(super) fn find_leaf_entry(&self, va: VirtAddr) -> Result<(usize, &PtEntry), KernelError> {
        if va >= VirtAddr::MAX {
            return Err(KernelError::TooLargeVirtualAddress(va.addr()));
        }

        let mut pt = self;
        for level in (0..=2).rev() {
            let index = Self::entry_index(level, va);
            let pte = &pt.0[index];
            if !pte.is_valid() {
                return Err(KernelError::VirtualPageNotMapped(va));
            }
            if pte.is_leaf() {
                assert!(level <= 1, "leaf at level {level}: va={va:#x}");
                return Ok((level, pte));
            }
            pt = pte.get_page_table().unwrap();
        }
        panic!("invalid page table: va={va:#x}");
    }

    /// Runs `f` on the PTE for `va` at `level` (0 or 1), descending from
    /// the root and allocating missing interior tables when
    /// `insert_new_table` is set.
    ///
    /// A leaf found above `level` short-circuits the descent and `f` runs
    /// on it instead.
    pub(super) fn update_leaf_entry<T, F>(
        &mut self,
        va: VirtAddr,
        level: usize,
        insert_new_table: bool,
        f: F,
    ) -> Result<T, KernelError>
    where
        F: for<'a> FnOnce(&'a mut PtEntry) -> T,
    {
        assert!(level <= 1);
        assert!(va < VirtAddr::MAX, "va={va:#x}");

        let mut pt = self;
        for l in (level + 1..=2).rev() {
            let index = Self::entry_index(l, va);
            if pt.0[index].is_leaf() {
                return Ok(f(&mut pt.0[index]));
            }
            if !pt.0[index].is_valid() {
                if !insert_new_table {
                    return Err(KernelError::VirtualPageNotMapped(va));
                }
                let new_pt = Self::try_allocate()?;
                pt.0[index].set_page_table(new_pt);
            }
            pt = pt.0[index].get_page_table_mut().unwrap();
        }

        let index = Self::entry_index(level, va);
        let pte = &mut pt.0[index];
        let res = f(pte);
        if level == 0 {
            // a level-0 PTE must be invalid or a leaf
            assert!(!pte.is_non_leaf());
        }
        Ok(res)
    }

    /// Returns the level-1 PTE covering `va`, if the level-2 entry above
    /// it points to a table.
    fn level1_entry_mut(&mut self, va: VirtAddr) -> Option<&mut PtEntry> {
        let index = Self::entry_index(2, va);
        let pt = self.0[index].get_page_table_mut()?;
        Some(&mut pt.0[Self::entry_index(1, va)])
    }

    /// Looks up a virtual address, returns the physical address it
    /// translates to.
    ///
    /// The leaf's granularity is honored: an address inside a super page
    /// resolves through the level-1 leaf.
    pub fn resolve_virtual_address(
        &self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<PhysAddr, KernelError> {
        let (level, pte) = self.find_leaf_entry(va)?;
        if !pte.flags().contains(flags) {
            return Err(KernelError::InaccessiblePage(va));
        }

        let offset = va.addr() % level_page_size(level);
        Ok(pte.phys_addr().byte_add(offset))
    }

    /// Fetches the bytes behind `va` up to the end of the leaf that maps
    /// it (4096 bytes or 2 MiB of backing).
    pub(super) fn fetch_chunk(
        &self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<&[u8], KernelError> {
        let (level, pte) = self.find_leaf_entry(va)?;
        if !pte.flags().contains(flags) {
            return Err(KernelError::InaccessiblePage(va));
        }

        let page_size = level_page_size(level);
        let offset = va.addr() % page_size;
        let page = unsafe { core::slice::from_raw_parts(pte.phys_addr().as_ptr(), page_size) };
        Ok(&page[offset..])
    }

    /// Fetches the bytes behind `va` mutably, up to the end of the leaf
    /// that maps it.
    #[expect(clippy::needless_pass_by_ref_mut)]
    pub(super) fn fetch_chunk_mut(
        &mut self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<&mut [u8], KernelError> {
        let (level, pte) = self.find_leaf_entry(va)?;
        if !pte.flags().contains(flags) {
            return Err(KernelError::InaccessiblePage(va));
        }

        let page_size = level_page_size(level);
        let offset = va.addr() % page_size;
        let page = unsafe {
            core::slice::from_raw_parts_mut(pte.phys_addr().as_mut_ptr().as_ptr(), page_size)
        };
        Ok(&mut page[offset..])
    }

    /// Recursively frees page-table pages.
    ///
    /// All leaf mappings must already have been removed.
    pub(super) fn free_descendant(&mut self) {
        for pte in &mut self.0 {
            assert!(
                !pte.is_valid() || pte.is_non_leaf(),
                "leaf mapping survived into the table free"
            );
            if let Some(mut pt) = pte.take_page_table() {
                pt.free_descendant();
                pte.clear();
            }
        }
    }

    /// Writes a structural dump of the tree: one line per valid PTE along
    /// a depth-first walk, indented by depth, with the reconstructed
    /// virtual address, the raw PTE word and the physical address.
    ///
    /// The format is a debugging aid, not a stable interface.
    pub fn write_dump<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        writeln!(w, "page table {:#x}", self.phys_addr().addr())?;
        self.write_dump_level(w, 2, VirtAddr::new(0))
    }

    fn write_dump_level<W: fmt::Write>(
        &self,
        w: &mut W,
        level: usize,
        va_base: VirtAddr,
    ) -> fmt::Result {
        for (i, pte) in self.0.iter().enumerate() {
            if !pte.is_valid() {
                continue;
            }
            let va = va_base.byte_add(i * level_page_size(level));
            for _ in level..=2 {
                write!(w, " ..")?;
            }
            writeln!(
                w,
                "{va:#x}: pte {pte:#x} pa {pa:#x}",
                pte = pte.bits(),
                pa = pte.phys_addr().addr(),
            )?;
            if let Some(pt) = pte.get_page_table() {
                pt.write_dump_level(w, level - 1, va)?;
            }
        }
        Ok(())
    }
}

bitflags! {
    /// Permission and status bits of a page-table entry.
    ///
    /// A valid entry that grants any of `R`/`W`/`X` is a leaf and maps
    /// memory directly: 2 MiB when it sits at level 1, 4096 bytes at
    /// level 0. A valid entry granting none of them points at the next
    /// table level. Demotion copies a level-1 leaf's bits unchanged onto
    /// 512 level-0 leaves, so everything here is granularity-neutral.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtEntryFlags: usize {
        /// Valid: the hardware walker considers this entry at all.
        const V = 1 << 0;

        /// Loads through the mapping are permitted.
        const R = 1 << 1;

        /// Stores through the mapping are permitted. The copy-out path
        /// insists on this bit so read-only user text stays read-only.
        const W = 1 << 2;

        /// Instruction fetches through the mapping are permitted.
        const X = 1 << 3;

        /// User mode may use the mapping. Every page of the user region
        /// carries this bit; the stack guard page has it stripped again.
        const U = 1 << 4;

        /// The translation is present in every address space.
        const G = 1 << 5;

        /// Accessed: set by hardware on first use of the mapping.
        const A = 1 << 6;

        /// Dirty: set by hardware on first store through the mapping.
        const D = 1 << 7;

        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
        const UR = Self::U.bits() | Self::R.bits();
        const UW = Self::U.bits() | Self::W.bits();
        const URW = Self::U.bits() | Self::RW.bits();
        const URX = Self::U.bits() | Self::RX.bits();
        const URWX = Self::U.bits() | Self::RWX.bits();
    }
}

/// Iterator that removes the mappings of a virtual range, yielding the
/// level and physical address of every mapping it removes so the caller
/// can decide which pool the backing goes back to.
///
/// Dropping the iterator finishes the unmap and issues the TLB fence for
/// any 4096-byte entries it cleared; the super-page path fences inline.
pub(super) struct UnmapPages<'a> {
    pt: &'a mut PageTable,
    va: VirtAddr,
    end: VirtAddr,
    cleared: bool,
}

impl Iterator for UnmapPages<'_> {
    type Item = (usize, PhysAddr);

    fn next(&mut self) -> Option<Self::Item> {
        while self.va < self.end {
            let va = self.va;

            if let Some(pte) = self.pt.level1_entry_mut(va) {
                if pte.is_leaf() {
                    let super_start = va.super_page_rounddown();
                    let super_end = super_start.byte_add(SUPER_PAGE_SIZE);
                    if va == super_start && super_end <= self.end {
                        // the range swallows the whole super page
                        let pa = pte.phys_addr();
                        pte.clear();
                        arch::sfence_vma();
                        self.va = super_end;
                        return Some((1, pa));
                    }
                    // the range clips the super page; break it up and
                    // retry this address at base granularity
                    self.pt
                        .demote_super_page(super_start)
                        .expect("super page demotion failed");
                    continue;
                }
            }

            self.va = va.byte_add(PAGE_SIZE);
            let res = self.pt.update_leaf_entry(va, 0, false, |pte| {
                if !pte.is_valid() {
                    return None;
                }
                assert!(pte.is_leaf(), "not a leaf: va={va:#x}");
                let pa = pte.phys_addr();
                pte.clear();
                Some(pa)
            });
            match res {
                Ok(Some(pa)) => {
                    self.cleared = true;
                    return Some((0, pa));
                }
                // an unmapped hole, at this or some higher level
                Ok(None) | Err(_) => {}
            }
        }
        None
    }
}

impl Drop for UnmapPages<'_> {
    fn drop(&mut self) {
        for _ in &mut *self {}
        if self.cleared {
            arch::sfence_vma();
        }
    }
}

/// One Sv39 page-table entry: the target's physical page number packed
/// above the [`PtEntryFlags`] bits.
///
/// The node an entry lives in decides what a leaf here spans. Demotion
/// depends on that: it rebuilds one level-1 leaf's translation exactly
/// from 512 `(phys_addr, flags)` pairs written at level 0.
#[repr(transparent)]
#[derive(Pod)]
pub(super) struct PtEntry(usize);

impl PtEntry {
    /// The PPN starts at bit 10; below it sit the eight architectural
    /// flag bits and two software bits this kernel leaves at zero.
    const PPN_SHIFT: usize = 10;
    const FLAGS_MASK: usize = (1 << Self::PPN_SHIFT) - 1;

    fn new(ppn: PhysPageNum, flags: PtEntryFlags) -> Self {
        assert_eq!(
            flags.bits() & Self::FLAGS_MASK,
            flags.bits(),
            "flag bits collide with the PPN field: {flags:?}"
        );
        Self((ppn.value() << Self::PPN_SHIFT) | flags.bits())
    }

    /// The raw word, as the hardware walker reads it.
    fn bits(&self) -> usize {
        self.0
    }

    /// The child table this entry points at; `None` for leaves and for
    /// invalid entries.
    fn get_page_table(&self) -> Option<&PageTable> {
        self.is_non_leaf()
            .then(|| unsafe { self.phys_addr().as_mut_ptr::<PageTable>().as_ref() })
    }

    fn get_page_table_mut(&mut self) -> Option<&mut PageTable> {
        self.is_non_leaf()
            .then(|| unsafe { self.phys_addr().as_mut_ptr::<PageTable>().as_mut() })
    }

    /// Points this entry at `pt`. The tree owns the node from here on
    /// and reclaims it through [`take_page_table`](Self::take_page_table).
    fn set_page_table(&mut self, pt: Box<PageTable, PageFrameAllocator>) {
        assert!(!self.is_valid(), "overwriting a live entry");
        let ppn = pt.phys_page_num();
        Box::leak(pt);
        *self = Self::new(ppn, PtEntryFlags::V);
    }

    /// Detaches the child table and clears the entry; dropping the
    /// returned box gives the node back to the frame pool.
    fn take_page_table(&mut self) -> Option<Box<PageTable, PageFrameAllocator>> {
        self.is_non_leaf().then(|| {
            let ptr = self.phys_addr().as_mut_ptr();
            let pt = unsafe { Box::from_raw_in(ptr.as_ptr(), PageFrameAllocator) };
            self.clear();
            pt
        })
    }

    /// Physical page number of the target.
    pub(super) fn phys_page_num(&self) -> PhysPageNum {
        PhysPageNum::new(self.0 >> Self::PPN_SHIFT)
    }

    fn set_phys_page_num(&mut self, ppn: PhysPageNum, flags: PtEntryFlags) {
        assert!(!self.is_valid(), "overwriting a live entry");
        assert!(
            flags.contains(PtEntryFlags::V),
            "installing an invalid translation"
        );
        *self = Self::new(ppn, flags);
    }

    /// Base of the physical range this entry maps: 2 MiB wide for a
    /// level-1 leaf, one page for a level-0 leaf or a table pointer.
    pub(super) fn phys_addr(&self) -> PhysAddr {
        self.phys_page_num().phys_addr()
    }

    pub(super) fn set_phys_addr(&mut self, pa: PhysAddr, flags: PtEntryFlags) {
        self.set_phys_page_num(pa.phys_page_num(), flags);
    }

    /// Whether the hardware walker would look at this entry at all.
    pub(super) fn is_valid(&self) -> bool {
        self.flags().contains(PtEntryFlags::V)
    }

    /// A valid entry that grants some access: it maps memory rather
    /// than pointing at another table.
    pub(super) fn is_leaf(&self) -> bool {
        self.is_valid() && self.flags().intersects(PtEntryFlags::RWX)
    }

    /// A valid entry with no access bits: a pointer to the next level.
    pub(super) fn is_non_leaf(&self) -> bool {
        self.is_valid() && !self.is_leaf()
    }

    /// The flag bits currently stored in the entry.
    pub(super) fn flags(&self) -> PtEntryFlags {
        PtEntryFlags::from_bits_retain(self.0 & Self::FLAGS_MASK)
    }

    /// Replaces the flag bits, leaving the PPN alone. Used to take `U`
    /// away from the stack guard page.
    pub(super) fn set_flags(&mut self, flags: PtEntryFlags) {
        self.0 = (self.0 & !Self::FLAGS_MASK) | flags.bits();
    }

    /// Empties the entry; the hardware walker skips it afterwards.
    pub(super) fn clear(&mut self) {
        self.0 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::page;

    fn new_root() -> Box<PageTable, PageFrameAllocator> {
        PageTable::try_allocate().unwrap()
    }

    #[test]
    fn map_then_resolve_then_unmap() {
        let _guard = page::test_support::lock();
        let pages_before = page::free_page_count();

        let mut pt = new_root();
        let frame = page::alloc_page().unwrap();
        let pa = PhysAddr::from_ptr(frame);
        let va = VirtAddr::new(0x4_2000);

        pt.map_pages(va, PAGE_SIZE, pa, PtEntryFlags::URW).unwrap();
        assert_eq!(
            pt.resolve_virtual_address(va, PtEntryFlags::UR).unwrap(),
            pa
        );
        assert_eq!(
            pt.resolve_virtual_address(va.byte_add(123), PtEntryFlags::UR)
                .unwrap(),
            pa.byte_add(123)
        );

        let unmapped: Vec<_> = pt.unmap_pages(va, 1).collect();
        assert_eq!(unmapped, [(0, pa)]);
        assert!(pt.resolve_virtual_address(va, PtEntryFlags::UR).is_err());

        unsafe {
            page::free_page(frame);
        }
        pt.free_descendant();
        drop(pt);
        assert_eq!(page::free_page_count(), pages_before);
    }

    #[test]
    fn resolve_checks_permissions() {
        let _guard = page::test_support::lock();

        let mut pt = new_root();
        let frame = page::alloc_page().unwrap();
        let va = VirtAddr::new(0x8000);

        pt.map_page(va, PhysAddr::from_ptr(frame), PtEntryFlags::URW)
            .unwrap();
        assert!(pt.resolve_virtual_address(va, PtEntryFlags::URW).is_ok());
        assert!(matches!(
            pt.resolve_virtual_address(va, PtEntryFlags::X),
            Err(KernelError::InaccessiblePage(_))
        ));

        pt.unmap_pages(va, 1).for_each(drop);
        unsafe {
            page::free_page(frame);
        }
        pt.free_descendant();
    }

    #[test]
    fn resolve_rejects_an_out_of_range_address() {
        let _guard = page::test_support::lock();

        let pt = new_root();
        assert!(matches!(
            pt.resolve_virtual_address(VirtAddr::MAX, PtEntryFlags::UR),
            Err(KernelError::TooLargeVirtualAddress(_))
        ));
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn remapping_a_live_entry_panics() {
        let _guard = page::test_support::lock();

        let mut pt = new_root();
        let frame = page::alloc_page().unwrap();
        let pa = PhysAddr::from_ptr(frame);
        let va = VirtAddr::new(0x3000);

        pt.map_page(va, pa, PtEntryFlags::URW).unwrap();
        pt.map_page(va, pa, PtEntryFlags::URW).unwrap();
    }

    #[test]
    fn super_page_maps_as_one_leaf() {
        let _guard = page::test_support::lock();

        let mut pt = new_root();
        let frame = page::alloc_super_page().unwrap();
        let pa = PhysAddr::from_ptr(frame);
        let va = VirtAddr::new(4 * SUPER_PAGE_SIZE);

        pt.map_super_pages(va, SUPER_PAGE_SIZE, pa, PtEntryFlags::URW)
            .unwrap();

        let (level, _) = pt.find_leaf_entry(va).unwrap();
        assert_eq!(level, 1);
        // interior addresses resolve through the level-1 leaf
        let offset = 1234 * PAGE_SIZE / 4 + 321;
        assert_eq!(
            pt.resolve_virtual_address(va.byte_add(offset), PtEntryFlags::UR)
                .unwrap(),
            pa.byte_add(offset)
        );

        let unmapped: Vec<_> = pt.unmap_pages(va, 512).collect();
        assert_eq!(unmapped, [(1, pa)]);

        unsafe {
            page::free_super_page(frame);
        }
        pt.free_descendant();
    }

    #[test]
    fn demotion_preserves_translations_and_flags() {
        let _guard = page::test_support::lock();
        let pages_before = page::free_page_count();
        let supers_before = page::free_super_page_count();

        let mut pt = new_root();
        let frame = page::alloc_super_page().unwrap();
        let pa = PhysAddr::from_ptr(frame);
        let va = VirtAddr::new(6 * SUPER_PAGE_SIZE);

        pt.map_super_pages(va, SUPER_PAGE_SIZE, pa, PtEntryFlags::URX)
            .unwrap();
        let before: Vec<_> = (0..512)
            .map(|i| {
                let va = va.byte_add(i * PAGE_SIZE);
                let resolved = pt.resolve_virtual_address(va, PtEntryFlags::U).unwrap();
                let flags = pt.find_leaf_entry(va).unwrap().1.flags();
                (resolved, flags)
            })
            .collect();

        pt.demote_super_page(va).unwrap();

        for (i, (resolved, flags)) in before.iter().enumerate() {
            let va = va.byte_add(i * PAGE_SIZE);
            let (level, pte) = pt.find_leaf_entry(va).unwrap();
            assert_eq!(level, 0);
            assert_eq!(pte.flags(), *flags);
            assert_eq!(
                pt.resolve_virtual_address(va, PtEntryFlags::U).unwrap(),
                *resolved
            );
        }

        // the demoted backing goes back page by page, never as a super page
        for (level, pa) in pt.unmap_pages(va, 512) {
            assert_eq!(level, 0);
            unsafe {
                page::free_page(pa.as_mut_ptr());
            }
        }
        pt.free_descendant();
        drop(pt);

        assert_eq!(page::free_page_count(), pages_before + 512);
        assert_eq!(page::free_super_page_count(), supers_before - 1);
    }

    #[test]
    fn clipping_unmap_demotes_and_keeps_the_rest() {
        let _guard = page::test_support::lock();

        let mut pt = new_root();
        let frame = page::alloc_super_page().unwrap();
        let pa = PhysAddr::from_ptr(frame);
        let va = VirtAddr::new(2 * SUPER_PAGE_SIZE);

        pt.map_super_pages(va, SUPER_PAGE_SIZE, pa, PtEntryFlags::URW)
            .unwrap();

        // remove only the first half
        let mut freed = 0;
        for (level, page_pa) in pt.unmap_pages(va, 256) {
            assert_eq!(level, 0);
            assert_eq!(page_pa, pa.byte_add(freed * PAGE_SIZE));
            unsafe {
                page::free_page(page_pa.as_mut_ptr());
            }
            freed += 1;
        }
        assert_eq!(freed, 256);

        // the upper half survives at base granularity
        let upper = va.byte_add(256 * PAGE_SIZE);
        assert!(pt.resolve_virtual_address(va, PtEntryFlags::UR).is_err());
        let (level, _) = pt.find_leaf_entry(upper).unwrap();
        assert_eq!(level, 0);
        assert_eq!(
            pt.resolve_virtual_address(upper, PtEntryFlags::UR).unwrap(),
            pa.byte_add(256 * PAGE_SIZE)
        );

        for (level, page_pa) in pt.unmap_pages(upper, 256) {
            assert_eq!(level, 0);
            unsafe {
                page::free_page(page_pa.as_mut_ptr());
            }
        }
        pt.free_descendant();
    }

    #[test]
    fn unmap_skips_holes() {
        let _guard = page::test_support::lock();

        let mut pt = new_root();
        let frame = page::alloc_page().unwrap();
        let pa = PhysAddr::from_ptr(frame);
        let va = VirtAddr::new(0x10_0000);

        pt.map_page(va.byte_add(4 * PAGE_SIZE), pa, PtEntryFlags::URW)
            .unwrap();

        // eight pages, one of which is mapped
        let unmapped: Vec<_> = pt.unmap_pages(va, 8).collect();
        assert_eq!(unmapped, [(0, pa)]);

        unsafe {
            page::free_page(frame);
        }
        pt.free_descendant();
    }

    #[test]
    fn demotion_rolls_back_when_no_table_is_available() {
        let _guard = page::test_support::lock();

        let mut pt = new_root();
        let frame = page::alloc_super_page().unwrap();
        let pa = PhysAddr::from_ptr(frame);
        let va = VirtAddr::new(SUPER_PAGE_SIZE);

        pt.map_super_pages(va, SUPER_PAGE_SIZE, pa, PtEntryFlags::URW)
            .unwrap();

        // run the page pool dry
        let mut hoard = vec![];
        while let Ok(p) = page::alloc_page() {
            hoard.push(p);
        }

        assert!(matches!(
            pt.demote_super_page(va),
            Err(KernelError::NoFreePage)
        ));
        // the super page mapping is still intact
        let (level, _) = pt.find_leaf_entry(va).unwrap();
        assert_eq!(level, 1);
        assert_eq!(
            pt.resolve_virtual_address(va.byte_add(77), PtEntryFlags::UR)
                .unwrap(),
            pa.byte_add(77)
        );

        for p in hoard {
            unsafe {
                page::free_page(p);
            }
        }

        pt.demote_super_page(va).unwrap();
        for (_, page_pa) in pt.unmap_pages(va, 512) {
            unsafe {
                page::free_page(page_pa.as_mut_ptr());
            }
        }
        pt.free_descendant();
    }

    #[test]
    #[should_panic(expected = "leaf mapping survived")]
    fn table_free_panics_on_a_surviving_leaf() {
        let _guard = page::test_support::lock();

        let mut pt = new_root();
        let frame = page::alloc_page().unwrap();
        pt.map_page(
            VirtAddr::new(0x7000),
            PhysAddr::from_ptr(frame),
            PtEntryFlags::URW,
        )
        .unwrap();
        pt.free_descendant();
    }

    #[test]
    fn dump_reflects_the_tree_shape() {
        let _guard = page::test_support::lock();

        let mut pt = new_root();
        let f0 = page::alloc_page().unwrap();
        let f1 = page::alloc_page().unwrap();
        let sf = page::alloc_super_page().unwrap();

        pt.map_page(VirtAddr::new(0), PhysAddr::from_ptr(f0), PtEntryFlags::URX)
            .unwrap();
        pt.map_page(
            VirtAddr::new(PAGE_SIZE),
            PhysAddr::from_ptr(f1),
            PtEntryFlags::URW,
        )
        .unwrap();
        pt.map_super_pages(
            VirtAddr::new(SUPER_PAGE_SIZE),
            SUPER_PAGE_SIZE,
            PhysAddr::from_ptr(sf),
            PtEntryFlags::URW,
        )
        .unwrap();

        let mut out = String::new();
        pt.write_dump(&mut out).unwrap();
        let lines: Vec<&str> = out.lines().collect();

        assert!(lines[0].starts_with("page table 0x"));
        let d3 = lines
            .iter()
            .filter(|l| l.starts_with(" .. .. ..0x"))
            .count();
        let d2 = lines.iter().filter(|l| l.starts_with(" .. ..0x")).count();
        let d1 = lines.iter().filter(|l| l.starts_with(" ..0x")).count();
        // one level-2 entry over a level-1 table holding one internal
        // entry and one super-page leaf, and two level-0 leaves below
        assert_eq!((d1, d2, d3), (1, 2, 2));

        for (level, pa) in pt.unmap_pages(VirtAddr::new(0), 1024) {
            match level {
                0 => unsafe { page::free_page(pa.as_mut_ptr()) },
                _ => unsafe { page::free_super_page(pa.as_mut_ptr()) },
            }
        }
        pt.free_descendant();
    }

    #[test]
    fn map_fails_cleanly_when_tables_cannot_grow() {
        let _guard = page::test_support::lock();

        let mut pt = new_root();
        let frame = page::alloc_page().unwrap();

        let mut hoard = vec![];
        while let Ok(p) = page::alloc_page() {
            hoard.push(p);
        }

        assert!(matches!(
            pt.map_page(
                VirtAddr::new(0x9000),
                PhysAddr::from_ptr(frame),
                PtEntryFlags::URW
            ),
            Err(KernelError::NoFreePage)
        ));
        assert!(pt
            .resolve_virtual_address(VirtAddr::new(0x9000), PtEntryFlags::UR)
            .is_err());

        for p in hoard {
            unsafe {
                page::free_page(p);
            }
        }
        unsafe {
            page::free_page(frame);
        }
        pt.free_descendant();
    }
}
