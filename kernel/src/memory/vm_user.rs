use alloc::boxed::Box;
use core::fmt;

use dataview::{Pod, PodMethods as _};

use super::{
    PAGE_SIZE, PageRound as _, PhysAddr, SUPER_PAGE_SIZE, VirtAddr,
    page::{self, PageFrameAllocator},
    page_table::{PageTable, PtEntryFlags},
};
use crate::error::KernelError;

/// A user address space: the root of its page-table tree plus the size in
/// bytes of the user region starting at virtual address zero.
///
/// Every address in `[0, size)` is either mapped or reserved for a demand
/// fault; nothing is mapped at or above `size` except what the kernel
/// places there explicitly. The caller serializes access through the
/// process lock.
pub struct UserPageTable {
    pt: Box<PageTable, PageFrameAllocator>,
    size: usize,
}

impl UserPageTable {
    /// Creates an empty user page table.
    pub fn new() -> Result<Self, KernelError> {
        Ok(Self {
            pt: PageTable::try_allocate()?,
            size: 0,
        })
    }

    /// Size in bytes of the user region.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Physical address of the root table; the trap return path programs
    /// the page-table base register from it.
    pub fn root_phys_addr(&self) -> PhysAddr {
        self.pt.phys_addr()
    }

    /// Grows the user region to `new_size` bytes, which need not be
    /// page-aligned. Returns the new size.
    ///
    /// The new range is populated in three runs: 4096-byte pages up to the
    /// next 2 MiB boundary, whole super pages while they still fit, and a
    /// 4096-byte tail. A chunk whose super page cannot be had falls back
    /// to 512 base pages. On any failure the region is rolled back to its
    /// previous size and nothing is leaked.
    pub fn grow(&mut self, new_size: usize, xperm: PtEntryFlags) -> Result<usize, KernelError> {
        if new_size <= self.size {
            return Ok(self.size);
        }
        if new_size > VirtAddr::MAX.addr() {
            return Err(KernelError::TooLargeVirtualAddress(new_size));
        }

        let old_size = self.size;
        match self.grow_pages(new_size, xperm | PtEntryFlags::UR) {
            Ok(()) => {
                self.size = new_size;
                Ok(new_size)
            }
            Err(e) => {
                self.shrink(old_size);
                Err(e)
            }
        }
    }

    fn grow_pages(&mut self, new_size: usize, perm: PtEntryFlags) -> Result<(), KernelError> {
        let mut va = VirtAddr::new(self.size.page_roundup());
        let end = VirtAddr::new(new_size);

        // 4096-byte pages up to the next super page boundary
        let super_start = va.super_page_roundup();
        while va < end && va < super_start {
            self.map_user_page(va, perm)?;
            va = va.byte_add(PAGE_SIZE);
        }

        // whole super pages while they fit
        while va.byte_add(SUPER_PAGE_SIZE) <= end {
            self.size = va.addr();
            match page::alloc_super_page() {
                Ok(mem) => {
                    if !cfg!(feature = "deferred-zeroing") {
                        unsafe {
                            mem.write_bytes(0, SUPER_PAGE_SIZE);
                        }
                    }
                    if let Err(e) =
                        self.pt
                            .map_super_pages(va, SUPER_PAGE_SIZE, PhysAddr::from_ptr(mem), perm)
                    {
                        unsafe {
                            page::free_super_page(mem);
                        }
                        return Err(e);
                    }
                    va = va.byte_add(SUPER_PAGE_SIZE);
                }
                Err(KernelError::NoFreeSuperPage) => {
                    // the pool is dry; cover this chunk with base pages
                    let chunk_end = va.byte_add(SUPER_PAGE_SIZE);
                    while va < chunk_end {
                        self.map_user_page(va, perm)?;
                        va = va.byte_add(PAGE_SIZE);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // 4096-byte tail
        while va < end {
            self.map_user_page(va, perm)?;
            va = va.byte_add(PAGE_SIZE);
        }

        Ok(())
    }

    /// Maps one fresh page at `va`, recording the progress in `size` so a
    /// failed grow can unwind exactly the prefix it installed.
    fn map_user_page(&mut self, va: VirtAddr, perm: PtEntryFlags) -> Result<(), KernelError> {
        self.size = va.addr();

        let mem = if cfg!(feature = "deferred-zeroing") {
            page::alloc_page()?
        } else {
            page::alloc_zeroed_page()?
        };
        if let Err(e) = self.pt.map_page(va, PhysAddr::from_ptr(mem), perm) {
            unsafe {
                page::free_page(mem);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Raises the region size without mapping anything; the new pages are
    /// reserved and faulted in on first touch.
    pub fn grow_lazy(&mut self, new_size: usize) -> Result<usize, KernelError> {
        if new_size <= self.size {
            return Ok(self.size);
        }
        if new_size > VirtAddr::MAX.addr() {
            return Err(KernelError::TooLargeVirtualAddress(new_size));
        }

        self.size = new_size;
        Ok(new_size)
    }

    /// Shrinks the user region to `new_size` bytes, freeing the memory
    /// behind it. Returns the new size.
    ///
    /// A super page the new boundary clips is demoted and only its tail
    /// beyond the boundary is freed; whole super pages in the range go
    /// back to the super page pool as units.
    pub fn shrink(&mut self, new_size: usize) -> usize {
        if new_size >= self.size {
            return self.size;
        }

        if new_size.page_roundup() < self.size.page_roundup() {
            let npages = (self.size.page_roundup() - new_size.page_roundup()) / PAGE_SIZE;
            unmap(
                &mut self.pt,
                VirtAddr::new(new_size.page_roundup()),
                npages,
                true,
            );
        }

        self.size = new_size;
        new_size
    }

    /// Copies this address space's mappings and memory into `target`,
    /// which must be empty.
    ///
    /// A super page is copied as one unit when the pool permits;
    /// otherwise the parent's super page is demoted and the copy retries
    /// the same address at 4096-byte granularity. On failure `target` is
    /// emptied again.
    pub fn try_clone_into(&mut self, target: &mut Self) -> Result<(), KernelError> {
        assert_eq!(target.size, 0, "clone target is not empty");

        let res = self.clone_pages_into(target);
        if res.is_err() {
            let npages = target.size.page_roundup() / PAGE_SIZE;
            unmap(&mut target.pt, VirtAddr::new(0), npages, true);
            target.size = 0;
        }
        res
    }

    fn clone_pages_into(&mut self, target: &mut Self) -> Result<(), KernelError> {
        let size = self.size;
        let mut va = VirtAddr::new(0);
        let end = VirtAddr::new(size);

        while va < end {
            target.size = va.addr();

            let (level, src_pa, flags) = match self.pt.find_leaf_entry(va) {
                // a hole reserved for a demand fault
                Err(KernelError::VirtualPageNotMapped(_)) => {
                    va = va.byte_add(PAGE_SIZE);
                    continue;
                }
                Err(e) => return Err(e),
                Ok((level, pte)) => (level, pte.phys_addr(), pte.flags()),
            };

            if level == 1 {
                debug_assert!(va.is_super_page_aligned());
                match page::alloc_super_page() {
                    Ok(dst) => {
                        unsafe {
                            dst.as_ptr().copy_from(src_pa.as_ptr(), SUPER_PAGE_SIZE);
                        }
                        if let Err(e) = target.pt.map_super_pages(
                            va,
                            SUPER_PAGE_SIZE,
                            PhysAddr::from_ptr(dst),
                            flags,
                        ) {
                            unsafe {
                                page::free_super_page(dst);
                            }
                            return Err(e);
                        }
                        va = va.byte_add(SUPER_PAGE_SIZE);
                    }
                    Err(KernelError::NoFreeSuperPage) => {
                        // no super page for the child; break up the
                        // parent's and retry this address
                        self.pt.demote_super_page(va)?;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                let dst = page::alloc_page()?;
                unsafe {
                    dst.as_ptr().copy_from(src_pa.as_ptr(), PAGE_SIZE);
                }
                if let Err(e) = target.pt.map_page(va, PhysAddr::from_ptr(dst), flags) {
                    unsafe {
                        page::free_page(dst);
                    }
                    return Err(e);
                }
                va = va.byte_add(PAGE_SIZE);
            }
        }

        target.size = size;
        Ok(())
    }

    /// Allocates and maps one zeroed page for a demand fault at `va`.
    ///
    /// Returns the backing physical address, or `None` when `va` lies
    /// outside the user region, is already mapped, or memory is
    /// exhausted; the trap layer turns `None` into a fault signal for the
    /// process.
    pub fn handle_fault(&mut self, va: VirtAddr, _read: bool) -> Option<PhysAddr> {
        if va.addr() >= self.size {
            return None;
        }
        let va = va.page_rounddown();
        if self.is_mapped(va) {
            return None;
        }

        let mem = page::alloc_zeroed_page().ok()?;
        let pa = PhysAddr::from_ptr(mem);
        if self.pt.map_page(va, pa, PtEntryFlags::URW).is_err() {
            unsafe {
                page::free_page(mem);
            }
            return None;
        }
        Some(pa)
    }

    /// Returns `true` if `va` has a live translation, at either
    /// granularity.
    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        self.pt.find_leaf_entry(va).is_ok()
    }

    /// Looks up `va`, requiring the mapping to carry `flags`.
    pub fn resolve(&self, va: VirtAddr, flags: PtEntryFlags) -> Result<PhysAddr, KernelError> {
        self.pt.resolve_virtual_address(va, flags)
    }

    /// Marks the PTE for `va` invalid for user access.
    ///
    /// Used for the user stack guard page.
    ///
    /// # Panics
    ///
    /// Panics if nothing is mapped at `va`.
    pub fn forbid_user_access(&mut self, va: VirtAddr) {
        self.pt
            .update_leaf_entry(va, 0, false, |pte| {
                let mut flags = pte.flags();
                flags.remove(PtEntryFlags::U);
                pte.set_flags(flags);
            })
            .expect("guard page must be mapped");
    }

    /// Copies `src` to `dst_va` in this address space.
    pub fn copy_out<T: Pod>(&mut self, dst_va: VirtAddr, src: &T) -> Result<(), KernelError> {
        self.copy_out_bytes(dst_va, src.as_bytes())
    }

    /// Copies from kernel to user, faulting reserved pages in.
    ///
    /// The destination must be user-writable; read-only user text is
    /// refused.
    pub fn copy_out_bytes(
        &mut self,
        mut dst_va: VirtAddr,
        mut src: &[u8],
    ) -> Result<(), KernelError> {
        while !src.is_empty() {
            let chunk = self.fetch_chunk_mut_faulting(dst_va, PtEntryFlags::UW)?;
            let n = usize::min(src.len(), chunk.len());
            chunk[..n].copy_from_slice(&src[..n]);
            src = &src[n..];
            dst_va = dst_va.byte_add(n);
        }
        Ok(())
    }

    /// Copies the `T` at `src_va` out of this address space.
    pub fn copy_in<T: Pod>(&mut self, src_va: VirtAddr) -> Result<T, KernelError> {
        let mut dst = T::zeroed();
        self.copy_in_bytes(dst.as_bytes_mut(), src_va)?;
        Ok(dst)
    }

    /// Copies from user to kernel, faulting reserved pages in.
    pub fn copy_in_bytes(
        &mut self,
        mut dst: &mut [u8],
        mut src_va: VirtAddr,
    ) -> Result<(), KernelError> {
        while !dst.is_empty() {
            let chunk = self.fetch_chunk_faulting(src_va, PtEntryFlags::UR)?;
            let n = usize::min(dst.len(), chunk.len());
            dst[..n].copy_from_slice(&chunk[..n]);
            dst = &mut dst[n..];
            src_va = src_va.byte_add(n);
        }
        Ok(())
    }

    /// Copies a nul-terminated string from `src_va` into `dst`.
    ///
    /// Stops at the first `\0`; it is an error if `dst` fills up before a
    /// terminator is seen.
    pub fn copy_in_str(
        &mut self,
        mut dst: &mut [u8],
        mut src_va: VirtAddr,
    ) -> Result<(), KernelError> {
        while !dst.is_empty() {
            let chunk = self.fetch_chunk_faulting(src_va, PtEntryFlags::UR)?;
            let n = usize::min(dst.len(), chunk.len());
            match memchr::memchr(b'\0', &chunk[..n]) {
                Some(i) => {
                    dst[..i].copy_from_slice(&chunk[..i]);
                    dst[i] = b'\0';
                    return Ok(());
                }
                None => {
                    dst[..n].copy_from_slice(&chunk[..n]);
                    dst = &mut dst[n..];
                    src_va = src_va.byte_add(n);
                }
            }
        }
        Err(KernelError::UnterminatedString)
    }

    fn fetch_chunk_faulting(
        &mut self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<&[u8], KernelError> {
        self.fault_in(va)?;
        self.pt.fetch_chunk(va, flags)
    }

    fn fetch_chunk_mut_faulting(
        &mut self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<&mut [u8], KernelError> {
        self.fault_in(va)?;
        self.pt.fetch_chunk_mut(va, flags)
    }

    /// Faults the page behind `va` in if the address sits in the lazily
    /// reserved part of the region.
    fn fault_in(&mut self, va: VirtAddr) -> Result<(), KernelError> {
        match self.pt.find_leaf_entry(va) {
            Ok(_) => Ok(()),
            Err(e @ KernelError::VirtualPageNotMapped(_)) => {
                if self.handle_fault(va, false).is_none() {
                    return Err(e);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Writes the structural dump of this address space's page table.
    pub fn dump<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        self.pt.write_dump(w)
    }
}

impl Drop for UserPageTable {
    fn drop(&mut self) {
        if self.size > 0 {
            unmap(
                &mut self.pt,
                VirtAddr::new(0),
                self.size.page_roundup() / PAGE_SIZE,
                true,
            );
        }
        self.pt.free_descendant();
    }
}

/// Removes `npages` of mappings starting from `va`.
///
/// `va` must be page-aligned. The mappings need not exist. Optionally
/// frees the physical memory, returning each backing to the pool of its
/// granularity.
pub(super) fn unmap(pt: &mut PageTable, va: VirtAddr, npages: usize, do_free: bool) {
    for (level, pa) in pt.unmap_pages(va, npages) {
        if !do_free {
            continue;
        }
        match level {
            0 => unsafe { page::free_page(pa.as_mut_ptr()) },
            1 => unsafe { page::free_super_page(pa.as_mut_ptr()) },
            _ => unreachable!(),
        }
    }
}
