//! Physical memory allocator, for user processes,
//! page-table pages and kernel stacks.
//!
//! Hands out whole 4096-byte pages and naturally aligned 2 MiB super
//! pages from two fixed pools behind one spinlock. The lock is only held
//! across free-list link updates; the junk and zero fills happen on frames
//! nothing else can see yet.

use core::{
    alloc::{AllocError, Allocator, Layout},
    ops::Range,
    ptr::NonNull,
};

use frame_alloc::FrameAllocator;

use super::{PAGE_SIZE, PageRound as _, SUPER_PAGE_SIZE};
use crate::{
    error::KernelError,
    param::NSUPER_PAGE,
    sync::{Once, SpinLock},
};

/// Byte pattern a frame carries after it is handed out.
const ALLOC_JUNK: u8 = 5;
/// Byte pattern a frame carries after it is returned.
const FREE_JUNK: u8 = 1;

static ALLOCATOR: Once<SpinLock<FrameAllocator<PAGE_SIZE, SUPER_PAGE_SIZE>>> = Once::new();
static FRAME_RANGE: Once<Range<usize>> = Once::new();

/// Hands `[pa_start, pa_end)` to the allocator.
///
/// A fixed prefix of [`NSUPER_PAGE`] naturally aligned super pages is
/// carved off the low end; everything else becomes 4096-byte pages.
pub fn init(pa_start: NonNull<u8>, pa_end: NonNull<u8>) {
    let pa_start = pa_start.page_roundup();
    let pa_end = pa_end.page_rounddown();

    FRAME_RANGE.init(pa_start.addr().get()..pa_end.addr().get());
    unsafe {
        ALLOCATOR.init(SpinLock::new(FrameAllocator::new(
            pa_start.as_ptr()..pa_end.as_ptr(),
            NSUPER_PAGE,
        )));
    }
}

fn check_frame(pa: NonNull<u8>, align: usize) {
    let range = FRAME_RANGE.get();
    assert!(range.contains(&pa.addr().get()), "pa = {pa:#p}");
    assert_eq!(pa.addr().get() % align, 0, "pa = {pa:#p}");
}

/// Allocates one 4096-byte page of physical memory, filled with junk to
/// catch use before initialization.
///
/// Returns a pointer that the kernel can use.
pub fn alloc_page() -> Result<NonNull<u8>, KernelError> {
    let pa = ALLOCATOR
        .get()
        .lock()
        .alloc()
        .ok_or(KernelError::NoFreePage)?;
    unsafe {
        pa.write_bytes(ALLOC_JUNK, PAGE_SIZE);
    }
    Ok(pa)
}

/// Allocates one 4096-byte zeroed page of physical memory.
pub fn alloc_zeroed_page() -> Result<NonNull<u8>, KernelError> {
    let pa = ALLOCATOR
        .get()
        .lock()
        .alloc()
        .ok_or(KernelError::NoFreePage)?;
    unsafe {
        pa.write_bytes(0, PAGE_SIZE);
    }
    Ok(pa)
}

/// Frees the page of physical memory pointed at by `pa`, which normally
/// should have been returned by a call to [`alloc_page`].
///
/// # Panics
///
/// Panics if `pa` is misaligned or outside the managed range.
///
/// # Safety
///
/// The page must not be accessed after it has been freed, and must not be
/// freed more than once.
pub unsafe fn free_page(pa: NonNull<u8>) {
    check_frame(pa, PAGE_SIZE);

    // Fill with junk to catch dangling refs.
    unsafe {
        pa.write_bytes(FREE_JUNK, PAGE_SIZE);
    }
    unsafe { ALLOCATOR.get().lock().free(pa) }
}

/// Allocates one naturally aligned 2 MiB super page, filled with junk.
///
/// An empty super page pool is an expected condition; callers fall back
/// to 4096-byte pages.
pub fn alloc_super_page() -> Result<NonNull<u8>, KernelError> {
    let pa = ALLOCATOR
        .get()
        .lock()
        .alloc_super()
        .ok_or(KernelError::NoFreeSuperPage)?;
    unsafe {
        pa.write_bytes(ALLOC_JUNK, SUPER_PAGE_SIZE);
    }
    Ok(pa)
}

/// Frees the super page pointed at by `pa`, which must have been returned
/// by a call to [`alloc_super_page`].
///
/// A demoted super page never comes back here; its constituent pages are
/// freed one at a time through [`free_page`].
///
/// # Panics
///
/// Panics if `pa` is not 2 MiB-aligned or outside the managed range.
///
/// # Safety
///
/// The super page must not be accessed after it has been freed, and must
/// not be freed more than once.
pub unsafe fn free_super_page(pa: NonNull<u8>) {
    check_frame(pa, SUPER_PAGE_SIZE);

    unsafe {
        pa.write_bytes(FREE_JUNK, SUPER_PAGE_SIZE);
    }
    unsafe { ALLOCATOR.get().lock().free_super(pa) }
}

/// Number of 4096-byte pages currently free.
pub fn free_page_count() -> usize {
    ALLOCATOR.get().lock().free_page_count()
}

/// Number of super pages currently free.
pub fn free_super_page_count() -> usize {
    ALLOCATOR.get().lock().free_super_page_count()
}

/// An [`Allocator`] over single frames.
///
/// Page-table nodes live in `Box<PageTable, PageFrameAllocator>` so the
/// tree owns them and frees them through the frame pool.
#[derive(Clone)]
pub struct PageFrameAllocator;

unsafe impl Allocator for PageFrameAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        assert!(layout.size() <= PAGE_SIZE);
        assert_eq!(PAGE_SIZE % layout.align(), 0);

        let page = alloc_page().map_err(|_| AllocError)?;
        Ok(NonNull::slice_from_raw_parts(page.cast(), PAGE_SIZE))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        assert!(layout.size() <= PAGE_SIZE);
        assert_eq!(PAGE_SIZE % layout.align(), 0);
        assert_eq!(ptr.addr().get() % PAGE_SIZE, 0);

        unsafe { free_page(ptr.cast()) }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard, Once as StdOnce, PoisonError};

    use super::*;
    use crate::memory::PageRound as _;

    /// Span of the fake physical memory the tests share.
    pub(crate) const TEST_SPAN: usize = 256 * 1024 * 1024;

    fn init_arena() {
        static INIT: StdOnce = StdOnce::new();
        INIT.call_once(|| {
            let arena = vec![0u8; TEST_SPAN + SUPER_PAGE_SIZE].leak();
            let base = arena.as_mut_ptr();
            let start = base.with_addr(base.addr().super_page_roundup());
            let end = start.with_addr(start.addr() + TEST_SPAN);
            init(NonNull::new(start).unwrap(), NonNull::new(end).unwrap());
        });
    }

    /// Serializes tests that assert on the shared allocator's inventory,
    /// and makes sure the arena exists.
    pub(crate) fn lock() -> MutexGuard<'static, ()> {
        static LOCK: Mutex<()> = Mutex::new(());
        init_arena();
        LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
