use core::{
    fmt,
    num::NonZero,
    ptr::{self, NonNull},
};

use super::{PAGE_SHIFT, PAGE_SIZE, SUPER_PAGE_SIZE};

pub const fn page_roundup(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub const fn page_rounddown(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

pub const fn is_page_aligned(addr: usize) -> bool {
    addr % PAGE_SIZE == 0
}

pub const fn super_page_roundup(addr: usize) -> usize {
    (addr + SUPER_PAGE_SIZE - 1) & !(SUPER_PAGE_SIZE - 1)
}

pub const fn super_page_rounddown(addr: usize) -> usize {
    addr & !(SUPER_PAGE_SIZE - 1)
}

pub const fn is_super_page_aligned(addr: usize) -> bool {
    addr % SUPER_PAGE_SIZE == 0
}

pub trait PageRound {
    fn page_roundup(&self) -> Self;
    fn page_rounddown(&self) -> Self;
    fn is_page_aligned(&self) -> bool;
    fn super_page_roundup(&self) -> Self;
    fn super_page_rounddown(&self) -> Self;
    fn is_super_page_aligned(&self) -> bool;
}

impl PageRound for usize {
    fn page_roundup(&self) -> Self {
        page_roundup(*self)
    }

    fn page_rounddown(&self) -> Self {
        page_rounddown(*self)
    }

    fn is_page_aligned(&self) -> bool {
        is_page_aligned(*self)
    }

    fn super_page_roundup(&self) -> Self {
        super_page_roundup(*self)
    }

    fn super_page_rounddown(&self) -> Self {
        super_page_rounddown(*self)
    }

    fn is_super_page_aligned(&self) -> bool {
        is_super_page_aligned(*self)
    }
}

impl PageRound for NonZero<usize> {
    fn page_roundup(&self) -> Self {
        Self::new(page_roundup(self.get())).unwrap()
    }

    fn page_rounddown(&self) -> Self {
        Self::new(page_rounddown(self.get())).unwrap()
    }

    fn is_page_aligned(&self) -> bool {
        is_page_aligned(self.get())
    }

    fn super_page_roundup(&self) -> Self {
        Self::new(super_page_roundup(self.get())).unwrap()
    }

    fn super_page_rounddown(&self) -> Self {
        Self::new(super_page_rounddown(self.get())).unwrap()
    }

    fn is_super_page_aligned(&self) -> bool {
        is_super_page_aligned(self.get())
    }
}

impl<T> PageRound for NonNull<T> {
    fn page_roundup(&self) -> Self {
        self.map_addr(|a| a.page_roundup())
    }

    fn page_rounddown(&self) -> Self {
        self.map_addr(|a| a.page_rounddown())
    }

    fn is_page_aligned(&self) -> bool {
        is_page_aligned(self.as_ptr().addr())
    }

    fn super_page_roundup(&self) -> Self {
        self.map_addr(|a| a.super_page_roundup())
    }

    fn super_page_rounddown(&self) -> Self {
        self.map_addr(|a| a.super_page_rounddown())
    }

    fn is_super_page_aligned(&self) -> bool {
        is_super_page_aligned(self.as_ptr().addr())
    }
}

impl PageRound for VirtAddr {
    fn page_roundup(&self) -> Self {
        Self(self.0.page_roundup())
    }

    fn page_rounddown(&self) -> Self {
        Self(self.0.page_rounddown())
    }

    fn is_page_aligned(&self) -> bool {
        is_page_aligned(self.0)
    }

    fn super_page_roundup(&self) -> Self {
        Self(self.0.super_page_roundup())
    }

    fn super_page_rounddown(&self) -> Self {
        Self(self.0.super_page_rounddown())
    }

    fn is_super_page_aligned(&self) -> bool {
        is_super_page_aligned(self.0)
    }
}

impl PageRound for PhysAddr {
    fn page_roundup(&self) -> Self {
        Self(self.0.page_roundup())
    }

    fn page_rounddown(&self) -> Self {
        Self(self.0.page_rounddown())
    }

    fn is_page_aligned(&self) -> bool {
        is_page_aligned(self.0)
    }

    fn super_page_roundup(&self) -> Self {
        Self(self.0.super_page_roundup())
    }

    fn super_page_rounddown(&self) -> Self {
        Self(self.0.super_page_rounddown())
    }

    fn is_super_page_aligned(&self) -> bool {
        is_super_page_aligned(self.0)
    }
}

/// Virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// One beyond the highest possible virtual address.
    ///
    /// [`VirtAddr::MAX`] is actually one bit less than the max allowed by
    /// Sv39, to avoid having to sign-extend virtual addresses that have
    /// the high bit set.
    pub const MAX: Self = Self(1 << (9 * 3 + PAGE_SHIFT - 1));

    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn byte_add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    pub const fn byte_sub(self, offset: usize) -> Self {
        Self(self.0 - offset)
    }

    pub const fn addr(self) -> usize {
        self.0
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Physical Page Number of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysPageNum(usize);

impl PhysPageNum {
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    pub const fn phys_addr(self) -> PhysAddr {
        PhysAddr(self.0 << PAGE_SHIFT)
    }

    pub const fn value(self) -> usize {
        self.0
    }
}

/// Physical Address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(usize);

impl PhysAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Captures the address of `ptr`, exposing its provenance so the
    /// address round-trips through [`as_ptr`](Self::as_ptr).
    pub fn from_ptr<T>(ptr: NonNull<T>) -> Self {
        Self(ptr.as_ptr().expose_provenance())
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub fn as_ptr<T>(self) -> *const T {
        ptr::with_exposed_provenance(self.0)
    }

    pub fn as_mut_ptr<T>(self) -> NonNull<T> {
        NonNull::new(ptr::with_exposed_provenance_mut(self.0)).unwrap()
    }

    pub fn phys_page_num(self) -> PhysPageNum {
        PhysPageNum(self.0 >> PAGE_SHIFT)
    }

    pub const fn byte_add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
