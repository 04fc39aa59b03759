//! The kernel's direct-map address space.
//!
//! Built once at boot, then installed on every hart.

use alloc::boxed::Box;

use riscv::{asm, register::satp};

use super::{
    PAGE_SIZE, PhysAddr, VirtAddr,
    layout::{
        KERN_BASE, PHYS_TOP, PLIC, PLIC_SIZE, TRAMPOLINE, UART0, VIRTIO0, text_end,
    },
    page::PageFrameAllocator,
    page_table::{PageTable, PtEntryFlags},
};
use crate::sync::Once;

/// The kernel's page table, shared by all harts.
static KERNEL_PAGETABLE: Once<Box<PageTable, PageFrameAllocator>> = Once::new();

unsafe extern "C" {
    /// Trap entry/exit code, page-aligned by the linker script and mapped
    /// at the top of every address space.
    #[link_name = "trampoline"]
    static mut TRAMPOLINE_TEXT: [u8; 0];
}

/// Makes the direct-map page table for the kernel.
fn make(map_stacks: impl FnOnce(&mut PageTable)) -> Box<PageTable, PageFrameAllocator> {
    use PtEntryFlags as F;

    let etext = text_end();
    let phys_trampoline = PhysAddr::new((&raw mut TRAMPOLINE_TEXT).addr());

    fn ident_map(kpgtbl: &mut PageTable, addr: usize, size: usize, perm: PtEntryFlags) {
        kpgtbl
            .map_pages(VirtAddr::new(addr), size, PhysAddr::new(addr), perm)
            .unwrap();
    }

    let mut kpgtbl = PageTable::try_allocate().unwrap();

    // uart registers
    ident_map(&mut kpgtbl, UART0, PAGE_SIZE, F::RW);

    // virtio mmio disk interface
    ident_map(&mut kpgtbl, VIRTIO0, PAGE_SIZE, F::RW);

    // PLIC
    ident_map(&mut kpgtbl, PLIC, PLIC_SIZE, F::RW);

    // map kernel text executable and read-only.
    ident_map(&mut kpgtbl, KERN_BASE, etext - KERN_BASE, F::RX);

    // map kernel data and the physical RAM we'll make use of.
    ident_map(&mut kpgtbl, etext, PHYS_TOP - etext, F::RW);

    // map the trampoline for trap entry/exit to
    // the highest virtual address in the kernel.
    kpgtbl
        .map_pages(TRAMPOLINE, PAGE_SIZE, phys_trampoline, F::RX)
        .unwrap();

    // allocate and map a kernel stack for each process; the process
    // table owns their layout.
    map_stacks(&mut kpgtbl);

    kpgtbl
}

/// Builds the one kernel page table.
///
/// The frame allocator must already be initialized; `map_stacks` installs
/// the per-process kernel stacks.
pub fn init(map_stacks: impl FnOnce(&mut PageTable)) {
    KERNEL_PAGETABLE.init(make(map_stacks));
}

/// Switches this hart's page-table base register to the kernel's page
/// table and turns paging on.
pub fn init_hart() {
    // wait for any previous writes to the page-table memory to finish.
    asm::sfence_vma_all();

    let addr = KERNEL_PAGETABLE.get().phys_addr();
    unsafe {
        satp::set(satp::Mode::Sv39, 0, addr.phys_page_num().value());
    }

    // flush stale entries from the TLB.
    asm::sfence_vma_all();
}
