//! Physical memory layout
//!
//! qemu -machine virt is set up like this,
//! based on qemu's [hw/riscv/virt.c]:
//!
//! ```text
//! 0x0c00_0000 -- PLIC
//! 0x1000_0000 -- UART0
//! 0x1000_1000 -- virtio disk
//! 0x8000_0000 -- boot ROM jumps here in machine mode,
//!                -kernel loads the kernel here
//! unused RAM after 0x8000_0000.
//! ```
//!
//! the kernel uses physical memory thus:
//!
//! ```text
//! 0x8000_0000 -- KERN_BASE, start of kernel text
//! text_end()  -- start of kernel data
//! kernel_end()-- start of the frame allocation area
//! PHYS_TOP    -- end of the RAM used by the kernel
//! ```
//!
//! [hw/riscv/virt.c]: https://github.com/qemu/qemu/blob/9.2.0/hw/riscv/virt.c

use super::{PAGE_SIZE, VirtAddr};

/// qemu puts UART registers here in physical memory.
pub const UART0: usize = 0x1000_0000;

/// virtio mmio disk interface
pub const VIRTIO0: usize = 0x1000_1000;

/// qemu puts the platform-level interrupt controller (PLIC) here.
pub const PLIC: usize = 0x0c00_0000;
pub const PLIC_SIZE: usize = 0x400_0000;

/// Start of kernel text.
pub const KERN_BASE: usize = 0x8000_0000;

/// End of the RAM used by the kernel.
pub const PHYS_TOP: usize = KERN_BASE + 256 * 1024 * 1024;

// User memory layout.
// ```text
// Address zero first:
//   text
//   original data and bss
//   fixed-size stack
//   expandable heap
//   ...
//   TRAPFRAME (used by the trampoline)
//   TRAMPOLINE (the same page as in the kernel)
// ```

pub const TRAMPOLINE: VirtAddr = VirtAddr::new(VirtAddr::MAX.addr() - PAGE_SIZE);

pub const TRAPFRAME: VirtAddr = VirtAddr::new(TRAMPOLINE.addr() - PAGE_SIZE);

#[cfg(target_arch = "riscv64")]
mod symbols {
    use core::ptr::NonNull;

    unsafe extern "C" {
        /// First address after kernel code.
        ///
        /// defined by `kernel.ld`
        #[link_name = "etext"]
        static mut ETEXT: [u8; 0];

        /// First address after the kernel image.
        ///
        /// defined by `kernel.ld`
        #[link_name = "end"]
        static mut END: [u8; 0];
    }

    /// Address of the end of kernel code.
    pub fn text_end() -> usize {
        (&raw mut ETEXT).addr()
    }

    /// First address after the kernel image; frames start here.
    pub fn kernel_end() -> NonNull<u8> {
        NonNull::new((&raw mut END).cast()).unwrap()
    }
}

#[cfg(target_arch = "riscv64")]
pub use self::symbols::{kernel_end, text_end};
