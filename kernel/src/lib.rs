//! Virtual-memory core of a RISC-V Sv39 teaching kernel.
//!
//! The crate manages physical frames at two granularities (4096-byte pages
//! and naturally aligned 2 MiB super pages), the three-level page-table
//! tree, user address-space growth, shrinkage and cloning, demand faults
//! for lazily grown regions, and the byte copies between kernel and user
//! memory.
//!
//! The trap dispatcher, scheduler, file system, drivers and the boot
//! sequence live elsewhere; everything that touches real hardware is gated
//! to `target_arch = "riscv64"`, so the rest of the crate builds and tests
//! on the host.
#![cfg_attr(not(test), no_std)]
#![feature(allocator_api)]

extern crate alloc;

mod arch;
pub mod error;
pub mod memory;
pub mod param;
pub mod sync;
