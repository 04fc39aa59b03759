//! The architectural primitives the memory core consumes.

/// Flushes all stale address translations from this hart's TLB.
///
/// A no-op off riscv64, where there is no TLB to keep coherent.
pub(crate) fn sfence_vma() {
    #[cfg(target_arch = "riscv64")]
    riscv::asm::sfence_vma_all();
}
