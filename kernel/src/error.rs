use crate::memory::VirtAddr;

/// Recoverable failures of the memory core.
///
/// Anything a well-formed process can cause lands here and is propagated
/// with `?`; conditions a well-formed kernel cannot cause (misaligned
/// arguments, remapping a live entry, freeing a foreign frame) panic
/// instead.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("no free page found")]
    NoFreePage,
    #[error("no free super page found")]
    NoFreeSuperPage,
    #[error("too large virtual address: {0:#x}")]
    TooLargeVirtualAddress(usize),
    #[error("page not mapped: {0:#x}")]
    VirtualPageNotMapped(VirtAddr),
    #[error("inaccessible page: {0:#x}")]
    InaccessiblePage(VirtAddr),
    #[error("string is not nul-terminated")]
    UnterminatedString,
}
