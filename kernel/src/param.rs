//! Tunable kernel parameters.

/// Number of super pages carved out of physical memory at boot.
///
/// The pool is fixed: it is not refilled from base pages, and base pages
/// are not minted from it. Running it dry makes the address-space code
/// fall back to 4096-byte mappings.
pub const NSUPER_PAGE: usize = 20;
