//! Architecture-specific paging geometry.
//!
//! This module conditionally imports either the i386 geometry used by the kernel
//! or the software scale model used by tests and emulation.

// Use the i386 geometry when we're not testing or emulating.
#[cfg(not(any(test, feature = "software-emulation")))]
mod i386;
#[cfg(not(any(test, feature = "software-emulation")))]
pub use i386::*;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Number of virtual pages addressable through one page directory.
pub const TOTAL_PAGES: usize = ENTRIES_PER_TABLE * ENTRIES_PER_TABLE;

/// Validates a physical address against the architecture's physical width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    (addr as u64) < (1u64 << MAX_PHYSICAL_BITS)
}

/// Validates a virtual address against the architecture's virtual width.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    (addr as u64) < (1u64 << MAX_VIRTUAL_BITS)
}
