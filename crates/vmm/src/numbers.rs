//! Page and frame number types for memory management.
//!
//! This module provides newtypes for physical frame numbers and virtual page numbers,
//! which are used throughout the memory management subsystem.

use crate::{
    address::{PhysicalAddress, VirtualAddress},
    arch,
};
use core::{
    fmt,
    ops::{Add, Sub},
};

/// Macro to define common page/frame number functionality.
///
/// This macro generates the basic structure and methods common to both frame
/// and page number types, reducing code duplication.
macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new page/frame number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw page/frame number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

/// Returns the number of pages needed to hold `bytes` bytes.
#[inline]
pub const fn page_count(bytes: usize) -> usize {
    bytes.div_ceil(arch::PAGE_SIZE)
}

impl_page_number_common!(
    FrameNumber,
    "A physical memory frame number.\n\n\
     Represents a physical memory frame, which is the physical memory equivalent of a page.\n\
     Frame numbers are zero-indexed and correspond to PAGE_SIZE-aligned physical addresses."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self::new(addr.as_usize() / arch::PAGE_SIZE)
    }
}

impl_page_number_common!(
    PageNumber,
    "A virtual memory page number.\n\n\
     Represents a virtual memory page. Page numbers are zero-indexed and correspond to\n\
     PAGE_SIZE-aligned virtual addresses. The high bits select a page directory slot and\n\
     the low bits select an entry in that slot's page table."
);

impl PageNumber {
    /// Builds a page number from a directory slot and a table entry index.
    #[inline]
    pub const fn from_indices(directory_index: usize, table_index: usize) -> Self {
        Self(directory_index * arch::ENTRIES_PER_TABLE + table_index)
    }

    /// Returns the virtual address at the start of this page.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 * arch::PAGE_SIZE)
    }

    /// Index of the page directory slot covering this page.
    #[inline]
    pub const fn directory_index(self) -> usize {
        self.0 / arch::ENTRIES_PER_TABLE
    }

    /// Index of this page's entry within its page table.
    #[inline]
    pub const fn table_index(self) -> usize {
        self.0 % arch::ENTRIES_PER_TABLE
    }

    /// Returns true if the page lies in the user half of the address space.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 >= arch::USER_START_PAGE && self.0 < arch::USER_END_PAGE
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        Self::new(addr.as_usize() / arch::PAGE_SIZE)
    }
}
