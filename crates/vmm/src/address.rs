//! Address types for physical and virtual memory management.
//!
//! This module provides architecture-independent wrappers around physical and virtual
//! addresses, and the translator used to reach physical frames from kernel code.

use core::fmt;
use core::ops::{Add, Sub};

#[cfg(any(test, feature = "software-emulation"))]
use alloc::sync::Arc;

use crate::{FrameNumber, PageNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Address translator for reaching physical memory from the kernel.
///
/// This enum supports two modes:
/// - Hardware: all physical memory is direct-mapped at a fixed offset (kernel mode)
/// - Emulated: physical memory is a host buffer (testing mode)
pub enum AddressTranslator {
    /// Hardware translation using a direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(Arc<EmulatedMemory>),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a new emulated translator over the given memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(memory: Arc<EmulatedMemory>) -> Self {
        Self::Emulated(memory)
    }

    /// Translates a physical address to a kernel-accessible virtual address.
    pub fn phys_to_virt(&self, phys: PhysicalAddress) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.as_usize().wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys.as_usize()) as usize,
        }
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        self.phys_to_virt(phys) as *mut T
    }

    /// Returns a pointer to the first byte of a frame.
    #[inline]
    pub fn frame_ptr<T>(&self, frame: FrameNumber) -> *mut T {
        self.phys_to_ptr(frame.start())
    }
}

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self::new((self.0 + align - 1) & !(align - 1))
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
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

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Page-table entries store frame-aligned physical addresses in their high bits."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the frame containing this physical address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     Virtual addresses are split into a directory index, a table index and a page offset\n\
     by the two-level paging scheme."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address lies outside the virtual address space.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_virtual(addr),
            "virtual address exceeds maximum width"
        );
        Self(addr)
    }

    /// Creates a virtual address, returning `None` if it lies outside the address space.
    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        if arch::validate_virtual(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Returns the page containing this virtual address.
    #[inline]
    pub fn page_number(self) -> PageNumber {
        PageNumber::from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_valid_address() {
            let addr = PhysicalAddress::new(0x0100);
            assert_eq!(addr.as_usize(), 0x0100);
        }

        #[test]
        fn new_max_valid_address() {
            let max_addr = (1usize << arch::MAX_PHYSICAL_BITS) - 1;
            let addr = PhysicalAddress::new(max_addr);
            assert_eq!(addr.as_usize(), max_addr);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds maximum width")]
        fn new_invalid_address() {
            PhysicalAddress::new(1usize << arch::MAX_PHYSICAL_BITS);
        }

        #[test]
        fn frame_number() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 7 + 3);
            assert_eq!(addr.frame_number(), FrameNumber::new(7));
        }

        #[test]
        fn debug_format() {
            let addr = PhysicalAddress::new(0x1200);
            assert_eq!(format!("{:?}", addr), "PhysicalAddress(0x1200)");
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn try_new_rejects_out_of_range() {
            assert_eq!(VirtualAddress::try_new(1usize << arch::MAX_VIRTUAL_BITS), None);
            assert!(VirtualAddress::try_new((1usize << arch::MAX_VIRTUAL_BITS) - 1).is_some());
        }

        #[test]
        #[should_panic(expected = "virtual address exceeds maximum width")]
        fn new_invalid_address() {
            VirtualAddress::new(1usize << arch::MAX_VIRTUAL_BITS);
        }

        #[test]
        fn alignment() {
            let addr = VirtualAddress::new(arch::PAGE_SIZE * 3 + 5);
            assert!(!addr.is_aligned(arch::PAGE_SIZE));
            assert_eq!(addr.align_down(arch::PAGE_SIZE).as_usize(), arch::PAGE_SIZE * 3);
            assert_eq!(addr.align_up(arch::PAGE_SIZE).as_usize(), arch::PAGE_SIZE * 4);
            assert_eq!(addr.page_offset(), 5);
        }

        #[test]
        fn page_number() {
            let addr = VirtualAddress::new(arch::PAGE_SIZE * 9 + 1);
            assert_eq!(addr.page_number(), PageNumber::new(9));
        }

        #[test]
        fn arithmetic() {
            let a = VirtualAddress::new(0x400);
            let b = a + 0x10;
            assert_eq!(b.as_usize(), 0x410);
            assert_eq!(b - a, 0x10);
            assert_eq!((b - 0x10), a);
        }
    }
}
