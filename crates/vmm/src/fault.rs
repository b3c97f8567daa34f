//! Page fault handling.
//!
//! A fault is validated against the permitted range for the faulting privilege level,
//! classified against the region map, and resolved by materializing or copying the
//! page table and data page. Faults that cannot be resolved are reported back to the
//! caller, which decides how the faulting process is told.

use core::fmt;

use crate::{AddressSpace, MapFlags, VirtualAddress, VirtualMemoryManager, arch};

/// Kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Privilege level of the faulting code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Kernel,
    User,
}

/// A page fault raised by the MMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub address: VirtualAddress,
    pub access: Access,
    pub privilege: Privilege,
}

impl PageFault {
    /// Error code bit set when the faulting access was a write.
    const ERROR_WRITE: u32 = 1 << 1;

    /// Error code bit set when the fault was raised in user mode.
    const ERROR_USER: u32 = 1 << 2;

    /// Creates a fault record for an access to `address`.
    pub const fn new(address: VirtualAddress, access: Access, privilege: Privilege) -> Self {
        Self {
            address,
            access,
            privilege,
        }
    }

    /// Decodes the error code pushed by the CPU together with the faulting address (CR2).
    pub fn from_error_code(address: VirtualAddress, code: u32) -> Self {
        let access = if code & Self::ERROR_WRITE != 0 {
            Access::Write
        } else {
            Access::Read
        };
        let privilege = if code & Self::ERROR_USER != 0 {
            Privilege::User
        } else {
            Privilege::Kernel
        };
        Self::new(address, access, privilege)
    }
}

/// Reasons a fault cannot be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// The address lies outside the range permitted for the faulting privilege level.
    OutOfRange,
    /// No region contains the address.
    Unmapped,
    /// The region does not permit the access.
    ProtectionViolation,
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange => f.write_str("address outside the permitted range"),
            Self::Unmapped => f.write_str("address not mapped"),
            Self::ProtectionViolation => f.write_str("access not permitted by the mapping"),
        }
    }
}

impl VirtualMemoryManager {
    /// Checks whether `fault` can be resolved in `space` without resolving it.
    pub fn is_mappable(&self, space: &AddressSpace, fault: &PageFault) -> Result<(), FaultError> {
        let page = fault.address.page_number();
        match fault.privilege {
            Privilege::User if !page.is_user() => return Err(FaultError::OutOfRange),
            Privilege::Kernel if page.as_usize() >= arch::TOTAL_PAGES => {
                return Err(FaultError::OutOfRange);
            }
            _ => {}
        }

        let flags = space
            .regions()
            .read()
            .find(page)
            .map(|region| region.flags())
            .ok_or(FaultError::Unmapped)?;

        if fault.access == Access::Write && !flags.contains(MapFlags::WRITE) {
            return Err(FaultError::ProtectionViolation);
        }
        if fault.privilege == Privilege::User && !flags.contains(MapFlags::USER) {
            return Err(FaultError::ProtectionViolation);
        }
        Ok(())
    }

    /// Resolves `fault` in `space`.
    ///
    /// On success the faulting access can be retried and will not fault again for the
    /// same reason.
    pub fn handle_page_fault(&self, space: &AddressSpace, fault: PageFault) -> Result<(), FaultError> {
        if let Err(error) = self.is_mappable(space, &fault) {
            log::trace!("unresolvable fault {:?}: {}", fault, error);
            return Err(error);
        }

        let page = fault.address.page_number();
        let directory = space.directory();
        let table = directory.ensure_writable_table(self, space, page);
        let frame = directory.ensure_data_page(self, space, &table, page, fault.access == Access::Write);

        if space.is_active(self) {
            self.mmu().invalidate_page(page);
        }

        log::trace!("resolved {:?} at {} with frame {}", fault.access, fault.address, frame);
        Ok(())
    }
}
