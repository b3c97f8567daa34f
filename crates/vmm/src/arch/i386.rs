//! i386 two-level paging geometry and MMU control.

#[cfg(target_arch = "x86")]
use crate::{FrameNumber, Mmu, PageNumber};

/// Maximum number of bits in a physical address (no PAE).
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Maximum number of bits in a virtual address.
pub const MAX_VIRTUAL_BITS: usize = 32;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of 32-bit entries in a page table or page directory.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// First page handed out to kernel mappings. Page 0 is never mapped.
pub const KERNEL_START_PAGE: usize = 1;

/// First page of the user half (address 0x8000_0000).
pub const USER_START_PAGE: usize = 0x8_0000;

/// One past the last page of the user half (address 0xF000_1000).
pub const USER_END_PAGE: usize = 0xF_0001;

/// MMU control through CR3 and `invlpg`.
#[cfg(target_arch = "x86")]
pub struct HardwareMmu;

#[cfg(target_arch = "x86")]
impl Mmu for HardwareMmu {
    fn is_active(&self, directory: FrameNumber) -> bool {
        let cr3: usize;
        // SAFETY: reading CR3 has no side effects in ring 0.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        cr3 & !(PAGE_SIZE - 1) == directory.start().as_usize()
    }

    fn invalidate_page(&self, page: PageNumber) {
        // SAFETY: invlpg only drops a cached translation.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) page.start().as_usize(), options(nostack, preserves_flags));
        }
    }

    fn flush(&self) {
        // SAFETY: reloading CR3 with its current value only drops cached translations.
        unsafe {
            core::arch::asm!(
                "mov {tmp}, cr3",
                "mov cr3, {tmp}",
                tmp = out(reg) _,
                options(nostack, preserves_flags)
            );
        }
    }
}
