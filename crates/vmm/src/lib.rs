#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The Polaris Virtual Memory Manager (VMM) manages the virtual address spaces of the
//! Polaris teaching kernel on two-level paging hardware. It provides:
//!
//! - Reference counting of physical frames, with a pinned shared zero page.
//! - Lazy, region-based address spaces backed by anonymous memory or files.
//! - A read-only page cache shared by every mapping of the same file page.
//! - Copy-on-write sharing of page tables and data pages between forked address spaces.
//! - Page fault resolution safe against concurrent faults on other cores.
//! - Software emulation of physical memory and the MMU for testing in non-kernel
//!   environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod fault;
mod file;
mod frame;
mod mmu;
mod numbers;
mod page_cache;
mod page_directory;
mod page_table;
mod region;
mod region_map;
mod virtual_memory_manager;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::AddressSpace;
pub use arch::{ENTRIES_PER_TABLE, KERNEL_START_PAGE, PAGE_SIZE, TOTAL_PAGES, USER_END_PAGE, USER_START_PAGE};
pub use fault::{Access, FaultError, PageFault, Privilege};
pub use file::{File, FileHandle, FileId};
pub use frame::{Frame, FrameAllocator, FrameFlag, FrameFlags, FrameGuard, FrameRefCounter};
pub use mmu::Mmu;
pub use numbers::{FrameNumber, PageNumber, page_count};
pub use page_cache::{PageCache, ReadError};
pub use page_directory::PageDirectory;
pub use page_table::{PageEntry, PageFlags, PageTable};
pub use region::{Backing, MapFlags, VirtualRegion};
pub use region_map::{MapError, RegionMap};
pub use virtual_memory_manager::VirtualMemoryManager;

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::EmulatedMemory;
#[cfg(any(test, feature = "software-emulation"))]
pub use file::MemoryFile;
#[cfg(any(test, feature = "software-emulation"))]
pub use mmu::EmulatedMmu;

#[cfg(all(target_arch = "x86", not(any(test, feature = "software-emulation"))))]
pub use arch::HardwareMmu;
