//! Software emulation for testing and development.
//!
//! The software-emulated architecture is a "scale model" of i386 two-level paging:
//! - 20-bit virtual addresses (vs 32-bit on i386)
//! - 6-bit indexes (64 entries per table, vs 10-bit/1024 entries on i386)
//! - 8-bit page offset (256-byte pages, vs 12-bit/4KB on i386)
//!
//! Entries stay 32 bits wide, so one table still fills exactly one frame.

use alloc::vec::Vec;
use core::ptr::NonNull;
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};

use crate::{FrameAllocator, FrameNumber};

/// Maximum number of bits in a physical address for software emulation.
pub const MAX_PHYSICAL_BITS: usize = 24;

/// Maximum number of bits in a virtual address for software emulation.
pub const MAX_VIRTUAL_BITS: usize = 20;

/// Page size in bytes (256 bytes = 2^8).
pub const PAGE_SIZE: usize = 256;

/// Number of 32-bit entries in a page table or page directory.
pub const ENTRIES_PER_TABLE: usize = 64;

/// First page handed out to kernel mappings. Page 0 is never mapped.
pub const KERNEL_START_PAGE: usize = 1;

/// First page of the user half (address 0x80000).
pub const USER_START_PAGE: usize = 0x800;

/// One past the last page of the user half.
pub const USER_END_PAGE: usize = 0x1000;

/// Emulated physical memory for software simulation.
///
/// A page-aligned host buffer stands in for physical memory, and a free list of frames
/// stands in for the kernel's physical frame allocator. Frame 0 is never handed out.
pub struct EmulatedMemory {
    /// Base of the underlying buffer.
    base: NonNull<u8>,
    /// Layout used to allocate the buffer.
    layout: Layout,
    /// Frames not currently handed out.
    free: spin::Mutex<Vec<FrameNumber>>,
}

// SAFETY: the buffer is owned by this value and only reached through raw pointers whose
// synchronization is the caller's responsibility, as with real physical memory.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a new zero-filled emulated memory of `frame_count` frames.
    ///
    /// # Panics
    ///
    /// Panics if fewer than two frames are requested or the memory would not be
    /// addressable with the emulated physical address width.
    pub fn new(frame_count: usize) -> Self {
        assert!(frame_count >= 2, "emulated memory needs at least two frames");
        let size = frame_count * PAGE_SIZE;
        assert!(
            size <= 1 << MAX_PHYSICAL_BITS,
            "emulated memory exceeds physical address width"
        );

        let Ok(layout) = Layout::from_size_align(size, PAGE_SIZE) else {
            panic!("invalid emulated memory layout");
        };
        // SAFETY: the layout has a non-zero size.
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })
            .unwrap_or_else(|| handle_alloc_error(layout));

        Self {
            base,
            layout,
            free: spin::Mutex::new((1..frame_count).rev().map(FrameNumber::new).collect()),
        }
    }

    /// Translates a physical address to a pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size(), "physical address out of bounds");
        // SAFETY: bounds checked above.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Returns the size of the emulated memory in bytes.
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Returns the number of frames in the emulated memory, including frame 0.
    pub fn frame_count(&self) -> usize {
        self.size() / PAGE_SIZE
    }

    /// Returns the number of frames available for allocation.
    pub fn free_frames(&self) -> usize {
        self.free.lock().len()
    }
}

impl FrameAllocator for EmulatedMemory {
    fn allocate_frame(&self) -> Option<FrameNumber> {
        self.free.lock().pop()
    }

    fn free_frame(&self, frame: FrameNumber) {
        assert!(
            frame.as_usize() != 0 && frame.as_usize() < self.frame_count(),
            "frame {} does not belong to emulated memory",
            frame
        );
        self.free.lock().push(frame);
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_zero_is_reserved() {
        let memory = EmulatedMemory::new(4);
        let mut frames = Vec::new();
        while let Some(frame) = memory.allocate_frame() {
            frames.push(frame);
        }
        assert_eq!(frames, [1, 2, 3].map(FrameNumber::new));
    }

    #[test]
    fn freed_frames_are_reused() {
        let memory = EmulatedMemory::new(4);
        let frame = memory.allocate_frame().unwrap();
        assert_eq!(memory.free_frames(), 2);
        memory.free_frame(frame);
        assert_eq!(memory.free_frames(), 3);
        assert_eq!(memory.allocate_frame(), Some(frame));
    }

    #[test]
    fn memory_starts_zeroed() {
        let memory = EmulatedMemory::new(2);
        let bytes = unsafe { core::slice::from_raw_parts(memory.translate(0), memory.size()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "physical address out of bounds")]
    fn translate_out_of_bounds() {
        let memory = EmulatedMemory::new(2);
        memory.translate(2 * PAGE_SIZE);
    }
}
