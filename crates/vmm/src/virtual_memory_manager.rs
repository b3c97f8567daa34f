//! The kernel-wide virtual memory context.

use alloc::sync::Arc;

use crate::{
    AddressTranslator, FrameAllocator, FrameNumber, FrameRefCounter, Mmu, PageCache, PageTable,
    arch::PAGE_SIZE,
};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// State shared by every address space: frame reference counts, the page cache, the
/// zero page and the MMU of the executing core.
pub struct VirtualMemoryManager {
    translator: AddressTranslator,
    frames: FrameRefCounter,
    page_cache: PageCache,
    zero_page: FrameNumber,
    mmu: Arc<dyn Mmu>,
}

impl VirtualMemoryManager {
    /// Creates the manager over frames `0..frame_count` handed out by `allocator`.
    ///
    /// Allocates and pins the zero page.
    pub fn new(
        translator: AddressTranslator,
        allocator: Arc<dyn FrameAllocator>,
        frame_count: usize,
        mmu: Arc<dyn Mmu>,
    ) -> Self {
        let frames = FrameRefCounter::new(allocator, frame_count);
        let zero_page = frames.allocate();
        frames.pin(zero_page);

        let vmm = Self {
            translator,
            frames,
            page_cache: PageCache::new(),
            zero_page,
            mmu,
        };
        vmm.zero_frame(zero_page);
        log::debug!("virtual memory manager ready, zero page at frame {}", zero_page);
        vmm
    }

    /// Creates a manager over a fresh emulated memory of `frame_count` frames.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(frame_count: usize, mmu: Arc<dyn Mmu>) -> Self {
        let memory = Arc::new(EmulatedMemory::new(frame_count));
        Self::new(AddressTranslator::emulated(memory.clone()), memory, frame_count, mmu)
    }

    /// Reference counts of every managed frame.
    pub fn frames(&self) -> &FrameRefCounter {
        &self.frames
    }

    /// The page cache shared by all address spaces.
    pub fn page_cache(&self) -> &PageCache {
        &self.page_cache
    }

    /// The shared, permanently read-only, all-zero frame.
    pub fn zero_page(&self) -> FrameNumber {
        self.zero_page
    }

    /// MMU of the executing core.
    pub fn mmu(&self) -> &dyn Mmu {
        &*self.mmu
    }

    /// Translator used to reach physical frames.
    pub fn translator(&self) -> &AddressTranslator {
        &self.translator
    }

    /// Views `frame` as a page table.
    ///
    /// Callers pass frames reached through a present directory slot or freshly
    /// allocated for a table; those stay allocated while the caller holds a reference.
    pub(crate) fn table(&self, frame: FrameNumber) -> PageTable<'_> {
        // SAFETY: see above; every frame managed here is reachable through the translator.
        unsafe { PageTable::from_frame(&self.translator, frame) }
    }

    /// Allocates a zero-filled frame with a reference count of zero.
    pub(crate) fn allocate_zeroed(&self) -> FrameNumber {
        let frame = self.frames.allocate();
        self.zero_frame(frame);
        frame
    }

    pub(crate) fn zero_frame(&self, frame: FrameNumber) {
        // SAFETY: frames span PAGE_SIZE bytes of translatable memory.
        unsafe { core::ptr::write_bytes(self.translator.frame_ptr::<u8>(frame), 0, PAGE_SIZE) };
    }

    pub(crate) fn copy_frame(&self, from: FrameNumber, to: FrameNumber) {
        debug_assert_ne!(from, to);
        // SAFETY: distinct frames never overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.translator.frame_ptr::<u8>(from),
                self.translator.frame_ptr::<u8>(to),
                PAGE_SIZE,
            )
        };
    }

    /// Copies bytes out of `frame` starting at `offset`.
    pub(crate) fn read_frame(&self, frame: FrameNumber, offset: usize, buffer: &mut [u8]) {
        assert!(offset + buffer.len() <= PAGE_SIZE, "read crosses frame {}", frame);
        // SAFETY: bounds checked above.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.translator.frame_ptr::<u8>(frame).add(offset),
                buffer.as_mut_ptr(),
                buffer.len(),
            )
        };
    }

    /// Copies `bytes` into `frame` starting at `offset`.
    pub(crate) fn write_frame(&self, frame: FrameNumber, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= PAGE_SIZE, "write crosses frame {}", frame);
        // SAFETY: bounds checked above.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.translator.frame_ptr::<u8>(frame).add(offset),
                bytes.len(),
            )
        };
    }

    /// Returns the contents of `frame` as a mutable slice.
    ///
    /// # Safety
    ///
    /// The caller must own `frame` exclusively: freshly allocated and not yet published
    /// in any page table.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn frame_bytes_mut(&self, frame: FrameNumber) -> &mut [u8] {
        // SAFETY: exclusivity is guaranteed by the caller.
        unsafe { core::slice::from_raw_parts_mut(self.translator.frame_ptr::<u8>(frame), PAGE_SIZE) }
    }
}
