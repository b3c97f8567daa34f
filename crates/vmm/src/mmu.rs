//! Translation cache control.

use crate::{FrameNumber, PageNumber};

/// Access to the executing core's MMU state.
///
/// The scheduler owns which directory is loaded on each core; the memory manager only
/// asks whether a directory is live so it can drop stale translations after editing it.
pub trait Mmu: Send + Sync {
    /// Whether `directory` is the page directory loaded on the current core.
    fn is_active(&self, directory: FrameNumber) -> bool;

    /// Drops the cached translation of a single page.
    fn invalidate_page(&self, page: PageNumber);

    /// Drops all cached translations.
    fn flush(&self);
}

/// An MMU that records what it was asked to do.
#[cfg(any(test, feature = "software-emulation"))]
pub struct EmulatedMmu {
    active: spin::Mutex<Option<FrameNumber>>,
    invalidated: spin::Mutex<alloc::vec::Vec<PageNumber>>,
    flushes: core::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "software-emulation"))]
impl EmulatedMmu {
    /// Creates an MMU with no directory loaded.
    pub const fn new() -> Self {
        Self {
            active: spin::Mutex::new(None),
            invalidated: spin::Mutex::new(alloc::vec::Vec::new()),
            flushes: core::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Loads `directory` as the active page directory.
    pub fn activate(&self, directory: FrameNumber) {
        *self.active.lock() = Some(directory);
    }

    /// Pages invalidated so far, in order.
    pub fn invalidated(&self) -> alloc::vec::Vec<PageNumber> {
        self.invalidated.lock().clone()
    }

    /// Number of full flushes so far.
    pub fn flushes(&self) -> usize {
        self.flushes.load(core::sync::atomic::Ordering::Acquire)
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl Default for EmulatedMmu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl Mmu for EmulatedMmu {
    fn is_active(&self, directory: FrameNumber) -> bool {
        *self.active.lock() == Some(directory)
    }

    fn invalidate_page(&self, page: PageNumber) {
        self.invalidated.lock().push(page);
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, core::sync::atomic::Ordering::AcqRel);
    }
}
