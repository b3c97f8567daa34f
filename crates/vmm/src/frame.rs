//! Physical frame bookkeeping.
//!
//! Every frame that can appear in a page table entry has a [`Frame`] record holding its
//! reference count. A frame is shared by every present entry that targets it and is
//! returned to the [`FrameAllocator`] when the last such entry is cleared.

use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::FrameNumber;

/// Source of raw physical frames.
///
/// Implementations must be safe to call from several cores at once.
pub trait FrameAllocator: Send + Sync {
    /// Allocates one frame, or returns `None` when physical memory is exhausted.
    fn allocate_frame(&self) -> Option<FrameNumber>;

    /// Returns a frame previously obtained from [`FrameAllocator::allocate_frame`].
    fn free_frame(&self, frame: FrameNumber);
}

/// Holds metadata for a physical memory frame.
pub struct Frame {
    /// Flags identifying the state of this frame.
    pub flags: FrameFlags,
    /// Number of holders referencing this frame.
    refs: AtomicUsize,
    /// Serializes decrements and "last referent" decisions.
    lock: spin::Mutex<()>,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            flags: FrameFlags::new(),
            refs: AtomicUsize::new(0),
            lock: spin::Mutex::new(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFlag {
    /// Frame has been handed out by the allocator.
    Allocated = 1 << 0,
    /// Frame holds a permanent reference and must never be freed.
    Pinned = 1 << 1,
}

/// Atomic flags for a physical memory frame.
#[derive(Default)]
pub struct FrameFlags(AtomicU64);

impl FrameFlags {
    /// Creates a new `FrameFlags` instance with all flags cleared.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Sets the given flag atomically.
    pub fn atomic_set(&self, flag: FrameFlag) {
        let mask = flag as u64;
        self.0.fetch_or(mask, Ordering::AcqRel);
    }

    /// Clears the given flag atomically.
    pub fn atomic_clear(&self, flag: FrameFlag) {
        let mask = !(flag as u64);
        self.0.fetch_and(mask, Ordering::AcqRel);
    }

    /// Tests if the given flag is set, atomically.
    pub fn atomic_test(&self, flag: FrameFlag) -> bool {
        let mask = flag as u64;
        let value = self.0.load(Ordering::Acquire);
        (value & mask) != 0
    }

    /// Tests the given flag and sets it atomically, returning the previous value.
    pub fn atomic_test_and_set(&self, flag: FrameFlag) -> bool {
        let mask = flag as u64;
        let old = self.0.fetch_or(mask, Ordering::AcqRel);
        (old & mask) != 0
    }

    /// Tests the given flag and clears it atomically, returning the previous value.
    pub fn atomic_test_and_clear(&self, flag: FrameFlag) -> bool {
        let mask = flag as u64;
        let old = self.0.fetch_and(!mask, Ordering::AcqRel);
        (old & mask) != 0
    }
}

/// A held frame lock.
///
/// While the guard lives no other holder can drop its reference, so a count of one
/// proves the caller is the only referent.
pub struct FrameGuard<'a> {
    frame: &'a Frame,
    _lock: spin::MutexGuard<'a, ()>,
}

impl FrameGuard<'_> {
    /// Returns the reference count observed under the lock.
    pub fn count(&self) -> usize {
        self.frame.refs.load(Ordering::Acquire)
    }
}

/// Per-frame reference counts over all frames the allocator can hand out.
pub struct FrameRefCounter {
    frames: Box<[Frame]>,
    allocator: Arc<dyn FrameAllocator>,
    allocated: AtomicUsize,
}

impl FrameRefCounter {
    /// Creates reference counts for frames `0..frame_count`.
    pub fn new(allocator: Arc<dyn FrameAllocator>, frame_count: usize) -> Self {
        Self {
            frames: (0..frame_count).map(|_| Frame::default()).collect(),
            allocator,
            allocated: AtomicUsize::new(0),
        }
    }

    /// Allocates a frame with a reference count of zero.
    ///
    /// # Panics
    ///
    /// Panics if physical memory is exhausted.
    pub fn allocate(&self) -> FrameNumber {
        let Some(frame) = self.allocator.allocate_frame() else {
            panic!("out of physical frames");
        };
        let record = self.record(frame);
        if record.flags.atomic_test_and_set(FrameFlag::Allocated) {
            panic!("frame {} handed out while still allocated", frame);
        }
        record.refs.store(0, Ordering::Release);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        frame
    }

    /// Takes a reference on `frame`.
    pub fn ref_frame(&self, frame: FrameNumber) {
        let record = self.record(frame);
        debug_assert!(
            record.flags.atomic_test(FrameFlag::Allocated),
            "reference taken on free frame {}",
            frame
        );
        record.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a reference on `frame`.
    ///
    /// `decide` runs under the frame lock with the remaining count; the frame is freed
    /// only when the count reached zero and `decide` agrees. Returns whether the frame
    /// was freed.
    ///
    /// # Panics
    ///
    /// Panics if the count would drop below zero.
    pub fn unref(&self, frame: FrameNumber, decide: impl FnOnce(FrameNumber, usize) -> bool) -> bool {
        let record = self.record(frame);
        let lock = record.lock.lock();
        let Ok(previous) = record
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
        else {
            panic!("reference count underflow on frame {}", frame);
        };

        let remaining = previous - 1;
        if !decide(frame, remaining) || remaining != 0 {
            return false;
        }
        if record.flags.atomic_test(FrameFlag::Pinned) {
            panic!("last reference to pinned frame {} dropped", frame);
        }
        drop(lock);

        self.free(frame);
        true
    }

    /// Drops a reference on `frame`, freeing it when it was the last.
    pub fn release(&self, frame: FrameNumber) -> bool {
        self.unref(frame, |_, _| true)
    }

    /// Takes a permanent reference on `frame`.
    pub fn pin(&self, frame: FrameNumber) {
        self.ref_frame(frame);
        self.record(frame).flags.atomic_set(FrameFlag::Pinned);
    }

    /// Locks `frame` so the caller can decide whether it is the last referent.
    pub fn lock(&self, frame: FrameNumber) -> FrameGuard<'_> {
        let record = self.record(frame);
        FrameGuard {
            frame: record,
            _lock: record.lock.lock(),
        }
    }

    /// Returns the current reference count of `frame`.
    pub fn count(&self, frame: FrameNumber) -> usize {
        self.record(frame).refs.load(Ordering::Acquire)
    }

    /// Returns whether `frame` is currently allocated.
    pub fn is_allocated(&self, frame: FrameNumber) -> bool {
        self.record(frame).flags.atomic_test(FrameFlag::Allocated)
    }

    /// Number of frames currently allocated through this counter.
    pub fn allocated_frames(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    fn free(&self, frame: FrameNumber) {
        if !self.record(frame).flags.atomic_test_and_clear(FrameFlag::Allocated) {
            panic!("double free of frame {}", frame);
        }
        self.allocated.fetch_sub(1, Ordering::Relaxed);
        self.allocator.free_frame(frame);
        log::trace!("freed frame {}", frame);
    }

    fn record(&self, frame: FrameNumber) -> &Frame {
        self.frames
            .get(frame.as_usize())
            .unwrap_or_else(|| panic!("frame {} is outside managed memory", frame))
    }
}
