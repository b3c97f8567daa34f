//! Files that can back a mapping.

use alloc::sync::Arc;
use core::fmt;

/// Stable identity of a file, used to key the page cache.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(u64);

impl FileId {
    /// Wraps a filesystem-assigned identifier.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file as seen by the memory manager.
pub trait File: Send + Sync {
    /// Identity of the file. Two handles with the same id must have the same contents.
    fn id(&self) -> FileId;

    /// Current length of the file in bytes.
    fn size_in_bytes(&self) -> usize;

    /// Reads up to `buffer.len()` bytes starting at `offset`, returning the number read.
    /// Blocks until the read completes. Reads at or past the end return 0.
    fn read_at(&self, offset: usize, buffer: &mut [u8]) -> usize;
}

/// Shared handle to a file.
pub type FileHandle = Arc<dyn File>;

/// An in-memory file that counts how often it is read.
#[cfg(any(test, feature = "software-emulation"))]
pub struct MemoryFile {
    id: FileId,
    contents: alloc::vec::Vec<u8>,
    reads: core::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "software-emulation"))]
impl MemoryFile {
    /// Creates a file with identifier `id` holding `contents`.
    pub fn new(id: u64, contents: impl Into<alloc::vec::Vec<u8>>) -> Self {
        Self {
            id: FileId::new(id),
            contents: contents.into(),
            reads: core::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Number of `read_at` calls served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(core::sync::atomic::Ordering::Acquire)
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl File for MemoryFile {
    fn id(&self) -> FileId {
        self.id
    }

    fn size_in_bytes(&self) -> usize {
        self.contents.len()
    }

    fn read_at(&self, offset: usize, buffer: &mut [u8]) -> usize {
        self.reads.fetch_add(1, core::sync::atomic::Ordering::AcqRel);
        let Some(available) = self.contents.get(offset..) else {
            return 0;
        };
        let length = available.len().min(buffer.len());
        buffer[..length].copy_from_slice(&available[..length]);
        length
    }
}
