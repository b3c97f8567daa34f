//! Read-only cache of file-backed pages.
//!
//! Cached frames are filled once and never written afterwards; writers always receive a
//! private copy through copy-on-write. A cached frame can therefore be mapped into any
//! number of address spaces at once.

use core::fmt;

use hashbrown::HashMap;

use crate::{
    AddressSpace, Backing, FaultError, FileHandle, FileId, FrameNumber, MapError, MapFlags,
    Privilege, VirtualAddress, VirtualMemoryManager, arch::PAGE_SIZE,
};

type CacheKey = (FileId, usize);

/// Errors returned by [`PageCache::read_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// The offset lies past the end of the file.
    OffsetBeyondEnd,
    /// The scratch mapping could not be placed.
    Map(MapError),
    /// The scratch mapping could not be read.
    Fault(FaultError),
}

impl From<MapError> for ReadError {
    fn from(error: MapError) -> Self {
        Self::Map(error)
    }
}

impl From<FaultError> for ReadError {
    fn from(error: FaultError) -> Self {
        Self::Fault(error)
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OffsetBeyondEnd => f.write_str("offset lies past the end of the file"),
            Self::Map(error) => write!(f, "scratch mapping failed: {}", error),
            Self::Fault(error) => write!(f, "scratch read failed: {}", error),
        }
    }
}

/// Frames holding file pages, keyed by file identity and page index.
///
/// Each cached frame carries one reference owned by the cache. There is no eviction.
pub struct PageCache {
    pages: spin::Mutex<HashMap<CacheKey, FrameNumber>>,
}

impl PageCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            pages: spin::Mutex::new(HashMap::new()),
        }
    }

    /// Returns the frame holding page `index` of `file`, reading it on first use.
    ///
    /// The lock is held across the read so that concurrent callers for the same page
    /// never read it twice. The returned frame is referenced by the cache; callers
    /// mapping it take their own reference.
    pub fn get(&self, vmm: &VirtualMemoryManager, file: &FileHandle, index: usize) -> FrameNumber {
        let key = (file.id(), index);
        let mut pages = self.pages.lock();
        if let Some(&frame) = pages.get(&key) {
            return frame;
        }

        let frame = vmm.allocate_zeroed();
        // SAFETY: the frame was just allocated and is not mapped anywhere yet.
        let bytes = unsafe { vmm.frame_bytes_mut(frame) };
        let read = file.read_at(index * PAGE_SIZE, bytes);
        vmm.frames().ref_frame(frame);
        pages.insert(key, frame);

        log::trace!(
            "page cache miss: file {} page {} -> frame {} ({} bytes)",
            key.0,
            index,
            frame,
            read
        );
        frame
    }

    /// Copies `buffer.len()` bytes of `file` from `offset` out of the cached pages covering
    /// them, reading pages that are not cached yet. The range must lie within the file.
    pub(crate) fn copy_out(&self, vmm: &VirtualMemoryManager, file: &FileHandle, offset: usize, buffer: &mut [u8]) {
        let mut done = 0;
        while done < buffer.len() {
            let position = offset + done;
            let skew = position % PAGE_SIZE;
            let chunk = (PAGE_SIZE - skew).min(buffer.len() - done);
            let frame = self.get(vmm, file, position / PAGE_SIZE);
            vmm.read_frame(frame, skew, &mut buffer[done..done + chunk]);
            done += chunk;
        }
    }

    /// Returns the cached frame for page `index` of `file` without reading it.
    pub fn lookup(&self, file: FileId, index: usize) -> Option<FrameNumber> {
        self.pages.lock().get(&(file, index)).copied()
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    /// Returns whether no page is cached.
    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    /// Reads `buffer.len()` bytes of `file` starting at `offset`.
    ///
    /// The file is mapped into a scratch region of `space`, so the bytes come through
    /// the page cache like any other file-backed access. The length is clamped to the
    /// end of the file and the rest of `buffer` is zero-filled. Returns the number of
    /// file bytes copied.
    pub fn read_all(
        vmm: &VirtualMemoryManager,
        space: &AddressSpace,
        file: &FileHandle,
        offset: usize,
        buffer: &mut [u8],
    ) -> Result<usize, ReadError> {
        let size = file.size_in_bytes();
        if offset > size {
            return Err(ReadError::OffsetBeyondEnd);
        }

        let length = buffer.len().min(size - offset);
        buffer[length..].fill(0);
        if length == 0 {
            return Ok(0);
        }

        let base = offset - offset % PAGE_SIZE;
        let skew = offset - base;
        let scratch = space.mmap(
            VirtualAddress::new(0),
            skew + length,
            MapFlags::REAL,
            Backing::file(file.clone(), base, size),
        )?;

        let copied = space.read(vmm, Privilege::Kernel, scratch + skew, &mut buffer[..length]);
        space.munmap(vmm, scratch)?;
        copied?;

        Ok(length)
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}
