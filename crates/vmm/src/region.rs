//! Virtual memory regions.
//!
//! A region is a contiguous range of virtual pages with uniform access flags and an
//! optional file backing. Regions only describe what a page should contain; page table
//! entries are materialized lazily by the fault handler.

use core::fmt;

use bitflags::bitflags;

use crate::{FileHandle, PageFlags, PageNumber, arch};

bitflags! {
    /// Flags describing a mapping request and the resulting region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Data pages are reference-counted frames.
        const REAL = 1 << 0;
        /// The region is writable.
        const WRITE = 1 << 1;
        /// The region is user-accessible and lives in the user half.
        const USER = 1 << 2;
        /// Writes are shared with forked address spaces.
        const SHARED = 1 << 3;
        /// Place the region exactly at the requested address.
        const FIXED = 1 << 4;
        /// The file offset does not have to be page-aligned.
        const UNALIGNED = 1 << 5;
        /// Honor the requested file length, zero-filling past it.
        const TRUNCATE = 1 << 6;
    }
}

/// What a region's pages contain before they are first written.
#[derive(Clone)]
pub enum Backing {
    /// Zero-filled memory.
    Anonymous,
    /// Bytes of `file` starting at `offset`; at most `length` bytes are visible.
    File {
        file: FileHandle,
        offset: usize,
        length: usize,
    },
}

impl Backing {
    /// Backs a region with `file` from `offset`, `length` bytes visible.
    pub fn file(file: FileHandle, offset: usize, length: usize) -> Self {
        Self::File {
            file,
            offset,
            length,
        }
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::File {
                file,
                offset,
                length,
            } => f
                .debug_struct("File")
                .field("id", &file.id())
                .field("offset", offset)
                .field("length", length)
                .finish(),
        }
    }
}

/// A mapped range of virtual pages `[start, start + pages)`.
#[derive(Debug, Clone)]
pub struct VirtualRegion {
    start: PageNumber,
    pages: usize,
    flags: MapFlags,
    backing: Backing,
}

impl VirtualRegion {
    /// Creates a region of `pages` pages starting at `start`.
    pub fn new(start: PageNumber, pages: usize, flags: MapFlags, backing: Backing) -> Self {
        Self {
            start,
            pages,
            flags,
            backing,
        }
    }

    /// First page of the region.
    pub fn start(&self) -> PageNumber {
        self.start
    }

    /// First page after the region.
    pub fn end(&self) -> PageNumber {
        self.start + self.pages
    }

    /// Number of pages in the region.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Flags the region was mapped with.
    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    /// What the region's pages contain before they are first written.
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Returns whether `page` lies inside the region.
    pub fn contains(&self, page: PageNumber) -> bool {
        page >= self.start && page < self.end()
    }

    /// Pages of this region that fall in `[lo, hi)`, ascending.
    pub fn pages_in(&self, lo: PageNumber, hi: PageNumber) -> impl Iterator<Item = PageNumber> {
        let start = self.start.max(lo).as_usize();
        let end = self.end().min(hi).as_usize();
        (start..end.max(start)).map(PageNumber::new)
    }

    /// Whether data entries of this region hold frame references.
    pub fn is_tracked(&self) -> bool {
        self.flags.contains(MapFlags::REAL)
    }

    /// Whether writable entries of this region must be write-protected when their table
    /// becomes shared, so that the next write copies the page.
    pub fn is_copy_on_write(&self) -> bool {
        self.flags.contains(MapFlags::REAL | MapFlags::WRITE) && !self.flags.contains(MapFlags::SHARED)
    }

    /// Entry flags granted to a privately owned page of this region.
    pub fn entry_flags(&self) -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set_present(true);
        flags.set_writable(self.flags.contains(MapFlags::WRITE));
        flags.set_user(self.flags.contains(MapFlags::USER));
        flags
    }

    /// Number of file bytes visible through this region, measured against the file's
    /// current size. Zero for anonymous regions.
    pub fn visible_bytes(&self) -> usize {
        match &self.backing {
            Backing::Anonymous => 0,
            Backing::File {
                file,
                offset,
                length,
            } => file.size_in_bytes().saturating_sub(*offset).min(*length),
        }
    }

    /// Whether page `index` of the region may be served from the page cache.
    ///
    /// Pages of unaligned mappings, and the partial last page of a truncated mapping,
    /// mix file bytes with mapping-specific content and need a private frame.
    pub fn is_cacheable(&self, index: usize) -> bool {
        if self.flags.contains(MapFlags::UNALIGNED) {
            return false;
        }
        !self.flags.contains(MapFlags::TRUNCATE) || (index + 1) * arch::PAGE_SIZE <= self.visible_bytes()
    }
}
