//! Architecture-independent page table management.
//!
//! This module provides the `PageDirectory` type, which owns the root table of an
//! address space and materializes page tables and data pages on demand.
//!
//! Tables and data pages are shared copy-on-write. A directory slot without the
//! writable bit points at a table that may be shared with another directory; a table
//! entry without the writable bit inside a writable region points at a data page that
//! may be shared with another table. Before either is modified the caller either proves
//! it is the last referent, under the frame lock, or makes a private copy.
//!
//! Lock order: a table frame lock may be held while taking a data frame lock.

use crate::{
    AddressSpace, Backing, FrameNumber, PageEntry, PageFlags, PageNumber, PageTable,
    RegionMap, VirtualMemoryManager,
    arch::{ENTRIES_PER_TABLE, PAGE_SIZE},
    fault::{Access, Privilege},
};

/// The root page table of an address space.
pub struct PageDirectory {
    frame: FrameNumber,
}

impl PageDirectory {
    /// Allocates an empty directory.
    pub fn new(vmm: &VirtualMemoryManager) -> Self {
        let frame = vmm.allocate_zeroed();
        vmm.frames().ref_frame(frame);
        Self { frame }
    }

    /// Frame holding the directory, as loaded into the MMU.
    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    /// Returns the leaf entry for `page` with the effective permissions of both levels,
    /// or `None` if either level is absent.
    pub fn walk(&self, vmm: &VirtualMemoryManager, page: PageNumber) -> Option<PageEntry> {
        let slot = vmm.table(self.frame).load(page.directory_index());
        let table = vmm.table(slot.frame()?);
        let entry = table.load(page.table_index());
        entry
            .is_present()
            .then(|| entry.with_flags(slot.flags().intersection(entry.flags())))
    }

    /// Translates `page` for an access, as the MMU would. Returns `None` where the MMU
    /// would raise a page fault.
    pub fn translate(
        &self,
        vmm: &VirtualMemoryManager,
        page: PageNumber,
        access: Access,
        privilege: Privilege,
    ) -> Option<FrameNumber> {
        let entry = self.walk(vmm, page)?;
        let flags = entry.flags();
        if access == Access::Write && !flags.is_writable() {
            return None;
        }
        if privilege == Privilege::User && !flags.is_user() {
            return None;
        }
        entry.frame()
    }

    /// Returns the table covering `page`, making it safe for this directory to modify.
    ///
    /// An absent table is created. A table shared with another directory is claimed in
    /// place when this directory is its last referent and copied otherwise.
    pub fn ensure_writable_table<'a>(
        &self,
        vmm: &'a VirtualMemoryManager,
        space: &AddressSpace,
        page: PageNumber,
    ) -> PageTable<'a> {
        let directory = vmm.table(self.frame);
        let index = page.directory_index();
        let base = PageNumber::from_indices(index, 0);

        loop {
            let slot = directory.load(index);
            let Some(frame) = slot.frame() else {
                let table = vmm.allocate_zeroed();
                vmm.frames().ref_frame(table);
                match directory.compare_exchange(index, slot, PageEntry::new(table, PageFlags::all())) {
                    Ok(_) => return vmm.table(table),
                    Err(_) => {
                        vmm.frames().release(table);
                        continue;
                    }
                }
            };

            if slot.is_writable() {
                return vmm.table(frame);
            }

            let guard = vmm.frames().lock(frame);
            if directory.load(index) != slot {
                continue;
            }

            if guard.count() == 1 {
                let table = vmm.table(frame);
                reprotect(&table, &space.regions().read(), base);
                directory.store(index, slot.with_flags(PageFlags::all()));
                log::trace!("claimed table {} for pages from {}", frame, base);
                return table;
            }

            let copy = vmm.allocate_zeroed();
            let (source, target) = (vmm.table(frame), vmm.table(copy));
            {
                let regions = space.regions().read();
                copy_table(vmm, &source, &target, &regions, base);
                reprotect(&target, &regions, base);
            }
            vmm.frames().ref_frame(copy);
            directory.store(index, PageEntry::new(copy, PageFlags::all()));
            drop(guard);

            release_table(vmm, &space.regions().read(), index, frame);
            log::trace!("copied table {} into {} for pages from {}", frame, copy, base);
            return target;
        }
    }

    /// Returns the data page for `page`, materializing it on first touch and copying it
    /// when a write hits a shared page.
    ///
    /// `table` must come from [`PageDirectory::ensure_writable_table`].
    ///
    /// # Panics
    ///
    /// Panics if an absent entry has no tracked region to populate it from.
    pub fn ensure_data_page(
        &self,
        vmm: &VirtualMemoryManager,
        space: &AddressSpace,
        table: &PageTable<'_>,
        page: PageNumber,
        for_write: bool,
    ) -> FrameNumber {
        let index = page.table_index();
        loop {
            let entry = table.load(index);
            let Some(frame) = entry.frame() else {
                populate(vmm, space, table, page);
                continue;
            };

            if !for_write || entry.is_writable() {
                return frame;
            }

            let guard = vmm.frames().lock(frame);
            if table.load(index) != entry {
                continue;
            }

            let mut flags = entry.flags();
            flags.set_writable(true);
            if guard.count() == 1 {
                table.store(index, entry.with_flags(flags));
                return frame;
            }

            let copy = vmm.frames().allocate();
            vmm.copy_frame(frame, copy);
            vmm.frames().ref_frame(copy);
            table.store(index, PageEntry::new(copy, flags));
            drop(guard);

            vmm.frames().release(frame);
            log::trace!("copied frame {} into {} for write to page {}", frame, copy, page);
            return copy;
        }
    }
}

/// Installs the first entry for `page` in `table`.
///
/// Losing a race against another core installing the same entry is harmless: the loser
/// drops its reference and the caller re-reads the winner's entry.
fn populate(vmm: &VirtualMemoryManager, space: &AddressSpace, table: &PageTable<'_>, page: PageNumber) {
    let region = space
        .regions()
        .read()
        .find(page)
        .cloned()
        .unwrap_or_else(|| panic!("page {} has no region to populate it from", page));
    assert!(
        region.is_tracked(),
        "page {} of untracked region at {} has no entry",
        page,
        region.start()
    );

    let mut flags = region.entry_flags();
    flags.set_writable(false);

    let frame = match region.backing() {
        Backing::Anonymous => vmm.zero_page(),
        Backing::File { file, offset, .. } => {
            let index = page - region.start();
            let start = index * PAGE_SIZE;
            let visible = region.visible_bytes();
            if start >= visible {
                vmm.zero_page()
            } else if region.is_cacheable(index) {
                vmm.page_cache().get(vmm, file, offset / PAGE_SIZE + index)
            } else {
                let frame = vmm.allocate_zeroed();
                let length = PAGE_SIZE.min(visible - start);
                // SAFETY: the frame was just allocated and is not mapped anywhere yet.
                let bytes = unsafe { vmm.frame_bytes_mut(frame) };
                vmm.page_cache().copy_out(vmm, file, offset + start, &mut bytes[..length]);
                flags = region.entry_flags();
                frame
            }
        }
    };

    vmm.frames().ref_frame(frame);
    if table
        .compare_exchange(page.table_index(), PageEntry::EMPTY, PageEntry::new(frame, flags))
        .is_err()
    {
        vmm.frames().release(frame);
    }
}

/// Copies the entries of `source` covering regions into `target`. Tracked entries gain
/// a reference; untracked entries are copied verbatim.
fn copy_table(
    vmm: &VirtualMemoryManager,
    source: &PageTable<'_>,
    target: &PageTable<'_>,
    regions: &RegionMap,
    base: PageNumber,
) {
    for region in regions.range(base, base + ENTRIES_PER_TABLE) {
        for page in region.pages_in(base, base + ENTRIES_PER_TABLE) {
            let index = page.table_index();
            let entry = source.load(index);
            if !entry.is_present() {
                continue;
            }

            if region.is_tracked() {
                target.set(vmm.frames(), index, entry);
            } else {
                target.store(index, entry);
            }

            #[cfg(feature = "detailed-logging")]
            log::trace!("copied entry {:#x} for page {}", entry.as_u32(), page);
        }
    }
}

/// Write-protects the entries of `table` belonging to copy-on-write regions, so the
/// next write to each page goes through the fault handler.
fn reprotect(table: &PageTable<'_>, regions: &RegionMap, base: PageNumber) {
    let mut writable = PageFlags::empty();
    writable.set_writable(true);
    for region in regions.range(base, base + ENTRIES_PER_TABLE) {
        if !region.is_copy_on_write() {
            continue;
        }
        for page in region.pages_in(base, base + ENTRIES_PER_TABLE) {
            table.clear_flags(page.table_index(), writable);
        }
    }
}

/// Drops one reference to the table in directory slot `index`. When it was the last,
/// the references held by the table's tracked entries are dropped too.
pub(crate) fn release_table(vmm: &VirtualMemoryManager, regions: &RegionMap, index: usize, frame: FrameNumber) {
    vmm.frames().unref(frame, |frame, remaining| {
        if remaining == 0 {
            let table = vmm.table(frame);
            let base = PageNumber::from_indices(index, 0);
            for region in regions.range(base, base + ENTRIES_PER_TABLE) {
                if !region.is_tracked() {
                    continue;
                }
                for page in region.pages_in(base, base + ENTRIES_PER_TABLE) {
                    if let Some(data) = table.load(page.table_index()).frame() {
                        vmm.frames().release(data);
                    }
                }
            }
        }
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EmulatedMmu, MapFlags, MemoryFile, VirtualAddress};
    use alloc::sync::Arc;

    fn setup() -> VirtualMemoryManager {
        VirtualMemoryManager::emulated(256, Arc::new(EmulatedMmu::new()))
    }

    fn anonymous(space: &AddressSpace, pages: usize, flags: MapFlags) -> PageNumber {
        space
            .mmap(VirtualAddress::new(0), pages * PAGE_SIZE, flags, Backing::Anonymous)
            .unwrap()
            .page_number()
    }

    fn touch(vmm: &VirtualMemoryManager, space: &AddressSpace, page: PageNumber, for_write: bool) -> FrameNumber {
        let directory = space.directory();
        let table = directory.ensure_writable_table(vmm, space, page);
        directory.ensure_data_page(vmm, space, &table, page, for_write)
    }

    mod tables {
        use super::*;

        #[test]
        fn absent_table_is_created_writable() {
            let vmm = setup();
            let space = AddressSpace::new(&vmm);
            let page = PageNumber::new(70);

            let table = space.directory().ensure_writable_table(&vmm, &space, page);
            let slot = vmm.table(space.directory().frame()).load(page.directory_index());
            assert_eq!(slot.frame(), Some(table.frame()));
            assert_eq!(slot.flags(), PageFlags::all());
            assert_eq!(vmm.frames().count(table.frame()), 1);
        }

        #[test]
        fn writable_table_is_reused() {
            let vmm = setup();
            let space = AddressSpace::new(&vmm);
            let page = PageNumber::new(70);

            let first = space.directory().ensure_writable_table(&vmm, &space, page).frame();
            let second = space.directory().ensure_writable_table(&vmm, &space, page + 1).frame();
            assert_eq!(first, second);
        }

        #[test]
        fn sole_referent_claims_in_place_and_reprotects() {
            let vmm = setup();
            let space = AddressSpace::new(&vmm);
            let page = anonymous(&space, 1, MapFlags::REAL | MapFlags::WRITE);
            let data = touch(&vmm, &space, page, true);

            let child = space.fork(&vmm);
            child.destroy(&vmm);

            let table = space.directory().ensure_writable_table(&vmm, &space, page);
            assert_eq!(vmm.frames().count(table.frame()), 1);
            assert_eq!(table.load(page.table_index()).frame(), Some(data));
            assert!(!table.load(page.table_index()).is_writable());

            // sole owner of the data too, so the write upgrades in place
            assert_eq!(space.directory().ensure_data_page(&vmm, &space, &table, page, true), data);
        }

        #[test]
        fn shared_table_is_copied_with_references() {
            let vmm = setup();
            let space = AddressSpace::new(&vmm);
            let page = anonymous(&space, 1, MapFlags::REAL | MapFlags::WRITE);
            let data = touch(&vmm, &space, page, true);
            let shared = space.directory().ensure_writable_table(&vmm, &space, page).frame();

            let child = space.fork(&vmm);
            assert_eq!(vmm.frames().count(shared), 2);

            let copy = child.directory().ensure_writable_table(&vmm, &child, page);
            assert_ne!(copy.frame(), shared);
            assert_eq!(vmm.frames().count(shared), 1);
            assert_eq!(vmm.frames().count(data), 2);
            assert!(!copy.load(page.table_index()).is_writable());
        }

        #[test]
        fn shared_regions_keep_write_access() {
            let vmm = setup();
            let space = AddressSpace::new(&vmm);
            let page = anonymous(&space, 1, MapFlags::REAL | MapFlags::WRITE | MapFlags::SHARED);
            let data = touch(&vmm, &space, page, true);

            let child = space.fork(&vmm);
            let copy = child.directory().ensure_writable_table(&vmm, &child, page);
            assert!(copy.load(page.table_index()).is_writable());
            assert_eq!(child.directory().ensure_data_page(&vmm, &child, &copy, page, true), data);
        }

        #[test]
        fn untracked_entries_are_copied_verbatim() {
            let vmm = setup();
            let space = AddressSpace::new(&vmm);
            space.identity_map(&vmm, PageNumber::new(1), 8).unwrap();

            let child = space.fork(&vmm);
            let copy = child.directory().ensure_writable_table(&vmm, &child, PageNumber::new(3));
            let entry = copy.load(3);
            assert_eq!(entry.frame(), Some(FrameNumber::new(3)));
            assert_eq!(entry.flags(), PageFlags::kernel());
        }
    }

    mod data {
        use super::*;

        #[test]
        fn first_read_maps_zero_page() {
            let vmm = setup();
            let space = AddressSpace::new(&vmm);
            let page = anonymous(&space, 1, MapFlags::REAL | MapFlags::WRITE);

            assert_eq!(touch(&vmm, &space, page, false), vmm.zero_page());
            assert!(!space.directory().walk(&vmm, page).unwrap().is_writable());
        }

        #[test]
        fn write_after_read_copies_zero_page() {
            let vmm = setup();
            let space = AddressSpace::new(&vmm);
            let page = anonymous(&space, 1, MapFlags::REAL | MapFlags::WRITE);

            touch(&vmm, &space, page, false);
            let frame = touch(&vmm, &space, page, true);
            assert_ne!(frame, vmm.zero_page());
            assert_eq!(vmm.frames().count(frame), 1);
            assert_eq!(vmm.frames().count(vmm.zero_page()), 1);
        }

        #[test]
        #[should_panic(expected = "has no region")]
        fn page_outside_regions_panics() {
            let vmm = setup();
            let space = AddressSpace::new(&vmm);
            touch(&vmm, &space, PageNumber::new(40), false);
        }

        #[test]
        fn file_pages_past_visible_length_map_zero_page() {
            let vmm = setup();
            let space = AddressSpace::new(&vmm);
            let file = Arc::new(MemoryFile::new(1, alloc::vec![9u8; PAGE_SIZE]));
            let base = space
                .mmap(VirtualAddress::new(0), 3 * PAGE_SIZE, MapFlags::REAL, Backing::file(file.clone(), 0, 0))
                .unwrap()
                .page_number();

            assert_ne!(touch(&vmm, &space, base, false), vmm.zero_page());
            assert_eq!(touch(&vmm, &space, base + 2, false), vmm.zero_page());
            assert_eq!(file.reads(), 1);
        }

        #[test]
        fn truncated_partial_page_is_private() {
            let vmm = setup();
            let space = AddressSpace::new(&vmm);
            let file = Arc::new(MemoryFile::new(1, alloc::vec![9u8; 2 * PAGE_SIZE]));
            let base = space
                .mmap(
                    VirtualAddress::new(0),
                    2 * PAGE_SIZE,
                    MapFlags::REAL | MapFlags::WRITE | MapFlags::TRUNCATE,
                    Backing::file(file.clone(), 0, PAGE_SIZE + 4),
                )
                .unwrap()
                .page_number();

            let cached = touch(&vmm, &space, base, false);
            assert_eq!(vmm.page_cache().lookup(crate::FileId::new(1), 0), Some(cached));

            let private = touch(&vmm, &space, base + 1, false);
            assert_ne!(vmm.page_cache().lookup(crate::FileId::new(1), 1), Some(private));
            assert_eq!(vmm.frames().count(private), 1);
            assert!(space.directory().walk(&vmm, base + 1).unwrap().is_writable());

            let mut bytes = [0xFFu8; PAGE_SIZE];
            vmm.read_frame(private, 0, &mut bytes);
            assert_eq!(&bytes[..4], &[9u8; 4]);
            assert!(bytes[4..].iter().all(|&b| b == 0));
        }

        #[derive(Debug, Clone, Copy)]
        enum Expected {
            Cached(usize),
            Private(usize),
            Zero,
        }

        #[test]
        fn file_page_kinds_across_flag_combinations() {
            use Expected::{Cached, Private, Zero};

            let size = 2 * PAGE_SIZE + 40;
            let truncated = PAGE_SIZE + 40;
            let contents: alloc::vec::Vec<u8> = (0..size).map(|i| (i % 251) as u8 + 1).collect();
            let cases = [
                (MapFlags::empty(), 0, [Cached(PAGE_SIZE), Cached(PAGE_SIZE), Cached(40), Zero]),
                (MapFlags::UNALIGNED, 8, [Private(PAGE_SIZE), Private(PAGE_SIZE), Private(32), Zero]),
                (MapFlags::TRUNCATE, 0, [Cached(PAGE_SIZE), Private(40), Zero, Zero]),
                (
                    MapFlags::UNALIGNED | MapFlags::TRUNCATE,
                    8,
                    [Private(PAGE_SIZE), Private(40), Zero, Zero],
                ),
            ];

            for (extra, offset, pages) in cases {
                let vmm = setup();
                let space = AddressSpace::new(&vmm);
                let file = Arc::new(MemoryFile::new(1, contents.clone()));
                let base = space
                    .mmap(
                        VirtualAddress::new(0),
                        4 * PAGE_SIZE,
                        MapFlags::REAL | MapFlags::WRITE | extra,
                        Backing::file(file, offset, truncated),
                    )
                    .unwrap()
                    .page_number();

                for (index, expected) in pages.into_iter().enumerate() {
                    let frame = touch(&vmm, &space, base + index, false);
                    let writable = space.directory().walk(&vmm, base + index).unwrap().is_writable();
                    let cached = vmm.page_cache().lookup(crate::FileId::new(1), offset / PAGE_SIZE + index);

                    let length = match expected {
                        Cached(length) => {
                            assert_eq!(cached, Some(frame), "{:?} page {}", extra, index);
                            assert!(!writable, "{:?} page {}", extra, index);
                            length
                        }
                        Private(length) => {
                            assert_ne!(cached, Some(frame), "{:?} page {}", extra, index);
                            assert_eq!(vmm.frames().count(frame), 1, "{:?} page {}", extra, index);
                            assert!(writable, "{:?} page {}", extra, index);
                            length
                        }
                        Zero => {
                            assert_eq!(frame, vmm.zero_page(), "{:?} page {}", extra, index);
                            assert!(!writable, "{:?} page {}", extra, index);
                            0
                        }
                    };

                    let mut bytes = [0xFFu8; PAGE_SIZE];
                    vmm.read_frame(frame, 0, &mut bytes);
                    if length > 0 {
                        let start = offset + index * PAGE_SIZE;
                        assert_eq!(&bytes[..length], &contents[start..start + length], "{:?} page {}", extra, index);
                    }
                    assert!(bytes[length..].iter().all(|&b| b == 0), "{:?} page {}", extra, index);
                }
            }
        }

        #[test]
        fn unaligned_mapping_reads_shifted_bytes() {
            let vmm = setup();
            let space = AddressSpace::new(&vmm);
            let contents: alloc::vec::Vec<u8> = (0..2 * PAGE_SIZE).map(|i| i as u8).collect();
            let file = Arc::new(MemoryFile::new(1, contents.clone()));
            let base = space
                .mmap(
                    VirtualAddress::new(0),
                    PAGE_SIZE,
                    MapFlags::REAL | MapFlags::UNALIGNED,
                    Backing::file(file.clone(), 5, 0),
                )
                .unwrap()
                .page_number();

            let frame = touch(&vmm, &space, base, false);
            let mut bytes = [0u8; PAGE_SIZE];
            vmm.read_frame(frame, 0, &mut bytes);
            assert_eq!(&bytes[..], &contents[5..5 + PAGE_SIZE]);
            assert_eq!(vmm.frames().count(frame), 1);
        }
    }
}
