//! Address space management.
//!
//! An address space pairs a region map with a page directory. Regions are added by
//! `mmap` without touching the page tables; pages appear on first access through the
//! fault handler. Address spaces are duplicated with copy-on-write sharing by
//! [`AddressSpace::fork`] and torn down explicitly by [`AddressSpace::destroy`].

use spin::RwLock;

use crate::{
    Backing, FaultError, FrameNumber, MapError, MapFlags, PageDirectory, PageEntry, PageFault,
    PageFlags, PageNumber, RegionMap, VirtualAddress, VirtualMemoryManager, VirtualRegion,
    arch::{self, ENTRIES_PER_TABLE, PAGE_SIZE},
    fault::{Access, Privilege},
    numbers::page_count,
    page_directory::release_table,
};

/// A virtual address space: mapped regions plus the page tables realizing them.
pub struct AddressSpace {
    regions: RwLock<RegionMap>,
    directory: PageDirectory,
}

impl AddressSpace {
    /// Creates an empty address space with a fresh page directory.
    pub fn new(vmm: &VirtualMemoryManager) -> Self {
        Self {
            regions: RwLock::new(RegionMap::new()),
            directory: PageDirectory::new(vmm),
        }
    }

    /// The page directory realizing this address space.
    pub fn directory(&self) -> &PageDirectory {
        &self.directory
    }

    /// The regions mapped in this address space.
    pub fn regions(&self) -> &RwLock<RegionMap> {
        &self.regions
    }

    /// Whether this address space is loaded on the current core.
    pub fn is_active(&self, vmm: &VirtualMemoryManager) -> bool {
        vmm.mmu().is_active(self.directory.frame())
    }

    /// Maps `count` pages from `first` onto the frames with the same numbers.
    ///
    /// The entries are installed immediately and are not reference-counted; the region
    /// is shared verbatim with every address space forked from this one.
    pub fn identity_map(&self, vmm: &VirtualMemoryManager, first: PageNumber, count: usize) -> Result<(), MapError> {
        if count == 0 {
            return Err(MapError::ZeroLength);
        }
        if first.as_usize() < arch::KERNEL_START_PAGE || first.as_usize() + count > arch::TOTAL_PAGES {
            return Err(MapError::OutOfRange);
        }

        let region = VirtualRegion::new(
            first,
            count,
            MapFlags::FIXED | MapFlags::WRITE | MapFlags::SHARED,
            Backing::Anonymous,
        );
        self.regions.write().insert(region)?;

        for number in first.as_usize()..first.as_usize() + count {
            let page = PageNumber::new(number);
            let table = self.directory.ensure_writable_table(vmm, self, page);
            table.store(
                page.table_index(),
                PageEntry::new(FrameNumber::new(number), PageFlags::kernel()),
            );
        }

        log::debug!("identity mapped {} pages at {}", count, first.start());
        Ok(())
    }

    /// Adds a region of `length` bytes, rounded up to whole pages.
    ///
    /// With [`MapFlags::FIXED`] the region is placed at `address`, which must lie in the
    /// user half for [`MapFlags::USER`] regions; otherwise the lowest free range of the
    /// kernel or user half (per [`MapFlags::USER`]) is used. Without
    /// [`MapFlags::TRUNCATE`] a file backing exposes the whole file; with it, the given
    /// length clamped to the file. No page table entries are created.
    pub fn mmap(
        &self,
        address: VirtualAddress,
        length: usize,
        flags: MapFlags,
        backing: Backing,
    ) -> Result<VirtualAddress, MapError> {
        if !address.is_aligned(PAGE_SIZE) {
            return Err(MapError::Misaligned);
        }

        let backing = match backing {
            Backing::Anonymous => Backing::Anonymous,
            Backing::File {
                file,
                offset,
                length: visible,
            } => {
                if !flags.contains(MapFlags::UNALIGNED) && offset % PAGE_SIZE != 0 {
                    return Err(MapError::Misaligned);
                }
                let size = file.size_in_bytes();
                let visible = if flags.contains(MapFlags::TRUNCATE) {
                    visible.min(size)
                } else {
                    size
                };
                Backing::file(file, offset, visible)
            }
        };

        let pages = page_count(length);
        if pages == 0 {
            return Err(MapError::ZeroLength);
        }

        let (lo, hi) = if flags.contains(MapFlags::USER) {
            (PageNumber::new(arch::USER_START_PAGE), PageNumber::new(arch::USER_END_PAGE))
        } else {
            (PageNumber::new(arch::KERNEL_START_PAGE), PageNumber::new(arch::USER_START_PAGE))
        };

        let mut regions = self.regions.write();
        let start = if flags.contains(MapFlags::FIXED) {
            // kernel mappings may be placed anywhere but page 0
            let (lo, hi) = if flags.contains(MapFlags::USER) {
                (lo, hi)
            } else {
                (PageNumber::new(arch::KERNEL_START_PAGE), PageNumber::new(arch::TOTAL_PAGES))
            };
            let start = address.page_number();
            if start < lo || start > hi || hi - start < pages {
                return Err(MapError::OutOfRange);
            }
            start
        } else {
            regions.first_fit(lo, hi, pages).ok_or(MapError::NoSpace)?
        };

        regions.insert(VirtualRegion::new(start, pages, flags, backing))?;
        log::debug!("mapped {} pages at {} ({:?})", pages, start.start(), flags);
        Ok(start.start())
    }

    /// Removes the region containing `address` and drops every entry it had faulted in.
    ///
    /// Pages that were never touched cost nothing.
    pub fn munmap(&self, vmm: &VirtualMemoryManager, address: VirtualAddress) -> Result<(), MapError> {
        let region = self
            .regions
            .write()
            .remove(address.page_number())
            .ok_or(MapError::NotMapped)?;

        let directory = vmm.table(self.directory.frame());
        let mut page = region.start();
        while page < region.end() {
            let Some(table) = directory.load(page.directory_index()).frame() else {
                page = PageNumber::from_indices(page.directory_index() + 1, 0);
                continue;
            };
            if !vmm.table(table).load(page.table_index()).is_present() {
                page = page + 1;
                continue;
            }

            let table = self.directory.ensure_writable_table(vmm, self, page);
            if region.is_tracked() {
                table.set(vmm.frames(), page.table_index(), PageEntry::EMPTY);
            } else {
                table.store(page.table_index(), PageEntry::EMPTY);
            }
            page = page + 1;
        }

        if self.is_active(vmm) {
            for number in region.start().as_usize()..region.end().as_usize() {
                vmm.mmu().invalidate_page(PageNumber::new(number));
            }
        }

        log::debug!("unmapped {} pages at {}", region.pages(), region.start().start());
        Ok(())
    }

    /// Duplicates this address space, sharing every table and data page copy-on-write.
    ///
    /// Both directories lose write access to every table, so the first write through
    /// either of them copies or claims the table, then the page. The caller must keep
    /// this address space from faulting while it is forked.
    pub fn fork(&self, vmm: &VirtualMemoryManager) -> AddressSpace {
        let regions = self.regions.read().clone();
        let source = vmm.table(self.directory.frame());
        let directory = PageDirectory::new(vmm);
        let target = vmm.table(directory.frame());

        let mut writable = PageFlags::empty();
        writable.set_writable(true);
        let mut shared = 0;
        for index in 0..ENTRIES_PER_TABLE {
            let slot = source.clear_flags(index, writable);
            if !slot.is_present() {
                continue;
            }
            let mut flags = slot.flags();
            flags.set_writable(false);
            target.set(vmm.frames(), index, slot.with_flags(flags));
            shared += 1;
        }

        if self.is_active(vmm) {
            vmm.mmu().flush();
        }

        log::debug!(
            "forked directory {} into {} ({} regions, {} shared tables)",
            self.directory.frame(),
            directory.frame(),
            regions.len(),
            shared
        );
        AddressSpace {
            regions: RwLock::new(regions),
            directory,
        }
    }

    /// Releases every frame reference held by this address space.
    ///
    /// Tables still shared with another address space keep their contents; tables whose
    /// last reference is dropped release their tracked data pages.
    pub fn destroy(self, vmm: &VirtualMemoryManager) {
        debug_assert!(!self.is_active(vmm), "destroying the active address space");

        let regions = self.regions.into_inner();
        let directory = vmm.table(self.directory.frame());
        for (index, slot) in directory.present_entries() {
            if let Some(table) = slot.frame() {
                release_table(vmm, &regions, index, table);
            }
        }

        vmm.frames().release(self.directory.frame());
        log::debug!("destroyed directory {} ({} regions)", self.directory.frame(), regions.len());
    }

    /// Reads memory at `address` as code running at `privilege` would, faulting pages
    /// in as needed.
    pub fn read(
        &self,
        vmm: &VirtualMemoryManager,
        privilege: Privilege,
        address: VirtualAddress,
        buffer: &mut [u8],
    ) -> Result<(), FaultError> {
        let mut done = 0;
        self.check_span(address, buffer.len())?;
        while done < buffer.len() {
            let current = address + done;
            let chunk = (PAGE_SIZE - current.page_offset()).min(buffer.len() - done);
            let frame = self.resolve(vmm, current, Access::Read, privilege)?;
            vmm.read_frame(frame, current.page_offset(), &mut buffer[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Writes `bytes` at `address` as code running at `privilege` would, faulting pages
    /// in and copying shared pages as needed.
    pub fn write(
        &self,
        vmm: &VirtualMemoryManager,
        privilege: Privilege,
        address: VirtualAddress,
        bytes: &[u8],
    ) -> Result<(), FaultError> {
        let mut done = 0;
        self.check_span(address, bytes.len())?;
        while done < bytes.len() {
            let current = address + done;
            let chunk = (PAGE_SIZE - current.page_offset()).min(bytes.len() - done);
            let frame = self.resolve(vmm, current, Access::Write, privilege)?;
            vmm.write_frame(frame, current.page_offset(), &bytes[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    fn check_span(&self, address: VirtualAddress, length: usize) -> Result<(), FaultError> {
        if length == 0 {
            return Ok(());
        }
        match address.as_usize().checked_add(length - 1) {
            Some(last) if last / PAGE_SIZE < arch::TOTAL_PAGES => Ok(()),
            _ => Err(FaultError::OutOfRange),
        }
    }

    fn resolve(
        &self,
        vmm: &VirtualMemoryManager,
        address: VirtualAddress,
        access: Access,
        privilege: Privilege,
    ) -> Result<FrameNumber, FaultError> {
        let page = address.page_number();
        loop {
            if let Some(frame) = self.directory.translate(vmm, page, access, privilege) {
                return Ok(frame);
            }
            vmm.handle_page_fault(self, PageFault::new(address, access, privilege))?;
        }
    }
}
