//! Page table entries and tables.
//!
//! An entry is one 32-bit word: the frame-aligned physical address in the high bits and
//! the protection flags in the low bits. A table is one frame holding
//! [`ENTRIES_PER_TABLE`] entries, viewed in place through [`PageTable`].

use core::sync::atomic::{AtomicU32, Ordering};

use crate::{FrameNumber, FrameRefCounter, PhysicalAddress, address::AddressTranslator, arch};
use crate::arch::ENTRIES_PER_TABLE;

/// Protection and presence flags of a page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(u32);

impl PageFlags {
    /// Present bit (bit 0).
    const PRESENT: u32 = 1 << 0;

    /// Writable bit (bit 1).
    const WRITABLE: u32 = 1 << 1;

    /// User-accessible bit (bit 2).
    const USER: u32 = 1 << 2;

    /// All bits owned by flags.
    const MASK: u32 = Self::PRESENT | Self::WRITABLE | Self::USER;

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Flags for kernel mappings: present and writable, supervisor only.
    pub const fn kernel() -> Self {
        Self(Self::PRESENT | Self::WRITABLE)
    }

    /// Present, writable and user-accessible. Used for page directory slots so that
    /// the table entries alone decide the protection of a page.
    pub const fn all() -> Self {
        Self(Self::MASK)
    }

    /// Creates page flags from a raw value, ignoring bits that are not flags.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & Self::MASK)
    }

    /// Returns the raw value of these flags.
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// Flags set in both `self` and `other`. The effective protection of a page is the
    /// intersection of its directory slot and its table entry.
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Returns whether the present bit is set.
    pub const fn is_present(self) -> bool {
        (self.0 & Self::PRESENT) != 0
    }

    /// Sets or clears the present bit.
    pub fn set_present(&mut self, present: bool) {
        if present {
            self.0 |= Self::PRESENT;
        } else {
            self.0 &= !Self::PRESENT;
        }
    }

    /// Returns whether the writable bit is set.
    pub const fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        if writable {
            self.0 |= Self::WRITABLE;
        } else {
            self.0 &= !Self::WRITABLE;
        }
    }

    /// Returns whether the user-accessible bit is set.
    pub const fn is_user(self) -> bool {
        (self.0 & Self::USER) != 0
    }

    /// Sets or clears the user-accessible bit.
    pub fn set_user(&mut self, user: bool) {
        if user {
            self.0 |= Self::USER;
        } else {
            self.0 &= !Self::USER;
        }
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// A single page table or page directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    /// Physical address mask (everything above the page offset).
    const ADDRESS_MASK: u32 = !(arch::PAGE_SIZE as u32 - 1);

    /// The entry of an unmapped page.
    pub const EMPTY: Self = Self(0);

    /// Creates a present entry pointing at `frame`.
    pub fn new(frame: FrameNumber, flags: PageFlags) -> Self {
        let address = frame.start().as_usize();
        debug_assert!(
            address <= u32::MAX as usize,
            "frame {} does not fit in a page table entry",
            frame
        );
        let mut flags = flags;
        flags.set_present(true);
        Self((address as u32 & Self::ADDRESS_MASK) | flags.to_raw())
    }

    /// Returns the frame this entry points at, or `None` if the entry is not present.
    pub fn frame(self) -> Option<FrameNumber> {
        if self.is_present() {
            Some(PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize).frame_number())
        } else {
            None
        }
    }

    /// Returns the flags for this entry.
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0)
    }

    /// Returns a copy of this entry with its flags replaced, preserving the address.
    pub const fn with_flags(self, flags: PageFlags) -> Self {
        Self((self.0 & Self::ADDRESS_MASK) | flags.to_raw())
    }

    /// Returns whether this entry is present (valid).
    pub const fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Returns whether this entry allows writes.
    pub const fn is_writable(self) -> bool {
        self.flags().is_writable()
    }

    /// Returns the raw machine word of this entry.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Creates an entry from a raw machine word.
    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }
}

impl Default for PageEntry {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// A page table (or page directory) living in a physical frame.
///
/// Entries are accessed atomically because several cores may walk and update the same
/// table concurrently.
pub struct PageTable<'a> {
    frame: FrameNumber,
    entries: &'a [AtomicU32; ENTRIES_PER_TABLE],
}

impl<'a> PageTable<'a> {
    /// Views the frame `frame` as a page table.
    ///
    /// # Safety
    ///
    /// The frame must be reachable through `translator`, hold a page table, and stay
    /// allocated for as long as the view is used.
    pub unsafe fn from_frame(translator: &'a AddressTranslator, frame: FrameNumber) -> Self {
        let ptr = translator.frame_ptr::<[AtomicU32; ENTRIES_PER_TABLE]>(frame);
        // SAFETY: frames are page-aligned and a table fills exactly one frame.
        let entries = unsafe { &*ptr };
        Self { frame, entries }
    }

    /// Returns the frame holding this table.
    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    /// Reads the entry at `index`.
    ///
    /// # Panics
    /// Panics if `index` is not below [`ENTRIES_PER_TABLE`].
    pub fn load(&self, index: usize) -> PageEntry {
        PageEntry(self.entries[index].load(Ordering::Acquire))
    }

    /// Overwrites the entry at `index` without touching reference counts.
    ///
    /// Only valid where references are accounted for at a coarser granularity, such as
    /// identity mappings or bulk copies of untracked slots.
    pub fn store(&self, index: usize, entry: PageEntry) {
        self.entries[index].store(entry.0, Ordering::Release);
    }

    /// Installs `new` at `index` if the slot still holds `current`.
    pub fn compare_exchange(
        &self,
        index: usize,
        current: PageEntry,
        new: PageEntry,
    ) -> Result<PageEntry, PageEntry> {
        self.entries[index]
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(PageEntry)
            .map_err(PageEntry)
    }

    /// Clears `flags` on the entry at `index`, returning the previous entry.
    pub fn clear_flags(&self, index: usize, flags: PageFlags) -> PageEntry {
        PageEntry(self.entries[index].fetch_and(!flags.to_raw(), Ordering::AcqRel))
    }

    /// Overwrites the entry at `index`, moving frame ownership with it.
    ///
    /// The new target gains a reference before the old target loses one. When both
    /// entries are present and point at the same frame only the flags change.
    pub fn set(&self, frames: &FrameRefCounter, index: usize, entry: PageEntry) {
        let old = self.load(index);
        if old.is_present() && entry.is_present() && old.frame() == entry.frame() {
            self.store(index, entry);
            return;
        }

        if let Some(frame) = entry.frame() {
            frames.ref_frame(frame);
        }
        let old = PageEntry(self.entries[index].swap(entry.0, Ordering::AcqRel));
        if let Some(frame) = old.frame() {
            frames.release(frame);
        }
    }

    /// Iterates over the present entries of this table.
    pub fn present_entries(&self) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        (0..ENTRIES_PER_TABLE)
            .map(|index| (index, self.load(index)))
            .filter(|(_, entry)| entry.is_present())
    }
}
