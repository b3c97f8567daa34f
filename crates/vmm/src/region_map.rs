//! The ordered set of regions mapped in one address space.

use alloc::collections::BTreeMap;
use core::fmt;

use crate::{PageNumber, VirtualRegion};

/// Errors returned by mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The address or file offset is not page-aligned.
    Misaligned,
    /// The mapping would contain no pages.
    ZeroLength,
    /// The requested range lies outside the permitted half of the address space.
    OutOfRange,
    /// The requested range overlaps an existing region.
    Overlap,
    /// No free range is large enough.
    NoSpace,
    /// No region contains the address.
    NotMapped,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misaligned => f.write_str("address or offset is not page-aligned"),
            Self::ZeroLength => f.write_str("mapping length is zero"),
            Self::OutOfRange => f.write_str("mapping lies outside the permitted range"),
            Self::Overlap => f.write_str("mapping overlaps an existing region"),
            Self::NoSpace => f.write_str("no free range is large enough"),
            Self::NotMapped => f.write_str("address is not mapped"),
        }
    }
}

/// Non-overlapping regions keyed by their first page.
#[derive(Debug, Default, Clone)]
pub struct RegionMap {
    regions: BTreeMap<PageNumber, VirtualRegion>,
}

impl RegionMap {
    /// Creates an empty map.
    pub const fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    /// Adds `region`, failing if it overlaps any existing region.
    pub fn insert(&mut self, region: VirtualRegion) -> Result<(), MapError> {
        if self.range(region.start(), region.end()).next().is_some() {
            return Err(MapError::Overlap);
        }
        self.regions.insert(region.start(), region);
        Ok(())
    }

    /// Removes and returns the region containing `page`.
    pub fn remove(&mut self, page: PageNumber) -> Option<VirtualRegion> {
        let start = self.find(page)?.start();
        self.regions.remove(&start)
    }

    /// Returns the region containing `page`.
    pub fn find(&self, page: PageNumber) -> Option<&VirtualRegion> {
        self.regions
            .range(..=page)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(page))
    }

    /// Regions overlapping `[lo, hi)`, in ascending order.
    pub fn range(&self, lo: PageNumber, hi: PageNumber) -> impl Iterator<Item = &VirtualRegion> {
        let first = self.find(lo).map_or(lo, VirtualRegion::start);
        self.regions.range(first..hi.max(first)).map(|(_, region)| region)
    }

    /// Lowest page of the first gap of at least `pages` pages within `[lo, hi)`.
    pub fn first_fit(&self, lo: PageNumber, hi: PageNumber, pages: usize) -> Option<PageNumber> {
        if pages == 0 || hi < lo {
            return None;
        }

        let mut cursor = lo;
        for region in self.range(lo, hi) {
            if region.start() >= cursor && region.start() - cursor >= pages {
                return Some(cursor);
            }
            cursor = cursor.max(region.end());
        }

        (hi >= cursor && hi - cursor >= pages).then_some(cursor)
    }

    /// All regions in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &VirtualRegion> {
        self.regions.values()
    }

    /// Number of mapped regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns whether no region is mapped.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Backing, MapFlags};
    use alloc::vec::Vec;
    use proptest::prelude::*;

    fn region(start: usize, pages: usize) -> VirtualRegion {
        VirtualRegion::new(PageNumber::new(start), pages, MapFlags::REAL, Backing::Anonymous)
    }

    fn starts<'a>(regions: impl Iterator<Item = &'a VirtualRegion>) -> Vec<usize> {
        regions.map(|r| r.start().as_usize()).collect()
    }

    #[test]
    fn insert_rejects_overlap() {
        let mut map = RegionMap::new();
        map.insert(region(10, 10)).unwrap();

        assert_eq!(map.insert(region(5, 6)), Err(MapError::Overlap));
        assert_eq!(map.insert(region(19, 2)), Err(MapError::Overlap));
        assert_eq!(map.insert(region(12, 2)), Err(MapError::Overlap));
        assert_eq!(map.insert(region(0, 30)), Err(MapError::Overlap));
        assert_eq!(map.insert(region(5, 5)), Ok(()));
        assert_eq!(map.insert(region(20, 5)), Ok(()));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn find_and_remove() {
        let mut map = RegionMap::new();
        map.insert(region(10, 10)).unwrap();
        map.insert(region(30, 2)).unwrap();

        assert_eq!(map.find(PageNumber::new(15)).map(VirtualRegion::start), Some(PageNumber::new(10)));
        assert!(map.find(PageNumber::new(20)).is_none());
        assert!(map.find(PageNumber::new(9)).is_none());

        let removed = map.remove(PageNumber::new(31)).unwrap();
        assert_eq!(removed.start(), PageNumber::new(30));
        assert!(map.remove(PageNumber::new(31)).is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn range_includes_region_straddling_low_bound() {
        let mut map = RegionMap::new();
        map.insert(region(10, 10)).unwrap();
        map.insert(region(25, 5)).unwrap();
        map.insert(region(40, 5)).unwrap();

        assert_eq!(starts(map.range(PageNumber::new(15), PageNumber::new(30))), [10, 25]);
        assert_eq!(starts(map.range(PageNumber::new(20), PageNumber::new(25))), Vec::<usize>::new());
        assert_eq!(starts(map.range(PageNumber::new(0), PageNumber::new(100))), [10, 25, 40]);
    }

    mod first_fit {
        use super::*;

        #[test]
        fn empty_map_returns_low_bound() {
            let map = RegionMap::new();
            assert_eq!(map.first_fit(PageNumber::new(4), PageNumber::new(9), 5), Some(PageNumber::new(4)));
            assert_eq!(map.first_fit(PageNumber::new(4), PageNumber::new(8), 5), None);
        }

        #[test]
        fn gap_before_first_region() {
            let mut map = RegionMap::new();
            map.insert(region(20, 10)).unwrap();
            assert_eq!(map.first_fit(PageNumber::new(0), PageNumber::new(100), 5), Some(PageNumber::new(0)));
        }

        #[test]
        fn gap_after_region_when_front_too_small() {
            let mut map = RegionMap::new();
            map.insert(region(3, 10)).unwrap();
            assert_eq!(map.first_fit(PageNumber::new(0), PageNumber::new(100), 5), Some(PageNumber::new(13)));
        }

        #[test]
        fn gap_between_regions() {
            let mut map = RegionMap::new();
            map.insert(region(0, 10)).unwrap();
            map.insert(region(12, 4)).unwrap();
            map.insert(region(22, 4)).unwrap();
            assert_eq!(map.first_fit(PageNumber::new(0), PageNumber::new(100), 6), Some(PageNumber::new(16)));
            assert_eq!(map.first_fit(PageNumber::new(0), PageNumber::new(100), 2), Some(PageNumber::new(10)));
        }

        #[test]
        fn trailing_gap_exactly_large_enough() {
            let mut map = RegionMap::new();
            map.insert(region(0, 10)).unwrap();
            assert_eq!(map.first_fit(PageNumber::new(0), PageNumber::new(15), 5), Some(PageNumber::new(10)));
            assert_eq!(map.first_fit(PageNumber::new(0), PageNumber::new(14), 5), None);
        }

        #[test]
        fn region_straddling_low_bound() {
            let mut map = RegionMap::new();
            map.insert(region(0, 10)).unwrap();
            assert_eq!(map.first_fit(PageNumber::new(5), PageNumber::new(20), 3), Some(PageNumber::new(10)));
        }

        #[test]
        fn zero_pages_never_fit() {
            let map = RegionMap::new();
            assert_eq!(map.first_fit(PageNumber::new(0), PageNumber::new(10), 0), None);
        }
    }

    proptest! {
        #[test]
        fn regions_never_overlap(requests in proptest::collection::vec((0usize..200, 1usize..20), 1..40)) {
            let mut map = RegionMap::new();
            for (start, pages) in requests {
                let candidate = region(start, pages);
                let clashes = map.iter().any(|r| candidate.start() < r.end() && r.start() < candidate.end());
                let result = map.insert(candidate);
                prop_assert_eq!(result.is_err(), clashes);
            }

            let regions: Vec<_> = map.iter().collect();
            for pair in regions.windows(2) {
                prop_assert!(pair[0].end() <= pair[1].start());
            }
        }

        #[test]
        fn first_fit_lands_in_free_space(
            requests in proptest::collection::vec((0usize..200, 1usize..20), 0..20),
            pages in 1usize..30,
        ) {
            let mut map = RegionMap::new();
            for (start, count) in requests {
                let _ = map.insert(region(start, count));
            }

            if let Some(start) = map.first_fit(PageNumber::new(0), PageNumber::new(256), pages) {
                prop_assert!(start.as_usize() + pages <= 256);
                prop_assert!(map.insert(region(start.as_usize(), pages)).is_ok());
            }
        }
    }
}
