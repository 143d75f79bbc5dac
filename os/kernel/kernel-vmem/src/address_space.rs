//! # Address Space
//!
//! One [`AddressSpace`] per process: its [`PageTable`] plus the list of
//! virtual [`Region`]s handed out by allocation and mapping calls.
//!
//! ## Highlights
//!
//! - [`AddressSpace::reserve`] finds the lowest free, page-aligned virtual
//!   range of the requested size at or above the user space base.
//! - [`AddressSpace::insert_region`] installs a region at a fixed address
//!   (used when reloading a memory dump).
//! - [`AddressSpace::remove_region`] detaches a region and its page-table
//!   entries; the caller releases the frames and swap slots they referenced.
//!
//! ## Layout
//!
//! ```text
//! base                                                      end
//!  │ region A │ hole │ region B │          free ...           │
//!  └──────────┴──────┴──────────┴─────────────────────────────┘
//! ```

use crate::page_entry::PageEntry;
use crate::page_table::PageTable;
use crate::permissions::Permissions;
use kernel_info::Pid;
use kernel_memory_addresses::{PageNumber, PageSize, VirtualAddress};
use std::collections::BTreeMap;

/// How a region's pages came to be.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// Anonymous memory from an allocation call.
    Anonymous,
    /// A private mapping, optionally pre-filled by the caller.
    Private,
    /// Pages mapped onto frames owned by another region.
    Shared {
        owner: Pid,
        owner_start: VirtualAddress,
        copy_on_write: bool,
    },
}

/// A contiguous, page-aligned virtual range owned by one process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Region {
    pub start: VirtualAddress,
    /// Requested size in bytes; the region covers `pages` whole pages.
    pub size: u64,
    pub pages: u64,
    pub permissions: Permissions,
    pub kind: RegionKind,
}

impl Region {
    #[inline]
    #[must_use]
    pub const fn first_page(&self, ps: PageSize) -> PageNumber {
        self.start.page(ps)
    }

    /// One past the last page.
    #[inline]
    #[must_use]
    pub const fn end_page(&self, ps: PageSize) -> PageNumber {
        PageNumber::new(self.start.page(ps).as_u64() + self.pages)
    }

    /// End address (exclusive) of the page-rounded region.
    #[inline]
    #[must_use]
    pub const fn end(&self, ps: PageSize) -> VirtualAddress {
        self.end_page(ps).base(ps)
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress, ps: PageSize) -> bool {
        va.as_u64() >= self.start.as_u64() && va.as_u64() < self.end(ps).as_u64()
    }

    /// Page numbers covered by this region.
    pub fn page_numbers(&self, ps: PageSize) -> impl Iterator<Item = PageNumber> + use<> {
        let first = self.first_page(ps).as_u64();
        (first..first + self.pages).map(PageNumber::new)
    }

    /// Whether this region's pages count against the commit limit.
    #[inline]
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        !matches!(self.kind, RegionKind::Shared { .. })
    }
}

/// Errors raised while placing regions.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AddressSpaceError {
    #[error("no free virtual range of {pages} pages")]
    Exhausted { pages: u64 },
    #[error("region at {start} overlaps an existing region")]
    Overlap { start: VirtualAddress },
    #[error("address {0} is not page aligned or outside user space")]
    BadAddress(VirtualAddress),
}

/// Handle to a single process's virtual memory.
#[derive(Debug)]
pub struct AddressSpace {
    pid: Pid,
    page_size: PageSize,
    base: u64,
    end: u64,
    regions: BTreeMap<VirtualAddress, Region>,
    page_table: PageTable,
}

impl AddressSpace {
    #[must_use]
    pub const fn new(pid: Pid, page_size: PageSize, base: u64, end: u64) -> Self {
        Self {
            pid,
            page_size,
            base,
            end,
            regions: BTreeMap::new(),
            page_table: PageTable::new(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> PageSize {
        self.page_size
    }

    #[inline]
    #[must_use]
    pub const fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    #[inline]
    pub const fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    /// Lowest free virtual range of `pages` pages.
    ///
    /// # Errors
    /// [`AddressSpaceError::Exhausted`] if no hole is large enough.
    pub fn reserve(&self, pages: u64) -> Result<VirtualAddress, AddressSpaceError> {
        let bytes = pages
            .checked_mul(self.page_size.bytes())
            .ok_or(AddressSpaceError::Exhausted { pages })?;
        let mut cursor = self.base;
        for region in self.regions.values() {
            if region.start.as_u64().saturating_sub(cursor) >= bytes {
                return Ok(VirtualAddress::new(cursor));
            }
            cursor = cursor.max(region.end(self.page_size).as_u64());
        }
        match cursor.checked_add(bytes) {
            Some(end) if end <= self.end => Ok(VirtualAddress::new(cursor)),
            _ => Err(AddressSpaceError::Exhausted { pages }),
        }
    }

    /// Insert `region` and a zero-fill entry for each of its pages.
    ///
    /// # Errors
    /// The region is misaligned, leaves user space, or overlaps another region.
    pub fn insert_region(&mut self, region: Region) -> Result<(), AddressSpaceError> {
        let ps = self.page_size;
        let end = region.end(ps).as_u64();
        if !ps.is_aligned(region.start.as_u64())
            || region.start.as_u64() < self.base
            || end > self.end
            || end <= region.start.as_u64()
        {
            return Err(AddressSpaceError::BadAddress(region.start));
        }
        let before = self.regions.range(..region.start).next_back();
        let after = self.regions.range(region.start..).next();
        let overlaps_before = before.is_some_and(|(_, r)| r.end(ps).as_u64() > region.start.as_u64());
        let overlaps_after = after.is_some_and(|(s, _)| s.as_u64() < end);
        if overlaps_before || overlaps_after {
            return Err(AddressSpaceError::Overlap {
                start: region.start,
            });
        }
        for page in region.page_numbers(ps) {
            self.page_table
                .set(page, PageEntry::zero_fill(region.permissions));
        }
        self.regions.insert(region.start, region);
        Ok(())
    }

    /// Detach the region starting at `start` along with its page-table entries.
    pub fn remove_region(&mut self, start: VirtualAddress) -> Option<(Region, Vec<(PageNumber, PageEntry)>)> {
        let region = self.regions.remove(&start)?;
        let entries = region
            .page_numbers(self.page_size)
            .filter_map(|p| self.page_table.remove(p).map(|e| (p, e)))
            .collect();
        Some((region, entries))
    }

    #[must_use]
    pub fn region(&self, start: VirtualAddress) -> Option<&Region> {
        self.regions.get(&start)
    }

    pub fn region_mut(&mut self, start: VirtualAddress) -> Option<&mut Region> {
        self.regions.get_mut(&start)
    }

    /// The region covering `va`, if any.
    #[must_use]
    pub fn region_containing(&self, va: VirtualAddress) -> Option<&Region> {
        self.regions
            .range(..=va)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(va, self.page_size))
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Pages that count against the commit limit.
    #[must_use]
    pub fn committed_pages(&self) -> u64 {
        self.regions
            .values()
            .filter(|r| r.is_committed())
            .map(|r| r.pages)
            .sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BASE: u64 = 0x0040_0000;

    fn space() -> AddressSpace {
        AddressSpace::new(Pid::new(1), PageSize::SIZE_4K, BASE, BASE + 64 * 4096)
    }

    fn region(start: u64, pages: u64) -> Region {
        Region {
            start: VirtualAddress::new(start),
            size: pages * 4096,
            pages,
            permissions: Permissions::RW,
            kind: RegionKind::Anonymous,
        }
    }

    #[test]
    fn reserve_finds_lowest_hole() {
        let mut s = space();
        assert_eq!(s.reserve(2).unwrap().as_u64(), BASE);
        s.insert_region(region(BASE, 2)).unwrap();
        s.insert_region(region(BASE + 4 * 4096, 1)).unwrap();
        assert_eq!(s.reserve(2).unwrap().as_u64(), BASE + 2 * 4096);
        assert_eq!(s.reserve(3).unwrap().as_u64(), BASE + 5 * 4096);
        assert!(s.reserve(100).is_err());
    }

    #[test]
    fn insert_rejects_overlap_and_misalignment() {
        let mut s = space();
        s.insert_region(region(BASE + 4096, 2)).unwrap();
        assert!(matches!(
            s.insert_region(region(BASE, 2)),
            Err(AddressSpaceError::Overlap { .. })
        ));
        assert!(matches!(
            s.insert_region(region(BASE + 2 * 4096, 1)),
            Err(AddressSpaceError::Overlap { .. })
        ));
        assert!(matches!(
            s.insert_region(region(BASE + 3 * 4096 + 1, 1)),
            Err(AddressSpaceError::BadAddress(_))
        ));
        s.insert_region(region(BASE + 3 * 4096, 1)).unwrap();
    }

    #[test]
    fn region_lookup_and_removal() {
        let mut s = space();
        s.insert_region(region(BASE, 3)).unwrap();
        assert_eq!(s.page_table().len(), 3);
        let inside = VirtualAddress::new(BASE + 2 * 4096 + 17);
        assert_eq!(s.region_containing(inside).unwrap().start.as_u64(), BASE);
        assert!(s.region_containing(VirtualAddress::new(BASE + 3 * 4096)).is_none());

        let (r, entries) = s.remove_region(VirtualAddress::new(BASE)).unwrap();
        assert_eq!(r.pages, 3);
        assert_eq!(entries.len(), 3);
        assert!(s.page_table().is_empty());
        assert_eq!(s.committed_pages(), 0);
    }
}
