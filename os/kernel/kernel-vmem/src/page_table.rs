//! # Per-Process Page Table
//!
//! A sparse map from [`PageNumber`] to [`PageEntry`]. Unlike a hardware radix
//! tree there are no intermediate levels: a missing key means *unmapped*, a
//! present key with neither `present` nor `swapped` set means *zero-fill on
//! demand*.
//!
//! ## Invariants & Notes
//!
//! - Structural updates ([`set`](PageTable::set), [`remove`](PageTable::remove))
//!   require `&mut self`, i.e. the memory manager's write lock.
//! - [`touch`](PageTable::touch) only ORs in `accessed`/`dirty` and is safe to
//!   call through a shared reference.
//! - After modifying a mapping the caller must invalidate the matching TLB
//!   entries before releasing the write lock.

use crate::page_entry::{AtomicPageEntry, PageEntry};
use std::collections::BTreeMap;
use core::ops::Range;
use kernel_memory_addresses::PageNumber;

#[derive(Debug, Default, Clone)]
pub struct PageTable {
    entries: BTreeMap<PageNumber, AtomicPageEntry>,
}

impl PageTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Snapshot of the entry for `page`.
    #[inline]
    #[must_use]
    pub fn get(&self, page: PageNumber) -> Option<PageEntry> {
        self.entries.get(&page).map(AtomicPageEntry::load)
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, page: PageNumber) -> bool {
        self.entries.contains_key(&page)
    }

    /// Install or replace the entry for `page`, returning the previous one.
    pub fn set(&mut self, page: PageNumber, entry: PageEntry) -> Option<PageEntry> {
        match self.entries.get(&page) {
            Some(slot) => {
                let old = slot.load();
                slot.store(entry);
                Some(old)
            }
            None => {
                self.entries.insert(page, AtomicPageEntry::new(entry));
                None
            }
        }
    }

    /// Apply `f` to an existing entry. Returns the new entry, or `None` if unmapped.
    pub fn update(
        &mut self,
        page: PageNumber,
        f: impl FnOnce(PageEntry) -> PageEntry,
    ) -> Option<PageEntry> {
        let slot = self.entries.get(&page)?;
        let new = f(slot.load());
        slot.store(new);
        Some(new)
    }

    pub fn remove(&mut self, page: PageNumber) -> Option<PageEntry> {
        self.entries.remove(&page).map(|e| e.load())
    }

    /// Record an access to `page`. Returns the entry as it was before.
    #[inline]
    pub fn touch(&self, page: PageNumber, write: bool) -> Option<PageEntry> {
        self.entries.get(&page).map(|e| e.touch(write))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries currently backed by a frame.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.entries.values().filter(|e| e.load().present()).count()
    }

    /// All entries in page order.
    pub fn iter(&self) -> impl Iterator<Item = (PageNumber, PageEntry)> + '_ {
        self.entries.iter().map(|(p, e)| (*p, e.load()))
    }

    /// Entries with page numbers in `pages`.
    pub fn range(&self, pages: Range<PageNumber>) -> impl Iterator<Item = (PageNumber, PageEntry)> + '_ {
        self.entries.range(pages).map(|(p, e)| (*p, e.load()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Permissions;
    use kernel_memory_addresses::FrameNumber;

    #[test]
    fn set_get_remove() {
        let mut pt = PageTable::new();
        let p = PageNumber::new(0x400);
        assert!(pt.get(p).is_none());
        assert!(pt.set(p, PageEntry::zero_fill(Permissions::RW)).is_none());
        assert!(pt.get(p).unwrap().is_zero_fill());

        let old = pt.set(p, PageEntry::resident(FrameNumber::new(2), Permissions::RW));
        assert!(old.unwrap().is_zero_fill());
        assert_eq!(pt.resident_count(), 1);

        assert!(pt.remove(p).is_some());
        assert!(pt.is_empty());
    }

    #[test]
    fn touch_through_shared_ref() {
        let mut pt = PageTable::new();
        let p = PageNumber::new(1);
        pt.set(p, PageEntry::resident(FrameNumber::new(0), Permissions::RW));
        let shared = &pt;
        shared.touch(p, true);
        let e = pt.get(p).unwrap();
        assert!(e.accessed());
        assert!(e.dirty());
        assert!(shared.touch(PageNumber::new(2), false).is_none());
    }

    #[test]
    fn range_is_ordered() {
        let mut pt = PageTable::new();
        for i in [5u64, 1, 3, 9] {
            pt.set(PageNumber::new(i), PageEntry::zero_fill(Permissions::READ));
        }
        let pages: Vec<_> = pt
            .range(PageNumber::new(1)..PageNumber::new(6))
            .map(|(p, _)| p.as_u64())
            .collect();
        assert_eq!(pages, vec![1, 3, 5]);
    }
}
