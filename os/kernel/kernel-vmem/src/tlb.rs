//! # Translation Lookaside Buffers
//!
//! Two independent caches of recent `(pid, page) → frame` translations,
//! consulted in order before the page table:
//!
//! ```text
//!  lookup ─► L1 (fully associative, move-to-front LRU)
//!              │ miss
//!              ▼
//!            L2 (hashed by (pid, page), LRU by timestamp) ──hit──► promote into L1
//!              │ miss
//!              ▼
//!            page table ──► insert into both levels
//! ```
//!
//! Each level has its own lock and its own hit/miss counters, so translations
//! never contend on the memory manager's state lock just to consult a TLB.
//!
//! ## Consistency
//!
//! A TLB entry caches a page's frame *and* permissions. Any change to either
//! (remap, copy-on-write, eviction, unmap, permission change) must call
//! [`TwoLevelTlb::invalidate`] before the write lock guarding the change is
//! released.

mod l1;
mod l2;

pub use crate::tlb::l1::L1Tlb;
pub use crate::tlb::l2::L2Tlb;
use crate::permissions::Permissions;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::Pid;
use kernel_memory_addresses::{FrameNumber, PageNumber};

/// A cached translation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TlbEntry {
    pub pid: Pid,
    pub page: PageNumber,
    pub frame: FrameNumber,
    pub permissions: Permissions,
    /// Logical time of the last hit or insert.
    pub last_access: u64,
    pub valid: bool,
}

impl TlbEntry {
    #[must_use]
    pub const fn new(pid: Pid, page: PageNumber, frame: FrameNumber, permissions: Permissions) -> Self {
        Self {
            pid,
            page,
            frame,
            permissions,
            last_access: 0,
            valid: true,
        }
    }

    #[inline]
    #[must_use]
    pub fn matches(&self, pid: Pid, page: PageNumber) -> bool {
        self.valid && self.pid == pid && self.page == page
    }
}

/// Which level served a lookup.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TlbLevel {
    L1,
    L2,
}

/// Hit/miss counters of one TLB level.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TlbStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
}

impl TlbStats {
    /// Hits over lookups, `0.0` before the first lookup.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Behaviour shared by both TLB levels.
pub trait Tlb: Send + Sync {
    fn lookup(&self, pid: Pid, page: PageNumber) -> Option<TlbEntry>;

    /// Insert or update the translation for `(pid, page)`.
    fn insert(&self, pid: Pid, page: PageNumber, frame: FrameNumber, permissions: Permissions);

    /// Drop the translation for `(pid, page)`. Returns whether one was cached.
    fn invalidate(&self, pid: Pid, page: PageNumber) -> bool;

    /// Drop every translation of `pid`. Returns how many were cached.
    fn invalidate_all(&self, pid: Pid) -> usize;

    fn flush(&self);

    fn set_capacity(&self, capacity: usize);

    fn stats(&self) -> TlbStats;

    fn reset_stats(&self);
}

/// Hit and miss counters updated without the level's lock.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    #[inline]
    pub(crate) fn record(&self, hit: bool) {
        let c = if hit { &self.hits } else { &self.misses };
        c.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, entries: usize, capacity: usize) -> TlbStats {
        TlbStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
            capacity,
        }
    }

    pub(crate) fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// L1 and L2 composed into the lookup order the translator uses.
#[derive(Debug)]
pub struct TwoLevelTlb {
    l1: L1Tlb,
    l2: L2Tlb,
}

impl TwoLevelTlb {
    #[must_use]
    pub fn new(l1_capacity: usize, l2_capacity: usize) -> Self {
        Self {
            l1: L1Tlb::new(l1_capacity),
            l2: L2Tlb::new(l2_capacity),
        }
    }

    /// Look up `(pid, page)` in L1, then L2. An L2 hit is promoted into L1.
    pub fn lookup(&self, pid: Pid, page: PageNumber) -> Option<(TlbEntry, TlbLevel)> {
        if let Some(e) = self.l1.lookup(pid, page) {
            log::trace!("TLB L1 hit {pid} {page}");
            return Some((e, TlbLevel::L1));
        }
        let e = self.l2.lookup(pid, page)?;
        log::trace!("TLB L2 hit {pid} {page}, promoting");
        self.l1.insert(pid, page, e.frame, e.permissions);
        Some((e, TlbLevel::L2))
    }

    /// Insert into both levels.
    pub fn insert(&self, pid: Pid, page: PageNumber, frame: FrameNumber, permissions: Permissions) {
        self.l1.insert(pid, page, frame, permissions);
        self.l2.insert(pid, page, frame, permissions);
    }

    /// Drop `(pid, page)` from both levels.
    pub fn invalidate(&self, pid: Pid, page: PageNumber) {
        let a = self.l1.invalidate(pid, page);
        let b = self.l2.invalidate(pid, page);
        if a || b {
            log::trace!("TLB invalidate {pid} {page}");
        }
    }

    /// Drop every entry of `pid` from both levels.
    pub fn invalidate_all(&self, pid: Pid) -> usize {
        self.l1.invalidate_all(pid) + self.l2.invalidate_all(pid)
    }

    pub fn flush(&self) {
        self.l1.flush();
        self.l2.flush();
    }

    pub fn set_capacity(&self, l1: usize, l2: usize) {
        self.l1.set_capacity(l1);
        self.l2.set_capacity(l2);
    }

    #[must_use]
    pub const fn l1(&self) -> &L1Tlb {
        &self.l1
    }

    #[must_use]
    pub const fn l2(&self) -> &L2Tlb {
        &self.l2
    }

    /// `(L1, L2)` counters.
    #[must_use]
    pub fn stats(&self) -> (TlbStats, TlbStats) {
        (self.l1.stats(), self.l2.stats())
    }

    pub fn reset_stats(&self) {
        self.l1.reset_stats();
        self.l2.reset_stats();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pid(n: u32) -> Pid {
        Pid::new(n)
    }

    #[test]
    fn miss_then_insert_then_l1_hit() {
        let tlb = TwoLevelTlb::new(2, 8);
        let p = PageNumber::new(0x400);
        assert!(tlb.lookup(pid(1), p).is_none());
        tlb.insert(pid(1), p, FrameNumber::new(3), Permissions::RW);
        let (e, level) = tlb.lookup(pid(1), p).unwrap();
        assert_eq!(level, TlbLevel::L1);
        assert_eq!(e.frame, FrameNumber::new(3));
    }

    #[test]
    fn l2_hit_promotes_into_l1() {
        let tlb = TwoLevelTlb::new(1, 8);
        let a = PageNumber::new(1);
        let b = PageNumber::new(2);
        tlb.insert(pid(1), a, FrameNumber::new(10), Permissions::READ);
        tlb.insert(pid(1), b, FrameNumber::new(11), Permissions::READ);

        // `a` fell out of the single-entry L1 but is still in L2.
        let (_, level) = tlb.lookup(pid(1), a).unwrap();
        assert_eq!(level, TlbLevel::L2);
        let (_, level) = tlb.lookup(pid(1), a).unwrap();
        assert_eq!(level, TlbLevel::L1);
    }

    #[test]
    fn invalidate_clears_both_levels() {
        let tlb = TwoLevelTlb::new(4, 8);
        let p = PageNumber::new(7);
        tlb.insert(pid(2), p, FrameNumber::new(1), Permissions::RW);
        tlb.insert(pid(3), p, FrameNumber::new(2), Permissions::RW);
        tlb.invalidate(pid(2), p);
        assert!(tlb.lookup(pid(2), p).is_none());
        assert!(tlb.lookup(pid(3), p).is_some());

        assert_eq!(tlb.invalidate_all(pid(3)), 2);
        assert!(tlb.lookup(pid(3), p).is_none());
    }

    #[test]
    fn stats_are_per_level() {
        let tlb = TwoLevelTlb::new(4, 8);
        let p = PageNumber::new(1);
        let _ = tlb.lookup(pid(1), p);
        tlb.insert(pid(1), p, FrameNumber::new(0), Permissions::READ);
        let _ = tlb.lookup(pid(1), p);
        let (l1, l2) = tlb.stats();
        assert_eq!((l1.hits, l1.misses), (1, 1));
        assert_eq!((l2.hits, l2.misses), (0, 1));
        assert!((l1.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
