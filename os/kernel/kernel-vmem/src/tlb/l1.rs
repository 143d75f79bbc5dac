use crate::permissions::Permissions;
use crate::tlb::{Counters, Tlb, TlbEntry, TlbStats};
use kernel_info::Pid;
use kernel_memory_addresses::{FrameNumber, PageNumber};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Small, fully associative first-level TLB.
///
/// Entries are kept in recency order: a hit moves the entry to the front, and
/// an insert into a full buffer drops the tail. Lookups are linear, which is
/// the point of keeping L1 small.
#[derive(Debug)]
pub struct L1Tlb {
    inner: Mutex<L1Inner>,
    counters: Counters,
}

#[derive(Debug)]
struct L1Inner {
    entries: VecDeque<TlbEntry>,
    capacity: usize,
    clock: u64,
}

impl L1Tlb {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(L1Inner {
                entries: VecDeque::with_capacity(capacity),
                capacity,
                clock: 0,
            }),
            counters: Counters::default(),
        }
    }

    /// Cached translations, most recently used first.
    #[must_use]
    pub fn entries(&self) -> Vec<TlbEntry> {
        self.inner.lock().entries.iter().copied().collect()
    }
}

impl Tlb for L1Tlb {
    fn lookup(&self, pid: Pid, page: PageNumber) -> Option<TlbEntry> {
        let mut inner = self.inner.lock();
        let pos = inner.entries.iter().position(|e| e.matches(pid, page));
        self.counters.record(pos.is_some());
        let pos = pos?;
        inner.clock += 1;
        let now = inner.clock;
        let mut e = inner.entries.remove(pos)?;
        e.last_access = now;
        inner.entries.push_front(e);
        Some(e)
    }

    fn insert(&self, pid: Pid, page: PageNumber, frame: FrameNumber, permissions: Permissions) {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let mut e = TlbEntry::new(pid, page, frame, permissions);
        e.last_access = inner.clock;
        if let Some(pos) = inner.entries.iter().position(|x| x.matches(pid, page)) {
            inner.entries.remove(pos);
        } else if inner.entries.len() >= inner.capacity {
            inner.entries.pop_back();
        }
        inner.entries.push_front(e);
    }

    fn invalidate(&self, pid: Pid, page: PageNumber) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|e| !e.matches(pid, page));
        inner.entries.len() != before
    }

    fn invalidate_all(&self, pid: Pid) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.pid != pid);
        before - inner.entries.len()
    }

    fn flush(&self) {
        self.inner.lock().entries.clear();
    }

    fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.capacity = capacity.max(1);
        let cap = inner.capacity;
        inner.entries.truncate(cap);
    }

    fn stats(&self) -> TlbStats {
        let inner = self.inner.lock();
        self.counters.snapshot(inner.entries.len(), inner.capacity)
    }

    fn reset_stats(&self) {
        self.counters.reset();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hit_moves_to_front_and_tail_is_evicted() {
        let tlb = L1Tlb::new(2);
        let pid = Pid::new(1);
        tlb.insert(pid, PageNumber::new(1), FrameNumber::new(1), Permissions::READ);
        tlb.insert(pid, PageNumber::new(2), FrameNumber::new(2), Permissions::READ);

        // Touch page 1 so page 2 becomes least recently used.
        assert!(tlb.lookup(pid, PageNumber::new(1)).is_some());
        tlb.insert(pid, PageNumber::new(3), FrameNumber::new(3), Permissions::READ);

        let pages: Vec<_> = tlb.entries().iter().map(|e| e.page.as_u64()).collect();
        assert_eq!(pages, vec![3, 1]);
        assert!(tlb.lookup(pid, PageNumber::new(2)).is_none());
    }

    #[test]
    fn reinsert_updates_in_place() {
        let tlb = L1Tlb::new(4);
        let pid = Pid::new(1);
        tlb.insert(pid, PageNumber::new(1), FrameNumber::new(1), Permissions::READ);
        tlb.insert(pid, PageNumber::new(1), FrameNumber::new(9), Permissions::RW);
        assert_eq!(tlb.entries().len(), 1);
        let e = tlb.lookup(pid, PageNumber::new(1)).unwrap();
        assert_eq!(e.frame, FrameNumber::new(9));
        assert_eq!(e.permissions, Permissions::RW);
    }

    #[test]
    fn shrinking_capacity_drops_lru_entries() {
        let tlb = L1Tlb::new(4);
        let pid = Pid::new(1);
        for i in 0..4 {
            tlb.insert(pid, PageNumber::new(i), FrameNumber::new(i), Permissions::READ);
        }
        tlb.set_capacity(2);
        let pages: Vec<_> = tlb.entries().iter().map(|e| e.page.as_u64()).collect();
        assert_eq!(pages, vec![3, 2]);
        assert_eq!(tlb.stats().capacity, 2);
    }
}
