use crate::permissions::Permissions;
use crate::tlb::{Counters, Tlb, TlbEntry, TlbStats};
use kernel_info::Pid;
use kernel_memory_addresses::{FrameNumber, PageNumber};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Larger, hashed second-level TLB.
///
/// Keyed by `(pid, page)`. Each entry carries a logical timestamp; when full,
/// the entry with the smallest timestamp is evicted.
#[derive(Debug)]
pub struct L2Tlb {
    inner: Mutex<L2Inner>,
    counters: Counters,
}

#[derive(Debug)]
struct L2Inner {
    map: HashMap<(Pid, PageNumber), TlbEntry>,
    capacity: usize,
    clock: u64,
}

impl L2Inner {
    fn evict_oldest(&mut self) {
        let oldest = self
            .map
            .iter()
            .min_by_key(|(k, e)| (e.last_access, **k))
            .map(|(k, _)| *k);
        if let Some(k) = oldest {
            self.map.remove(&k);
        }
    }
}

impl L2Tlb {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(L2Inner {
                map: HashMap::with_capacity(capacity),
                capacity,
                clock: 0,
            }),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn contains(&self, pid: Pid, page: PageNumber) -> bool {
        self.inner.lock().map.contains_key(&(pid, page))
    }
}

impl Tlb for L2Tlb {
    fn lookup(&self, pid: Pid, page: PageNumber) -> Option<TlbEntry> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let now = inner.clock;
        let hit = inner.map.get_mut(&(pid, page)).filter(|e| e.valid).map(|e| {
            e.last_access = now;
            *e
        });
        self.counters.record(hit.is_some());
        hit
    }

    fn insert(&self, pid: Pid, page: PageNumber, frame: FrameNumber, permissions: Permissions) {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let mut e = TlbEntry::new(pid, page, frame, permissions);
        e.last_access = inner.clock;
        if !inner.map.contains_key(&(pid, page)) && inner.map.len() >= inner.capacity {
            inner.evict_oldest();
        }
        inner.map.insert((pid, page), e);
    }

    fn invalidate(&self, pid: Pid, page: PageNumber) -> bool {
        self.inner.lock().map.remove(&(pid, page)).is_some()
    }

    fn invalidate_all(&self, pid: Pid) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.map.len();
        inner.map.retain(|(p, _), _| *p != pid);
        before - inner.map.len()
    }

    fn flush(&self) {
        self.inner.lock().map.clear();
    }

    fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.capacity = capacity.max(1);
        while inner.map.len() > inner.capacity {
            inner.evict_oldest();
        }
    }

    fn stats(&self) -> TlbStats {
        let inner = self.inner.lock();
        self.counters.snapshot(inner.map.len(), inner.capacity)
    }

    fn reset_stats(&self) {
        self.counters.reset();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn evicts_least_recent_timestamp() {
        let tlb = L2Tlb::new(2);
        let pid = Pid::new(4);
        tlb.insert(pid, PageNumber::new(1), FrameNumber::new(1), Permissions::READ);
        tlb.insert(pid, PageNumber::new(2), FrameNumber::new(2), Permissions::READ);
        assert!(tlb.lookup(pid, PageNumber::new(1)).is_some());

        tlb.insert(pid, PageNumber::new(3), FrameNumber::new(3), Permissions::READ);
        assert!(tlb.contains(pid, PageNumber::new(1)));
        assert!(!tlb.contains(pid, PageNumber::new(2)));
        assert!(tlb.contains(pid, PageNumber::new(3)));
    }

    #[test]
    fn keyed_by_pid_and_page() {
        let tlb = L2Tlb::new(8);
        let page = PageNumber::new(0x400);
        tlb.insert(Pid::new(1), page, FrameNumber::new(1), Permissions::READ);
        tlb.insert(Pid::new(2), page, FrameNumber::new(2), Permissions::READ);
        assert_eq!(tlb.lookup(Pid::new(1), page).unwrap().frame, FrameNumber::new(1));
        assert_eq!(tlb.lookup(Pid::new(2), page).unwrap().frame, FrameNumber::new(2));
        assert_eq!(tlb.invalidate_all(Pid::new(1)), 1);
        assert!(tlb.lookup(Pid::new(1), page).is_none());
        let stats = tlb.stats();
        assert_eq!((stats.hits, stats.misses), (2, 1));
    }
}
