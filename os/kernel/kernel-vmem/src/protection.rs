//! # Access Control
//!
//! Region-level R/W/X rules per process, layered over the per-page bits, and
//! a bounded audit log of denied accesses.
//!
//! Regions are page aligned: a request for `[va, va + size)` covers every page
//! it touches. Installing a region over an existing one replaces the overlap,
//! splitting the old region where needed. An address with no covering region
//! is decided by the page bits alone.
//!
//! The audit log sits behind its own lock so violations can be recorded from
//! read-locked access paths.

use crate::permissions::{Access, Permissions};
use core::fmt;
use kernel_info::Pid;
use kernel_memory_addresses::{PageSize, VirtualAddress};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::time::SystemTime;

/// Which layer refused an access.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DenialReason {
    /// A protection region covering the address lacks the permission.
    Region,
    /// The page-table entry lacks the permission.
    Page,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Region => "region",
            Self::Page => "page",
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
#[error("{access} of {address} denied for {pid} by {reason} permissions")]
pub struct ProtectionError {
    pub pid: Pid,
    pub address: VirtualAddress,
    pub access: Access,
    pub reason: DenialReason,
}

/// A page-aligned address range with one set of permissions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProtectionRegion {
    pub start: VirtualAddress,
    /// Exclusive.
    pub end: VirtualAddress,
    pub permissions: Permissions,
}

impl ProtectionRegion {
    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.start.as_u64() && va.as_u64() < self.end.as_u64()
    }
}

/// One recorded denial.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Violation {
    pub pid: Pid,
    pub address: VirtualAddress,
    pub access: Access,
    pub reason: DenialReason,
    pub timestamp: SystemTime,
}

#[derive(Debug)]
struct ViolationLog {
    entries: VecDeque<Violation>,
    capacity: usize,
    total: u64,
}

/// Per-process protection regions plus the violation audit log.
#[derive(Debug)]
pub struct AccessControl {
    page_size: PageSize,
    regions: BTreeMap<Pid, BTreeMap<VirtualAddress, ProtectionRegion>>,
    log: Mutex<ViolationLog>,
}

impl AccessControl {
    #[must_use]
    pub fn new(page_size: PageSize, history: usize) -> Self {
        Self {
            page_size,
            regions: BTreeMap::new(),
            log: Mutex::new(ViolationLog {
                entries: VecDeque::with_capacity(history),
                capacity: history,
                total: 0,
            }),
        }
    }

    /// Page-rounded bounds of `[va, va + size)`.
    fn bounds(&self, va: VirtualAddress, size: u64) -> (VirtualAddress, VirtualAddress) {
        let start = va.align_down(self.page_size);
        let end = va
            .as_u64()
            .checked_add(size.max(1))
            .and_then(|e| self.page_size.align_up(e))
            .unwrap_or(self.page_size.align_down(u64::MAX));
        (start, VirtualAddress::new(end))
    }

    /// Cut `[start, end)` out of every region of `pid`, splitting as needed.
    fn carve(&mut self, pid: Pid, start: VirtualAddress, end: VirtualAddress) -> usize {
        let Some(map) = self.regions.get_mut(&pid) else {
            return 0;
        };
        let hit: Vec<ProtectionRegion> = map
            .values()
            .filter(|r| r.start < end && r.end > start)
            .copied()
            .collect();
        for r in &hit {
            map.remove(&r.start);
            if r.start < start {
                map.insert(r.start, ProtectionRegion { end: start, ..*r });
            }
            if r.end > end {
                map.insert(end, ProtectionRegion { start: end, ..*r });
            }
        }
        hit.len()
    }

    /// Apply `permissions` to the pages covering `[va, va + size)` of `pid`.
    pub fn set_access_control(&mut self, pid: Pid, va: VirtualAddress, size: u64, permissions: Permissions) -> ProtectionRegion {
        let (start, end) = self.bounds(va, size);
        self.carve(pid, start, end);
        let region = ProtectionRegion {
            start,
            end,
            permissions,
        };
        self.regions.entry(pid).or_default().insert(start, region);
        log::debug!("{pid}: protection {permissions} on {start}..{end}");
        region
    }

    /// Drop any rules for the pages covering `[va, va + size)`. Returns whether any were removed.
    pub fn remove_access_control(&mut self, pid: Pid, va: VirtualAddress, size: u64) -> bool {
        let (start, end) = self.bounds(va, size);
        let removed = self.carve(pid, start, end) > 0;
        if self.regions.get(&pid).is_some_and(BTreeMap::is_empty) {
            self.regions.remove(&pid);
        }
        removed
    }

    /// Change the permissions of an already covered range. Returns `false` if
    /// no region of `pid` intersects it.
    pub fn change_access_permission(&mut self, pid: Pid, va: VirtualAddress, size: u64, permissions: Permissions) -> bool {
        let (start, end) = self.bounds(va, size);
        let covered = self
            .regions
            .get(&pid)
            .is_some_and(|m| m.values().any(|r| r.start < end && r.end > start));
        if covered {
            self.set_access_control(pid, start, end.as_u64() - start.as_u64(), permissions);
        }
        covered
    }

    /// The region of `pid` covering `va`.
    #[must_use]
    pub fn region_for(&self, pid: Pid, va: VirtualAddress) -> Option<ProtectionRegion> {
        self.regions
            .get(&pid)?
            .range(..=va)
            .next_back()
            .map(|(_, r)| *r)
            .filter(|r| r.contains(va))
    }

    /// Regions of `pid` in address order.
    #[must_use]
    pub fn regions(&self, pid: Pid) -> Vec<ProtectionRegion> {
        self.regions
            .get(&pid)
            .map(|m| m.values().copied().collect())
            .unwrap_or_default()
    }

    /// Region-level check without recording anything.
    #[must_use]
    pub fn permits(&self, pid: Pid, va: VirtualAddress, access: Access) -> bool {
        self.region_for(pid, va)
            .is_none_or(|r| r.permissions.allows(access))
    }

    /// Region-level check for one access; a denial is recorded.
    ///
    /// # Errors
    /// [`ProtectionError`] with [`DenialReason::Region`] if a covering region
    /// lacks the permission.
    pub fn check_access(&self, pid: Pid, va: VirtualAddress, access: Access) -> Result<(), ProtectionError> {
        if self.permits(pid, va, access) {
            return Ok(());
        }
        let err = ProtectionError {
            pid,
            address: va,
            access,
            reason: DenialReason::Region,
        };
        self.record_violation(&err);
        Err(err)
    }

    /// Append a denial to the audit log, dropping the oldest entry when full.
    pub fn record_violation(&self, err: &ProtectionError) {
        log::warn!("protection violation: {err}");
        let mut log = self.log.lock();
        log.total += 1;
        if log.capacity == 0 {
            return;
        }
        if log.entries.len() >= log.capacity {
            log.entries.pop_front();
        }
        log.entries.push_back(Violation {
            pid: err.pid,
            address: err.address,
            access: err.access,
            reason: err.reason,
            timestamp: SystemTime::now(),
        });
    }

    /// Retained violations, oldest first.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.log.lock().entries.iter().copied().collect()
    }

    /// Violations ever recorded, including those no longer retained.
    #[must_use]
    pub fn violation_count(&self) -> u64 {
        self.log.lock().total
    }

    pub fn set_history(&self, entries: usize) {
        let mut log = self.log.lock();
        log.capacity = entries;
        while log.entries.len() > entries {
            log.entries.pop_front();
        }
    }

    /// Forget every rule and retained violation of `pid`.
    pub fn clear_process(&mut self, pid: Pid) {
        self.regions.remove(&pid);
        self.log.lock().entries.retain(|v| v.pid != pid);
    }

    /// Pids that have at least one rule.
    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.regions.keys().copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    #[test]
    fn ranges_are_page_aligned() {
        let mut ac = AccessControl::new(PageSize::SIZE_4K, 8);
        let r = ac.set_access_control(Pid::new(1), va(0x1010), 10, Permissions::READ);
        assert_eq!(r.start, va(0x1000));
        assert_eq!(r.end, va(0x2000));

        let r = ac.set_access_control(Pid::new(1), va(0x3ff0), 0x20, Permissions::READ);
        assert_eq!(r.start, va(0x3000));
        assert_eq!(r.end, va(0x5000));
    }

    #[test]
    fn check_records_denials() {
        let mut ac = AccessControl::new(PageSize::SIZE_4K, 2);
        ac.set_access_control(Pid::new(1), va(0x1000), 0x1000, Permissions::READ);
        assert!(ac.check_access(Pid::new(1), va(0x1800), Access::Read).is_ok());
        let err = ac.check_access(Pid::new(1), va(0x1800), Access::Write).unwrap_err();
        assert_eq!(err.reason, DenialReason::Region);
        // Uncovered addresses are left to the page bits.
        assert!(ac.check_access(Pid::new(1), va(0x9000), Access::Write).is_ok());
        assert!(ac.check_access(Pid::new(2), va(0x1800), Access::Write).is_ok());

        for _ in 0..3 {
            let _ = ac.check_access(Pid::new(1), va(0x1000), Access::Execute);
        }
        assert_eq!(ac.violation_count(), 4);
        let kept = ac.violations();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|v| v.access == Access::Execute));
    }

    #[test]
    fn overlapping_rules_split() {
        let mut ac = AccessControl::new(PageSize::SIZE_4K, 8);
        let pid = Pid::new(3);
        ac.set_access_control(pid, va(0x1000), 0x4000, Permissions::RW);
        ac.set_access_control(pid, va(0x2000), 0x1000, Permissions::READ);
        let regions = ac.regions(pid);
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[1].permissions, Permissions::READ);
        assert!(ac.permits(pid, va(0x1000), Access::Write));
        assert!(!ac.permits(pid, va(0x2fff), Access::Write));
        assert!(ac.permits(pid, va(0x3000), Access::Write));

        assert!(ac.remove_access_control(pid, va(0x2000), 1));
        assert!(ac.permits(pid, va(0x2000), Access::Write));
        assert_eq!(ac.regions(pid).len(), 2);
    }

    #[test]
    fn change_requires_existing_rule() {
        let mut ac = AccessControl::new(PageSize::SIZE_4K, 8);
        let pid = Pid::new(9);
        assert!(!ac.change_access_permission(pid, va(0x1000), 0x1000, Permissions::READ));
        ac.set_access_control(pid, va(0x1000), 0x2000, Permissions::RW);
        assert!(ac.change_access_permission(pid, va(0x1000), 0x1000, Permissions::READ));
        assert!(!ac.permits(pid, va(0x1000), Access::Write));
        assert!(ac.permits(pid, va(0x2000), Access::Write));
    }

    #[test]
    fn clearing_a_process_forgets_rules_and_history() {
        let mut ac = AccessControl::new(PageSize::SIZE_4K, 8);
        let pid = Pid::new(4);
        ac.set_access_control(pid, va(0x1000), 1, Permissions::empty());
        let _ = ac.check_access(pid, va(0x1000), Access::Read);
        ac.clear_process(pid);
        assert!(ac.regions(pid).is_empty());
        assert!(ac.violations().is_empty());
        assert!(ac.pids().next().is_none());
    }
}
