//! Counters updated by the memory manager.
//!
//! Global counters are atomics so the read-locked access path can bump them.
//! Per-process counters live behind their own mutex and are dropped when the
//! process is torn down.

use crate::cache::CacheStats;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::Pid;
use kernel_vmem::TlbStats;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Counters kept for one process.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ProcessStats {
    pub allocations: u64,
    pub frees: u64,
    pub bytes_allocated: u64,
    pub accesses: u64,
    pub minor_faults: u64,
    pub major_faults: u64,
    pub cow_copies: u64,
    pub violations: u64,
}

impl ProcessStats {
    #[must_use]
    pub const fn faults(&self) -> u64 {
        self.minor_faults + self.major_faults
    }
}

/// Named global counter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Counter {
    Allocations,
    Frees,
    Accesses,
    MinorFaults,
    MajorFaults,
    CowCopies,
    Evictions,
    SwapIns,
    SwapOuts,
    Violations,
    Reclaims,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryStats {
    allocations: AtomicU64,
    frees: AtomicU64,
    accesses: AtomicU64,
    minor_faults: AtomicU64,
    major_faults: AtomicU64,
    cow_copies: AtomicU64,
    evictions: AtomicU64,
    swap_ins: AtomicU64,
    swap_outs: AtomicU64,
    violations: AtomicU64,
    reclaims: AtomicU64,
    processes: Mutex<HashMap<Pid, ProcessStats>>,
}

impl MemoryStats {
    const fn counter(&self, c: Counter) -> &AtomicU64 {
        match c {
            Counter::Allocations => &self.allocations,
            Counter::Frees => &self.frees,
            Counter::Accesses => &self.accesses,
            Counter::MinorFaults => &self.minor_faults,
            Counter::MajorFaults => &self.major_faults,
            Counter::CowCopies => &self.cow_copies,
            Counter::Evictions => &self.evictions,
            Counter::SwapIns => &self.swap_ins,
            Counter::SwapOuts => &self.swap_outs,
            Counter::Violations => &self.violations,
            Counter::Reclaims => &self.reclaims,
        }
    }

    pub fn bump(&self, c: Counter) {
        self.counter(c).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, c: Counter) -> u64 {
        self.counter(c).load(Ordering::Relaxed)
    }

    /// Bump a global counter and apply `f` to `pid`'s counters.
    pub fn record(&self, pid: Pid, c: Counter, f: impl FnOnce(&mut ProcessStats)) {
        self.bump(c);
        f(self.processes.lock().entry(pid).or_default());
    }

    pub fn process(&self, pid: Pid) -> Option<ProcessStats> {
        self.processes.lock().get(&pid).copied()
    }

    pub fn remove_process(&self, pid: Pid) -> Option<ProcessStats> {
        self.processes.lock().remove(&pid)
    }
}

/// Point-in-time view of the whole subsystem.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct MemoryStatsSnapshot {
    pub allocations: u64,
    pub frees: u64,
    pub accesses: u64,
    pub minor_faults: u64,
    pub major_faults: u64,
    pub cow_copies: u64,
    pub evictions: u64,
    pub swap_ins: u64,
    pub swap_outs: u64,
    pub protection_violations: u64,
    pub reclaims: u64,
    pub tlb_l1: TlbStats,
    pub tlb_l2: TlbStats,
    pub cache: CacheStats,
    pub total_frames: usize,
    pub free_frames: usize,
    pub swap_slots: usize,
    pub swap_slots_used: usize,
    pub processes: usize,
    /// Allocated frames over total frames.
    pub usage_ratio: f64,
    pub fragmentation: f64,
}

impl MemoryStatsSnapshot {
    #[must_use]
    pub const fn page_faults(&self) -> u64 {
        self.minor_faults + self.major_faults
    }

    /// Page faults per translated access; `0` before the first access.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fault_rate(&self) -> f64 {
        if self.accesses == 0 {
            0.0
        } else {
            self.page_faults() as f64 / self.accesses as f64
        }
    }

    pub(crate) fn counters(stats: &MemoryStats) -> Self {
        Self {
            allocations: stats.get(Counter::Allocations),
            frees: stats.get(Counter::Frees),
            accesses: stats.get(Counter::Accesses),
            minor_faults: stats.get(Counter::MinorFaults),
            major_faults: stats.get(Counter::MajorFaults),
            cow_copies: stats.get(Counter::CowCopies),
            evictions: stats.get(Counter::Evictions),
            swap_ins: stats.get(Counter::SwapIns),
            swap_outs: stats.get(Counter::SwapOuts),
            protection_violations: stats.get(Counter::Violations),
            reclaims: stats.get(Counter::Reclaims),
            ..Self::default()
        }
    }
}
