#![allow(dead_code)]

use kernel_info::MemoryConfig;
use kernel_mm::{Signal, SignalSink};
use parking_lot::Mutex;

pub const PS: u64 = 512;

/// A small, deterministic machine: no background flusher, tiny TLB and cache.
pub fn small(frames: u64, swap_slots: u64) -> MemoryConfig {
    MemoryConfig::default()
        .with_page_size(PS)
        .with_physical_memory_size(frames * PS)
        .with_swap_size(swap_slots * PS)
        .with_tlb_capacity(4, 16)
        .with_cache_capacity(4)
        .with_flush_interval(None)
}

/// Byte `i` of a pattern that differs per page and per seed.
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i / PS as usize) as u8).wrapping_mul(31) ^ (i as u8))
        .collect()
}

#[derive(Debug, Default)]
pub struct Recorder(pub Mutex<Vec<Signal>>);

impl SignalSink for Recorder {
    fn deliver(&self, signal: Signal) {
        self.0.lock().push(signal);
    }
}
