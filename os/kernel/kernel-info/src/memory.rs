//! # Memory Layout and Defaults
//!
//! Compile-time defaults for the simulated memory subsystem. Every value can be
//! overridden through [`MemoryConfig`](crate::MemoryConfig).

/// Default page (and frame) size in bytes.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Default size of the physical store (RAM).
pub const DEFAULT_PHYSICAL_MEMORY_SIZE: u64 = 1024 * 1024; // 1 MiB

/// Default size of the swap backing store.
pub const DEFAULT_SWAP_SIZE: u64 = 4 * 1024 * 1024; // 4 MiB

/// Entries in the fully-associative first-level TLB.
pub const DEFAULT_TLB_L1_CAPACITY: usize = 16;

/// Entries in the hashed second-level TLB.
pub const DEFAULT_TLB_L2_CAPACITY: usize = 256;

/// First virtual address handed out to a process.
///
/// Page zero and the low megabytes stay unmapped so null-pointer style
/// accesses always fault.
pub const USER_SPACE_BASE: u64 = 0x0040_0000;

/// End (exclusive) of the per-process virtual range.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Number of protection violations retained for auditing.
pub const DEFAULT_VIOLATION_HISTORY: usize = 64;

/// Lines held by the write-back cache (one line per physical frame).
pub const DEFAULT_CACHE_CAPACITY: usize = 32;

/// Period of the background write-back flusher, in milliseconds.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 50;

/// A configuration must provide at least this many frames.
pub const MIN_FRAMES: u64 = 4;

const _: () = {
    assert!(DEFAULT_PAGE_SIZE.is_power_of_two());
    assert!(DEFAULT_PHYSICAL_MEMORY_SIZE.is_multiple_of(DEFAULT_PAGE_SIZE));
    assert!(DEFAULT_SWAP_SIZE.is_multiple_of(DEFAULT_PAGE_SIZE));
    assert!(DEFAULT_PHYSICAL_MEMORY_SIZE / DEFAULT_PAGE_SIZE >= MIN_FRAMES);
    assert!(USER_SPACE_BASE.is_multiple_of(DEFAULT_PAGE_SIZE));
    assert!(USER_SPACE_END > USER_SPACE_BASE);
    assert!(DEFAULT_TLB_L1_CAPACITY < DEFAULT_TLB_L2_CAPACITY);
};
