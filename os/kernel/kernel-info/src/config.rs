//! # Memory Subsystem Configuration
//!
//! [`MemoryConfig`] is consumed, not owned, by the memory manager: the embedding
//! system builds one (usually from [`MemoryConfig::default`] plus a few `with_*`
//! overrides), and the manager validates it once at initialization.

use crate::memory;
use core::fmt;
use core::str::FromStr;
use core::time::Duration;
use kernel_memory_addresses::PageSize;
use std::path::PathBuf;

/// Placement strategy for multi-frame physical allocations.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum AllocationStrategy {
    /// Lowest-addressed hole that fits.
    #[default]
    FirstFit,
    /// Smallest hole that fits (ties: lowest address).
    BestFit,
    /// Largest hole (ties: lowest address).
    WorstFit,
    /// First fit, starting after the previous placement and wrapping around.
    NextFit,
}

/// Victim selection policy used when no free frame exists.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum ReplacementPolicyKind {
    /// Least recently used by access tick; ties go to the lowest frame number.
    #[default]
    Lru,
    /// Oldest load first.
    Fifo,
    /// Second chance over per-frame reference bits.
    Clock,
}

/// How writes reach the physical store.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum WritePolicy {
    /// Every write lands in the store immediately.
    WriteThrough,
    /// Writes are buffered per frame and flushed later.
    #[default]
    WriteBack,
}

/// Where evicted pages are kept.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum SwapBackendKind {
    /// A heap buffer; contents vanish with the manager.
    #[default]
    Memory,
    /// A file created (or truncated) at startup.
    File(PathBuf),
}

/// Errors detected while validating or parsing configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("page size {0} is not a power of two between 512 B and 1 GiB")]
    InvalidPageSize(u64),
    #[error("{name} ({value} bytes) is not a multiple of the page size")]
    NotPageMultiple { name: &'static str, value: u64 },
    #[error("physical memory must hold at least {min} frames, got {frames}")]
    TooFewFrames { frames: u64, min: u64 },
    #[error("TLB capacity must be non-zero (L1 {l1}, L2 {l2})")]
    ZeroTlbCapacity { l1: usize, l2: usize },
    #[error("{name} must be within {min}..={max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("user space base {0:#x} is not page aligned")]
    UnalignedUserBase(u64),
    #[error("unknown {kind} {name:?}")]
    UnknownName { kind: &'static str, name: String },
}

/// Runtime configuration of the memory subsystem.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryConfig {
    pub physical_memory_size: u64,
    pub swap_size: u64,
    pub page_size: u64,
    pub tlb_l1_capacity: usize,
    pub tlb_l2_capacity: usize,
    pub allocation_strategy: AllocationStrategy,
    pub replacement_policy: ReplacementPolicyKind,
    pub swap_backend: SwapBackendKind,
    /// Usage ratio above which pages are proactively swapped out after an
    /// allocation. `1.0` disables proactive swapping.
    pub swap_threshold: f64,
    /// Committed virtual pages may not exceed `(frames + swap slots) * ratio`.
    pub overcommit_ratio: f64,
    pub violation_history: usize,
    pub write_policy: WritePolicy,
    pub cache_capacity: usize,
    /// Period of the background write-back flusher; `None` disables it.
    pub flush_interval: Option<Duration>,
    pub user_space_base: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            physical_memory_size: memory::DEFAULT_PHYSICAL_MEMORY_SIZE,
            swap_size: memory::DEFAULT_SWAP_SIZE,
            page_size: memory::DEFAULT_PAGE_SIZE,
            tlb_l1_capacity: memory::DEFAULT_TLB_L1_CAPACITY,
            tlb_l2_capacity: memory::DEFAULT_TLB_L2_CAPACITY,
            allocation_strategy: AllocationStrategy::default(),
            replacement_policy: ReplacementPolicyKind::default(),
            swap_backend: SwapBackendKind::default(),
            swap_threshold: 1.0,
            overcommit_ratio: 1.0,
            violation_history: memory::DEFAULT_VIOLATION_HISTORY,
            write_policy: WritePolicy::default(),
            cache_capacity: memory::DEFAULT_CACHE_CAPACITY,
            flush_interval: Some(Duration::from_millis(memory::DEFAULT_FLUSH_INTERVAL_MS)),
            user_space_base: memory::USER_SPACE_BASE,
        }
    }
}

impl MemoryConfig {
    #[must_use]
    pub const fn with_physical_memory_size(mut self, bytes: u64) -> Self {
        self.physical_memory_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_swap_size(mut self, bytes: u64) -> Self {
        self.swap_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_page_size(mut self, bytes: u64) -> Self {
        self.page_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_tlb_capacity(mut self, l1: usize, l2: usize) -> Self {
        self.tlb_l1_capacity = l1;
        self.tlb_l2_capacity = l2;
        self
    }

    #[must_use]
    pub const fn with_allocation_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.allocation_strategy = strategy;
        self
    }

    #[must_use]
    pub const fn with_replacement_policy(mut self, policy: ReplacementPolicyKind) -> Self {
        self.replacement_policy = policy;
        self
    }

    #[must_use]
    pub fn with_swap_backend(mut self, backend: SwapBackendKind) -> Self {
        self.swap_backend = backend;
        self
    }

    #[must_use]
    pub const fn with_swap_threshold(mut self, ratio: f64) -> Self {
        self.swap_threshold = ratio;
        self
    }

    #[must_use]
    pub const fn with_overcommit_ratio(mut self, ratio: f64) -> Self {
        self.overcommit_ratio = ratio;
        self
    }

    #[must_use]
    pub const fn with_violation_history(mut self, entries: usize) -> Self {
        self.violation_history = entries;
        self
    }

    #[must_use]
    pub const fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    #[must_use]
    pub const fn with_cache_capacity(mut self, lines: usize) -> Self {
        self.cache_capacity = lines;
        self
    }

    #[must_use]
    pub const fn with_flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.flush_interval = interval;
        self
    }

    /// The validated page geometry.
    ///
    /// # Errors
    /// [`ConfigError::InvalidPageSize`] if the size is not a supported power of two.
    pub fn page_geometry(&self) -> Result<PageSize, ConfigError> {
        PageSize::new(self.page_size).ok_or(ConfigError::InvalidPageSize(self.page_size))
    }

    /// Number of physical frames described by this configuration.
    #[must_use]
    pub const fn frame_count(&self) -> u64 {
        self.physical_memory_size / self.page_size
    }

    /// Number of swap slots described by this configuration.
    #[must_use]
    pub const fn swap_slot_count(&self) -> u64 {
        self.swap_size / self.page_size
    }

    /// Check every field; returns the page geometry on success.
    ///
    /// # Errors
    /// The first inconsistency found, as a [`ConfigError`].
    pub fn validate(&self) -> Result<PageSize, ConfigError> {
        let ps = self.page_geometry()?;
        if !ps.is_aligned(self.physical_memory_size) {
            return Err(ConfigError::NotPageMultiple {
                name: "physical memory size",
                value: self.physical_memory_size,
            });
        }
        if !ps.is_aligned(self.swap_size) {
            return Err(ConfigError::NotPageMultiple {
                name: "swap size",
                value: self.swap_size,
            });
        }
        let frames = self.frame_count();
        if frames < memory::MIN_FRAMES {
            return Err(ConfigError::TooFewFrames {
                frames,
                min: memory::MIN_FRAMES,
            });
        }
        if self.tlb_l1_capacity == 0 || self.tlb_l2_capacity == 0 {
            return Err(ConfigError::ZeroTlbCapacity {
                l1: self.tlb_l1_capacity,
                l2: self.tlb_l2_capacity,
            });
        }
        check_range("swap threshold", self.swap_threshold, 0.0, 1.0)?;
        check_range("overcommit ratio", self.overcommit_ratio, 0.1, 16.0)?;
        if !ps.is_aligned(self.user_space_base) {
            return Err(ConfigError::UnalignedUserBase(self.user_space_base));
        }
        Ok(ps)
    }
}

fn check_range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_nan() || value < min || value > max {
        return Err(ConfigError::OutOfRange {
            name,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Normalize `First_Fit`, `first-fit`, `firstfit` to `firstfit`.
fn normalize(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

impl FromStr for AllocationStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "firstfit" | "first" => Ok(Self::FirstFit),
            "bestfit" | "best" => Ok(Self::BestFit),
            "worstfit" | "worst" => Ok(Self::WorstFit),
            "nextfit" | "next" => Ok(Self::NextFit),
            _ => Err(ConfigError::UnknownName {
                kind: "allocation strategy",
                name: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FirstFit => "first-fit",
            Self::BestFit => "best-fit",
            Self::WorstFit => "worst-fit",
            Self::NextFit => "next-fit",
        })
    }
}

impl FromStr for ReplacementPolicyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "lru" | "leastrecentlyused" => Ok(Self::Lru),
            "fifo" | "firstinfirstout" => Ok(Self::Fifo),
            "clock" | "secondchance" => Ok(Self::Clock),
            _ => Err(ConfigError::UnknownName {
                kind: "replacement policy",
                name: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for ReplacementPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lru => "lru",
            Self::Fifo => "fifo",
            Self::Clock => "clock",
        })
    }
}

impl FromStr for WritePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "writethrough" => Ok(Self::WriteThrough),
            "writeback" => Ok(Self::WriteBack),
            _ => Err(ConfigError::UnknownName {
                kind: "write policy",
                name: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WriteThrough => "write-through",
            Self::WriteBack => "write-back",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let ps = MemoryConfig::default().validate().unwrap();
        assert_eq!(ps.bytes(), 4096);
        assert_eq!(MemoryConfig::default().frame_count(), 256);
        assert_eq!(MemoryConfig::default().swap_slot_count(), 1024);
    }

    #[test]
    fn rejects_bad_geometry() {
        let c = MemoryConfig::default().with_page_size(3000);
        assert_eq!(c.validate(), Err(ConfigError::InvalidPageSize(3000)));

        let c = MemoryConfig::default().with_physical_memory_size(4096 * 3 + 1);
        assert!(matches!(
            c.validate(),
            Err(ConfigError::NotPageMultiple { .. })
        ));

        let c = MemoryConfig::default().with_physical_memory_size(4096 * 2);
        assert_eq!(
            c.validate(),
            Err(ConfigError::TooFewFrames { frames: 2, min: 4 })
        );
    }

    #[test]
    fn rejects_bad_ratios_and_tlb() {
        let c = MemoryConfig::default().with_swap_threshold(1.5);
        assert!(matches!(c.validate(), Err(ConfigError::OutOfRange { .. })));

        let c = MemoryConfig::default().with_tlb_capacity(0, 8);
        assert!(matches!(
            c.validate(),
            Err(ConfigError::ZeroTlbCapacity { .. })
        ));
    }

    #[test]
    fn parses_names_leniently() {
        assert_eq!(
            "First_Fit".parse::<AllocationStrategy>().unwrap(),
            AllocationStrategy::FirstFit
        );
        assert_eq!(
            "best-fit".parse::<AllocationStrategy>().unwrap(),
            AllocationStrategy::BestFit
        );
        assert_eq!(
            "CLOCK".parse::<ReplacementPolicyKind>().unwrap(),
            ReplacementPolicyKind::Clock
        );
        assert!("random".parse::<ReplacementPolicyKind>().is_err());
    }

    #[test]
    fn names_round_trip_through_display() {
        for s in [
            AllocationStrategy::FirstFit,
            AllocationStrategy::BestFit,
            AllocationStrategy::WorstFit,
            AllocationStrategy::NextFit,
        ] {
            assert_eq!(s.to_string().parse::<AllocationStrategy>().unwrap(), s);
        }
        for p in [
            ReplacementPolicyKind::Lru,
            ReplacementPolicyKind::Fifo,
            ReplacementPolicyKind::Clock,
        ] {
            assert_eq!(p.to_string().parse::<ReplacementPolicyKind>().unwrap(), p);
        }
        for w in [WritePolicy::WriteThrough, WritePolicy::WriteBack] {
            assert_eq!(w.to_string().parse::<WritePolicy>().unwrap(), w);
        }
    }
}
