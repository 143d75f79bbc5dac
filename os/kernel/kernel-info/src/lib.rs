//! # Memory Subsystem Configuration
//!
//! Shared definitions consumed by every layer of the simulated memory
//! subsystem: process identifiers, default layout constants, and the runtime
//! [`MemoryConfig`].
//!
//! ## Overview
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`Pid`] | Key under which page tables, frames, swap slots and statistics are owned. |
//! | [`memory`] | Compile-time defaults (sizes, TLB capacities, user space base). |
//! | [`MemoryConfig`] | Runtime configuration, validated once by the memory manager. |
//! | [`AllocationStrategy`] / [`ReplacementPolicyKind`] / [`WritePolicy`] | Named, parseable policy selectors. |
//!
//! ## Virtual Layout
//!
//! Every process gets its own, private virtual range:
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  unmapped (null guard)          │
//! USER_SPACE_BASE       ├─────────────────────────────────┤ 0x0000_0000_0040_0000
//!                       │  regions handed out by          │
//!                       │  allocate / mappings            │
//! USER_SPACE_END        ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │  never mapped                   │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use kernel_info::{MemoryConfig, ReplacementPolicyKind};
//!
//! let config = MemoryConfig::default()
//!     .with_physical_memory_size(64 * 1024)
//!     .with_replacement_policy("clock".parse().unwrap());
//!
//! let page_size = config.validate().unwrap();
//! assert_eq!(page_size.bytes(), 4096);
//! assert_eq!(config.frame_count(), 16);
//! assert_eq!(config.replacement_policy, ReplacementPolicyKind::Clock);
//! ```

#![deny(unsafe_code)]

mod config;
pub mod memory;
mod process;

pub use crate::config::{
    AllocationStrategy, ConfigError, MemoryConfig, ReplacementPolicyKind, SwapBackendKind,
    WritePolicy,
};
pub use crate::process::Pid;
