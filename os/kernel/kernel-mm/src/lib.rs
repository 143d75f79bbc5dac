//! # Memory Manager
//!
//! The policy layer and public facade of the simulated memory subsystem. It
//! composes the physical layer ([`kernel_alloc`]) and the translation layer
//! ([`kernel_vmem`]) into one [`MemoryManager`] that processes, the file-system
//! collaborator and device collaborators talk to.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       MemoryManager                          │
//! │  RwLock<state> · signal sink · background write-back flusher │
//! └──────┬──────────────┬───────────────┬───────────────┬────────┘
//!        │              │               │               │
//!  ┌─────▼─────┐  ┌─────▼──────┐  ┌─────▼──────┐  ┌─────▼──────┐
//!  │ Translator│  │ fault / COW│  │ reclaim    │  │ frame cache│
//!  │ TLB + PTs │  │ replacement│  │ gc/compress│  │ write-back │
//!  └───────────┘  └─────┬──────┘  │ defragment │  └─────┬──────┘
//!                       │         └────────────┘        │
//!               ┌───────▼───────┐               ┌───────▼───────┐
//!               │ SwapManager   │               │ PhysicalStore │
//!               └───────────────┘               └───────────────┘
//! ```
//!
//! ## Page lifecycle
//!
//! 1. [`MemoryManager::allocate_memory`] reserves a virtual region. If a
//!    contiguous run of frames is free the pages are bound immediately,
//!    otherwise they stay zero-fill and are faulted in on first touch.
//! 2. Reads and writes translate through the TLB and page table. A missing page
//!    is a minor fault (zero fill) or a major fault (swap in).
//! 3. When no frame is free the [replacement policy](ReplacementPolicy) picks a
//!    victim. Dirty victims are written to swap; clean ones are dropped.
//! 4. A write to a shared copy-on-write page gives the writer a private copy.
//! 5. A denied access returns [`MemoryError::Protection`], is logged in the
//!    violation history and raises [`Signal::SegmentationFault`].
//!
//! ## Example
//!
//! ```rust
//! use kernel_info::{MemoryConfig, Pid};
//! use kernel_mm::MemoryManager;
//!
//! let mm = MemoryManager::new(MemoryConfig::default()).unwrap();
//! let pid = Pid::new(7);
//!
//! let va = mm.allocate_memory(pid, 10_000).unwrap();
//! mm.write_memory(pid, va, &[0xAB; 4096]).unwrap();
//! mm.write_memory(pid, va + 4096, &[0xCD; 4096]).unwrap();
//!
//! let back = mm.read_memory(pid, va, 8192).unwrap();
//! assert!(back[..4096].iter().all(|b| *b == 0xAB));
//! assert!(back[4096..].iter().all(|b| *b == 0xCD));
//!
//! mm.free_all_process_memory(pid).unwrap();
//! ```

mod cache;
mod cow;
mod dump;
mod error;
mod fault;
mod manager;
mod reclaim;
mod replacement;
mod signal;
mod state;
mod stats;

pub use crate::cache::{CacheStats, FlushDaemon, WriteBackCache};
pub use crate::dump::{DUMP_MAGIC, DUMP_VERSION, DumpHeader, DumpSummary};
pub use crate::error::MemoryError;
pub use crate::manager::MemoryManager;
pub use crate::reclaim::{CompressReport, DefragReport, GcReport, ReclaimReport};
pub use crate::replacement::{AccessTracker, Clock, Fifo, Lru, ReplacementPolicy, policy_for};
pub use crate::signal::{LogSignals, Signal, SignalSink};
pub use crate::stats::{MemoryStatsSnapshot, ProcessStats};
