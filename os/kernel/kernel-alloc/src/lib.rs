//! # Physical Memory Management
//!
//! Everything that owns or hands out physical storage in the simulated
//! machine: RAM, its frames, the placement allocator, and swap.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Allocator                        │
//! │    • first/best/worst/next-fit placement            │
//! │    • per-process MemoryBlock ledger                 │
//! │    • usage ratio and fragmentation index            │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                   Frame Table                       │
//! │    • per-frame owner / locked / dirty               │
//! │    • O(1) intrusive free list                       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                 Physical Store                      │
//! │    • byte arena split into per-frame locks          │
//! │    • bounds-checked read / write / copy             │
//! └─────────────────────────────────────────────────────┘
//!
//!   Swap Manager (beside the stack): page-sized slots in a memory or file backend
//! ```
//!
//! ## Core Components
//!
//! ### Physical Store ([`PhysicalStore`])
//!
//! Fixed at construction. Reads and writes may span frames; each frame has its
//! own lock so concurrent transfers to different frames do not serialize.
//!
//! ### Frame Table ([`FrameTable`])
//!
//! Tracks who owns each frame and which page it backs. Newly allocated frames
//! are always zeroed, so no data leaks between processes.
//!
//! ### Allocator ([`Allocator`])
//!
//! Places multi-frame requests according to the active
//! [`AllocationStrategy`](kernel_info::AllocationStrategy) and keeps the block
//! ledger consistent when single frames are released out of a block.
//!
//! ### Swap ([`SwapManager`])
//!
//! Backing store for evicted pages. Slots are owned by `(pid, page)` and stay
//! allocated across swap-in so clean pages can be dropped without I/O.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use kernel_alloc::{Allocator, PhysicalStore};
//! use kernel_info::{AllocationStrategy, Pid};
//! use kernel_memory_addresses::PageSize;
//!
//! let store = Arc::new(PhysicalStore::new(16, PageSize::SIZE_4K));
//! let mut alloc = Allocator::new(store, AllocationStrategy::FirstFit);
//!
//! let pa = alloc.allocate(10_000, Pid::new(7)).unwrap();
//! assert_eq!(alloc.frames().allocated_count(), 3);
//! assert!(alloc.free(pa, Pid::new(7)));
//! ```

mod allocator;
mod frame_table;
mod phys_store;
mod swap;

pub use crate::allocator::{AllocationError, Allocator, MemoryBlock};
pub use crate::frame_table::{FrameError, FrameTable, PageFrame};
pub use crate::phys_store::{PhysicalStore, StoreError};
pub use crate::swap::{FileSwap, MemorySwap, SwapBackend, SwapError, SwapManager};
