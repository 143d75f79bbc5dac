//! # Virtual Memory Support
//!
//! Per-process page tables, virtual regions, a two-level TLB, the address
//! translator, and region-level access control for the simulated MMU.
//!
//! ## What you get
//! - A [`PageEntry`] bitfield describing one page (frame or swap slot, R/W/X,
//!   accessed/dirty, shared/copy-on-write).
//! - A sparse [`PageTable`] and an [`AddressSpace`] that hands out page-aligned
//!   virtual [`Region`]s.
//! - L1/L2 [`tlb`] levels behind a common [`Tlb`] trait, composed into
//!   [`TwoLevelTlb`].
//! - A [`Translator`] returning either a physical address or a typed reason why
//!   the access cannot complete yet (fault, copy-on-write) or at all.
//! - [`AccessControl`] for protection regions and violation auditing.
//!
//! ## Virtual Address → Physical Address
//!
//! ```text
//!   VA ──split──► (page, offset)
//!                    │
//!          ┌─────────▼─────────┐   hit    ┌──────────────┐
//!          │  L1 TLB ─► L2 TLB │ ───────► │ frame·size+off│ ──► PA
//!          └─────────┬─────────┘          └──────▲───────┘
//!               miss │                            │
//!          ┌─────────▼─────────┐  present + allowed│
//!          │    page table     │ ───────────────────┘
//!          └─────────┬─────────┘
//!                    │ not present / COW / denied
//!                    ▼
//!            TranslateError (handled by the fault pipeline or surfaced)
//! ```
//!
//! ## Page states
//!
//! | State | Entry bits | Next transition |
//! |:------|:-----------|:----------------|
//! | Unmapped | no entry | `AddressSpace::insert_region` |
//! | Zero-fill | `!present && !swapped` | minor fault |
//! | Present | `present`, target = frame | eviction |
//! | Swapped-out | `swapped`, target = slot | major fault |

mod address_space;
mod page_entry;
mod page_table;
mod permissions;
mod protection;
pub mod tlb;
mod translator;

pub use crate::address_space::{AddressSpace, AddressSpaceError, Region, RegionKind};
pub use crate::page_entry::{AtomicPageEntry, PageEntry, SwapSlot};
pub use crate::page_table::PageTable;
pub use crate::permissions::{Access, ParseAccessError, Permissions};
pub use crate::protection::{
    AccessControl, DenialReason, ProtectionError, ProtectionRegion, Violation,
};
pub use crate::tlb::{Tlb, TlbEntry, TlbLevel, TlbStats, TwoLevelTlb};
pub use crate::translator::{
    FaultKind, PageFault, TranslateError, Translation, TranslationError, TranslationSource,
    Translator,
};

/// Re-export constants as info module.
pub use kernel_info::memory as info;
