//! # Demand Paging
//!
//! Page-fault resolution and eviction.
//!
//! ```text
//!  fault(pid, va)
//!     │
//!     ├─ free frame? ──────────────── yes ─┐
//!     │   no                               │
//!     ├─ evict a victim (policy) ── ok ────┤
//!     │   nothing evictable                │
//!     └─ force reclaim, retry once ────────┤
//!                                          ▼
//!                     swapped? read slot : frame stays zeroed
//!                                          │
//!                     PTE present, TLB entry dropped, tracker loaded
//! ```
//!
//! A victim is written to swap only if it is dirty or has never been
//! written there before; a clean page with a retained slot is dropped
//! without I/O.

use crate::error::MemoryError;
use crate::state::VmState;
use crate::stats::Counter;
use kernel_alloc::{AllocationError, FrameError};
use kernel_info::Pid;
use kernel_memory_addresses::{FrameNumber, PageNumber, VirtualAddress};
use kernel_vmem::{Access, FaultKind, SwapSlot, TranslationError};

impl VmState {
    /// Bring the page containing `va` into memory. Returns `None` if it was
    /// already resident.
    pub fn resolve_fault(&mut self, pid: Pid, va: VirtualAddress, access: Access) -> Result<Option<FaultKind>, MemoryError> {
        let page = va.page(self.page_size);
        let entry = self
            .entry(pid, page)
            .ok_or(TranslationError::Unmapped { pid, address: va })?;
        if entry.present() {
            return Ok(None);
        }

        let frame = self
            .obtain_frame(pid, page)
            .map_err(|e| MemoryError::fault(pid, va, e))?;
        let kind = match entry.swap_slot() {
            Some(slot) => {
                if let Err(e) = self.swap_in(slot, frame) {
                    self.release_frame(frame);
                    return Err(MemoryError::fault(pid, va, e));
                }
                self.stats.bump(Counter::SwapIns);
                self.stats
                    .record(pid, Counter::MajorFaults, |p| p.major_faults += 1);
                FaultKind::Major
            }
            None => {
                self.stats
                    .record(pid, Counter::MinorFaults, |p| p.minor_faults += 1);
                FaultKind::Minor
            }
        };

        self.space_mut(pid)?
            .page_table_mut()
            .update(page, |e| e.mapped_to(frame));
        self.tlb.invalidate(pid, page);
        self.tracker.loaded(frame);
        log::debug!("{kind} fault on {va} ({access}) for {pid} -> {frame}");
        Ok(Some(kind))
    }

    fn swap_in(&mut self, slot: SwapSlot, frame: FrameNumber) -> Result<(), MemoryError> {
        let mut buf = vec![0u8; self.page_size.bytes_usize()];
        self.swap.read(slot, &mut buf)?;
        self.store.write_frame(frame, 0, &buf)?;
        Ok(())
    }

    /// A zeroed frame owned by `(pid, page)`, evicting or reclaiming if needed.
    pub fn obtain_frame(&mut self, pid: Pid, page: PageNumber) -> Result<FrameNumber, MemoryError> {
        match self.allocator.allocate_frame(pid, page) {
            Ok(frame) => return Ok(frame),
            Err(AllocationError::Frame(FrameError::OutOfFrames)) => {}
            Err(e) => return Err(e.into()),
        }
        match self.evict_one() {
            Ok(Some(_)) => return Ok(self.allocator.allocate_frame(pid, page)?),
            Ok(None) => log::warn!("no evictable frame for {pid} {page}"),
            Err(e) if e.is_exhaustion() => log::warn!("eviction for {pid} {page} failed: {e}"),
            Err(e) => return Err(e),
        }
        self.force_reclaim()?;
        Ok(self.allocator.allocate_frame(pid, page)?)
    }

    /// Frames a policy may pick: allocated, unlocked, private, and currently
    /// mapped by the page their frame-table entry names.
    pub fn eviction_candidates(&self) -> Vec<FrameNumber> {
        self.allocator
            .frames()
            .allocated()
            .filter(|f| !f.locked && !self.shared.contains_key(&f.frame))
            .filter(|f| {
                f.owner
                    .zip(f.page)
                    .and_then(|(pid, page)| self.entry(pid, page))
                    .and_then(|e| e.frame())
                    == Some(f.frame)
            })
            .map(|f| f.frame)
            .collect()
    }

    /// Evict whichever frame the replacement policy picks.
    pub fn evict_one(&mut self) -> Result<Option<FrameNumber>, MemoryError> {
        let candidates = self.eviction_candidates();
        let Some(victim) = self.policy.select_victim(&self.tracker, &candidates) else {
            return Ok(None);
        };
        self.evict_frame(victim)?;
        Ok(Some(victim))
    }

    /// Push `frame` out to swap (or drop it if clean) and free it.
    pub fn evict_frame(&mut self, frame: FrameNumber) -> Result<(), MemoryError> {
        let info = self
            .allocator
            .frames()
            .get(frame)
            .ok_or(FrameError::InvalidFrame(frame))?;
        let (pid, page) = info
            .owner
            .zip(info.page)
            .ok_or(FrameError::NotAllocated(frame))?;
        let entry = self
            .entry(pid, page)
            .ok_or(MemoryError::Invariant("eviction victim has no page entry"))?;

        self.cache.evict(frame)?;
        let dirty = entry.dirty() || info.dirty;
        let retained = self.swap.slot_of(pid, page);
        let evicted = match retained {
            Some(slot) if !dirty => entry.swapped_to(slot),
            // Never written since it was zeroed.
            None if !dirty => entry.evicted_clean(),
            _ => {
                let slot = self.swap.allocate_swap_area(pid, page)?;
                let written = self
                    .store
                    .frame_bytes(frame)
                    .map_err(MemoryError::from)
                    .and_then(|bytes| Ok(self.swap.write(slot, &bytes)?));
                if let Err(e) = written {
                    if retained.is_none() {
                        self.swap.free(slot);
                    }
                    return Err(e);
                }
                self.stats.bump(Counter::SwapOuts);
                entry.swapped_to(slot)
            }
        };

        self.tlb.invalidate(pid, page);
        self.space_mut(pid)?.page_table_mut().set(page, evicted);
        self.tracker.forget(frame);
        self.allocator.release_frame(frame);
        self.stats.bump(Counter::Evictions);
        log::debug!("evicted {frame} ({pid} {page}, {})", if dirty { "dirty" } else { "clean" });
        Ok(())
    }
}
