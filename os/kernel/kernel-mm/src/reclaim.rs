//! # Reclamation
//!
//! Maintenance passes that return physical memory without a process asking:
//!
//! - [`collect_garbage`](VmState::collect_garbage) frees frames and swap slots
//!   no page table refers to any more.
//! - [`compress`](VmState::compress) drops resident pages that are all zero;
//!   they come back as zero-fill on the next touch.
//! - [`defragment`](VmState::defragment) moves private pages down into the
//!   lowest free frames so the free space forms one run.
//! - [`force_reclaim`](VmState::force_reclaim) runs the first two after a
//!   cache flush and evicts one page if nothing came back.

use crate::error::MemoryError;
use crate::state::VmState;
use crate::stats::Counter;
use kernel_alloc::{FrameError, PageFrame};
use kernel_memory_addresses::FrameNumber;
use kernel_vmem::SwapSlot;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct GcReport {
    pub frames_freed: usize,
    pub slots_freed: usize,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CompressReport {
    pub pages_scanned: usize,
    pub frames_released: usize,
    pub bytes_released: u64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct DefragReport {
    pub fragmentation_before: f64,
    pub fragmentation_after: f64,
    pub frames_moved: usize,
}

/// What one [`force_memory_reclaim`](crate::MemoryManager::force_memory_reclaim) pass did.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ReclaimReport {
    pub cache_lines_flushed: usize,
    pub gc: GcReport,
    pub compress: CompressReport,
    /// Set when neither pass freed anything and a page was evicted instead.
    pub evicted: Option<FrameNumber>,
}

impl ReclaimReport {
    #[must_use]
    pub const fn frames_freed(&self) -> usize {
        self.gc.frames_freed + self.compress.frames_released + if self.evicted.is_some() { 1 } else { 0 }
    }
}

impl VmState {
    /// `true` if some page table maps `f` at the page its frame-table entry names.
    fn is_mapped(&self, f: &PageFrame) -> bool {
        f.owner
            .zip(f.page)
            .and_then(|(pid, page)| self.entry(pid, page))
            .and_then(|e| e.frame())
            == Some(f.frame)
    }

    pub fn collect_garbage(&mut self) -> GcReport {
        let orphans: Vec<FrameNumber> = self
            .allocator
            .frames()
            .allocated()
            .filter(|f| !f.locked && f.page.is_some())
            .filter(|f| !self.shared.contains_key(&f.frame) && !self.is_mapped(f))
            .map(|f| f.frame)
            .collect();
        for frame in &orphans {
            log::debug!("gc: {frame} is not mapped");
            self.release_frame(*frame);
        }

        let stale: Vec<SwapSlot> = self
            .swap
            .allocated()
            .into_iter()
            .filter(|(_, pid, page)| self.entry(*pid, *page).is_none())
            .map(|(slot, ..)| slot)
            .collect();
        for slot in &stale {
            self.swap.free(*slot);
        }

        let report = GcReport {
            frames_freed: orphans.len(),
            slots_freed: stale.len(),
        };
        if report != GcReport::default() {
            log::info!(
                "gc: freed {} frames and {} swap slots",
                report.frames_freed,
                report.slots_freed
            );
        }
        report
    }

    /// Release every private, unlocked resident page whose contents are all zero.
    pub fn compress(&mut self) -> Result<CompressReport, MemoryError> {
        let candidates = self.eviction_candidates();
        let mut report = CompressReport {
            pages_scanned: candidates.len(),
            ..CompressReport::default()
        };
        for frame in candidates {
            self.cache.evict(frame)?;
            if !self.store.is_zero(frame)? {
                continue;
            }
            let Some((pid, page)) = self
                .allocator
                .frames()
                .get(frame)
                .and_then(|f| f.owner.zip(f.page))
            else {
                continue;
            };
            self.space_mut(pid)?
                .page_table_mut()
                .update(page, |e| e.evicted_clean());
            self.swap.free_page(pid, page);
            self.tlb.invalidate(pid, page);
            self.release_frame(frame);
            report.frames_released += 1;
            report.bytes_released += self.page_size.bytes();
        }
        if report.frames_released > 0 {
            log::info!(
                "compress: released {} zero pages of {} scanned",
                report.frames_released,
                report.pages_scanned
            );
        }
        Ok(report)
    }

    /// Compact private pages towards frame zero.
    pub fn defragment(&mut self) -> Result<DefragReport, MemoryError> {
        let before = self.allocator.fragmentation();
        let mut moved = 0;
        loop {
            let Some(&(hole, _)) = self.allocator.frames().free_runs().first() else {
                break;
            };
            let Some(src) = self
                .eviction_candidates()
                .into_iter()
                .rev()
                .find(|f| *f > hole)
            else {
                break;
            };
            self.relocate(src, hole)?;
            moved += 1;
        }
        let report = DefragReport {
            fragmentation_before: before,
            fragmentation_after: self.allocator.fragmentation(),
            frames_moved: moved,
        };
        log::info!(
            "defragment: moved {moved} frames, fragmentation {:.3} -> {:.3}",
            report.fragmentation_before,
            report.fragmentation_after
        );
        Ok(report)
    }

    /// Move the page in `src` into the free frame `dst`.
    fn relocate(&mut self, src: FrameNumber, dst: FrameNumber) -> Result<(), MemoryError> {
        let info = self
            .allocator
            .frames()
            .get(src)
            .ok_or(FrameError::InvalidFrame(src))?;
        let (pid, page) = info
            .owner
            .zip(info.page)
            .ok_or(FrameError::NotAllocated(src))?;
        self.cache.evict(src)?;
        self.allocator.allocate_frame_at(dst, pid, page)?;
        if let Err(e) = self.store.copy_frame(src, dst) {
            self.allocator.release_frame(dst);
            return Err(e.into());
        }
        if info.dirty {
            self.allocator.frames().mark_dirty(dst);
        }
        self.space_mut(pid)?
            .page_table_mut()
            .update(page, |e| e.relocated_to(dst));
        self.tlb.invalidate(pid, page);
        self.tracker.relocate(src, dst);
        self.allocator.release_frame(src);
        log::trace!("defragment: {pid} {page} {src} -> {dst}");
        Ok(())
    }

    /// Flush, collect, compress, and as a last resort evict one page.
    pub fn force_reclaim(&mut self) -> Result<ReclaimReport, MemoryError> {
        self.stats.bump(Counter::Reclaims);
        let mut report = ReclaimReport {
            cache_lines_flushed: self.cache.flush_all()?,
            gc: self.collect_garbage(),
            compress: self.compress()?,
            evicted: None,
        };
        if report.frames_freed() == 0 {
            match self.evict_one() {
                Ok(evicted) => report.evicted = evicted,
                Err(e) => log::warn!("reclaim could not evict: {e}"),
            }
        }
        log::info!(
            "reclaim: {} frames freed, {} free now",
            report.frames_freed(),
            self.allocator.frames().free_count()
        );
        Ok(report)
    }
}
