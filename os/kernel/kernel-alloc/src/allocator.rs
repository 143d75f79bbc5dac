//! # Physical Allocator
//!
//! Placement and bookkeeping on top of the [`FrameTable`].
//!
//! Multi-frame requests are placed into a run of free frames chosen by the
//! configured [`AllocationStrategy`]; single frames come straight off the
//! frame table's free list. Every allocation is recorded as a
//! [`MemoryBlock`] owned by one process, and blocks never overlap.
//!
//! ## Fragmentation
//!
//! ```text
//! fragmentation = 1 - largest_free_run / total_free      (0 when nothing is free)
//! ```
//!
//! One contiguous hole scores 0; free space scattered over many small,
//! non-adjacent holes approaches 1.

use crate::frame_table::{FrameError, FrameTable};
use crate::phys_store::PhysicalStore;
use kernel_info::{AllocationStrategy, Pid};
use kernel_memory_addresses::{FrameNumber, PageNumber, PageSize, PhysicalAddress};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum AllocationError {
    #[error("allocation size must be greater than zero")]
    ZeroSize,
    #[error("request of {requested} bytes exceeds the capacity of {capacity} bytes")]
    TooLarge { requested: u64, capacity: u64 },
    #[error("out of memory: need {frames} contiguous frames, largest hole is {largest_hole}")]
    OutOfMemory { frames: usize, largest_hole: usize },
    #[error("{address} is not the start of a block owned by {pid}")]
    NotOwner { address: PhysicalAddress, pid: Pid },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Allocator bookkeeping unit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryBlock {
    pub start: PhysicalAddress,
    /// Bytes requested; the block spans `frames` whole frames.
    pub size: u64,
    pub frames: usize,
    pub owner: Pid,
}

#[derive(Copy, Clone, Debug)]
struct Block {
    frames: usize,
    size: u64,
    owner: Pid,
}

#[derive(Debug)]
pub struct Allocator {
    table: FrameTable,
    strategy: AllocationStrategy,
    blocks: BTreeMap<FrameNumber, Block>,
    cursor: usize,
}

impl Allocator {
    #[must_use]
    pub fn new(store: Arc<PhysicalStore>, strategy: AllocationStrategy) -> Self {
        Self {
            table: FrameTable::new(store),
            strategy,
            blocks: BTreeMap::new(),
            cursor: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: AllocationStrategy) {
        if strategy != self.strategy {
            log::info!("allocation strategy {} -> {strategy}", self.strategy);
            self.strategy = strategy;
        }
    }

    #[inline]
    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.table.store().page_size()
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &FrameTable {
        &self.table
    }

    #[inline]
    pub const fn frames_mut(&mut self) -> &mut FrameTable {
        &mut self.table
    }

    /// Allocate `size` bytes of contiguous, zeroed physical memory for `pid`.
    ///
    /// The frames are owned by `pid` but not yet bound to pages; see
    /// [`FrameTable::set_owner`].
    ///
    /// # Errors
    /// Zero or oversized requests, or no hole large enough for the active strategy.
    pub fn allocate(&mut self, size: u64, pid: Pid) -> Result<PhysicalAddress, AllocationError> {
        if size == 0 {
            return Err(AllocationError::ZeroSize);
        }
        let ps = self.page_size();
        let capacity = self.table.store().size();
        if size > capacity {
            return Err(AllocationError::TooLarge {
                requested: size,
                capacity,
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        let frames = ps.pages_for(size) as usize;
        let runs = self.table.free_runs();
        let Some(start) = place(self.strategy, &runs, frames, self.cursor) else {
            return Err(AllocationError::OutOfMemory {
                frames,
                largest_hole: runs.iter().map(|r| r.1).max().unwrap_or(0),
            });
        };
        for i in 0..frames {
            self.table.allocate_frame_at(start + i as u64, pid, None)?;
        }
        self.cursor = (start.as_usize() + frames) % self.table.total().max(1);
        self.blocks.insert(start, Block { frames, size, owner: pid });
        log::debug!(
            "{} placed {frames} frames at {start} for {pid} ({size} bytes)",
            self.strategy
        );
        Ok(start.base(ps))
    }

    /// One zeroed frame for `(pid, page)` from the free list.
    ///
    /// # Errors
    /// [`FrameError::OutOfFrames`] (wrapped) if no frame is free.
    pub fn allocate_frame(&mut self, pid: Pid, page: PageNumber) -> Result<FrameNumber, AllocationError> {
        let frame = self.table.allocate_frame(pid, Some(page))?;
        self.record_single(frame, pid);
        Ok(frame)
    }

    /// Claim a specific free frame for `(pid, page)`.
    ///
    /// # Errors
    /// The frame does not exist or is in use.
    pub fn allocate_frame_at(&mut self, frame: FrameNumber, pid: Pid, page: PageNumber) -> Result<FrameNumber, AllocationError> {
        self.table.allocate_frame_at(frame, pid, Some(page))?;
        self.record_single(frame, pid);
        Ok(frame)
    }

    fn record_single(&mut self, frame: FrameNumber, pid: Pid) {
        self.blocks.insert(
            frame,
            Block {
                frames: 1,
                size: self.page_size().bytes(),
                owner: pid,
            },
        );
    }

    /// Free the block starting at `address`. Returns `false` if `pid` does not own such a block.
    pub fn free(&mut self, address: PhysicalAddress, pid: Pid) -> bool {
        let ps = self.page_size();
        if !ps.is_aligned(address.as_u64()) {
            return false;
        }
        let start = address.frame(ps);
        match self.blocks.get(&start) {
            Some(b) if b.owner == pid => {}
            _ => return false,
        }
        let Some(block) = self.blocks.remove(&start) else {
            return false;
        };
        for i in 0..block.frames {
            self.table.free_frame(start + i as u64);
        }
        true
    }

    /// Like [`free`](Self::free), but reports why a request was refused.
    ///
    /// # Errors
    /// [`AllocationError::NotOwner`] if no block of `pid` starts at `address`.
    pub fn try_free(&mut self, address: PhysicalAddress, pid: Pid) -> Result<(), AllocationError> {
        if self.free(address, pid) {
            Ok(())
        } else {
            Err(AllocationError::NotOwner { address, pid })
        }
    }

    /// Cut `frame` out of the block that contains it, keeping the head and
    /// tail as separate blocks of the same owner.
    fn detach(&mut self, frame: FrameNumber) {
        let ps = self.page_size().bytes();
        let containing = self
            .blocks
            .range(..=frame)
            .next_back()
            .filter(|(s, b)| frame.as_u64() < s.as_u64() + b.frames as u64)
            .map(|(s, b)| (*s, *b));
        let Some((start, block)) = containing else {
            return;
        };
        self.blocks.remove(&start);
        #[allow(clippy::cast_possible_truncation)]
        let head = (frame.as_u64() - start.as_u64()) as usize;
        if head > 0 {
            self.blocks.insert(
                start,
                Block {
                    frames: head,
                    size: head as u64 * ps,
                    owner: block.owner,
                },
            );
        }
        let tail = block.frames - head - 1;
        if tail > 0 {
            self.blocks.insert(
                frame + 1,
                Block {
                    frames: tail,
                    size: block
                        .size
                        .saturating_sub((head as u64 + 1) * ps)
                        .max(1),
                    owner: block.owner,
                },
            );
        }
    }

    /// Free one frame, splitting the block that contains it.
    pub fn release_frame(&mut self, frame: FrameNumber) -> bool {
        self.detach(frame);
        self.table.free_frame(frame)
    }

    /// Hand an allocated frame to `(pid, page)`, moving it into a block of its own.
    ///
    /// # Errors
    /// The frame does not exist or is not allocated.
    pub fn transfer_frame(&mut self, frame: FrameNumber, pid: Pid, page: PageNumber) -> Result<(), AllocationError> {
        self.table.set_owner(frame, pid, page)?;
        self.detach(frame);
        self.record_single(frame, pid);
        Ok(())
    }

    /// Free every block of `pid`. Returns the number of blocks freed.
    pub fn free_all(&mut self, pid: Pid) -> usize {
        let starts: Vec<FrameNumber> = self
            .blocks
            .iter()
            .filter(|(_, b)| b.owner == pid)
            .map(|(s, _)| *s)
            .collect();
        for s in &starts {
            if let Some(b) = self.blocks.remove(s) {
                for i in 0..b.frames {
                    self.table.free_frame(*s + i as u64);
                }
            }
        }
        self.table.free_process_frames(pid);
        starts.len()
    }

    /// The ledger, in address order.
    #[must_use]
    pub fn blocks(&self) -> Vec<MemoryBlock> {
        let ps = self.page_size();
        self.blocks
            .iter()
            .map(|(s, b)| MemoryBlock {
                start: s.base(ps),
                size: b.size,
                frames: b.frames,
                owner: b.owner,
            })
            .collect()
    }

    #[must_use]
    pub fn blocks_of(&self, pid: Pid) -> Vec<MemoryBlock> {
        self.blocks().into_iter().filter(|b| b.owner == pid).collect()
    }

    /// Allocated frames over total frames.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn usage_ratio(&self) -> f64 {
        let total = self.table.total();
        if total == 0 {
            0.0
        } else {
            self.table.allocated_count() as f64 / total as f64
        }
    }

    #[must_use]
    pub fn largest_free_run(&self) -> usize {
        self.table.free_runs().iter().map(|r| r.1).max().unwrap_or(0)
    }

    /// Fragmentation index in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fragmentation(&self) -> f64 {
        let free = self.table.free_count();
        if free == 0 {
            return 0.0;
        }
        (1.0 - self.largest_free_run() as f64 / free as f64).clamp(0.0, 1.0)
    }
}

/// Pick the first frame of a run of `n` free frames.
fn place(
    strategy: AllocationStrategy,
    runs: &[(FrameNumber, usize)],
    n: usize,
    cursor: usize,
) -> Option<FrameNumber> {
    let mut fits = runs.iter().copied().filter(|r| r.1 >= n);
    match strategy {
        AllocationStrategy::FirstFit => fits.next().map(|r| r.0),
        AllocationStrategy::BestFit => fits.min_by_key(|r| (r.1, r.0)).map(|r| r.0),
        AllocationStrategy::WorstFit => fits
            .max_by_key(|r| (r.1, core::cmp::Reverse(r.0)))
            .map(|r| r.0),
        AllocationStrategy::NextFit => {
            let after = runs.iter().find_map(|&(s, len)| {
                let s = s.as_usize();
                let from = s.max(cursor);
                (s + len > from && s + len - from >= n).then(|| FrameNumber::from_index(from))
            });
            after.or_else(|| fits.next().map(|r| r.0))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PS: u64 = 512;

    fn allocator(frames: usize, strategy: AllocationStrategy) -> Allocator {
        Allocator::new(
            Arc::new(PhysicalStore::new(frames, PageSize::new(PS).unwrap())),
            strategy,
        )
    }

    /// Frames 0..10 with holes of 2 at 1..3, 3 at 4..7 and 1 at 8.
    fn holes(strategy: AllocationStrategy) -> Allocator {
        let mut a = allocator(10, strategy);
        let pid = Pid::new(99);
        for f in [0u64, 3, 7, 9] {
            a.allocate_frame_at(FrameNumber::new(f), pid, PageNumber::new(f))
                .unwrap();
        }
        a
    }

    #[test]
    fn rejects_zero_and_oversized() {
        let mut a = allocator(4, AllocationStrategy::FirstFit);
        assert_eq!(a.allocate(0, Pid::new(1)), Err(AllocationError::ZeroSize));
        assert!(matches!(
            a.allocate(5 * PS, Pid::new(1)),
            Err(AllocationError::TooLarge { .. })
        ));
    }

    #[test]
    fn strategies_pick_different_holes() {
        let pid = Pid::new(1);
        let first = holes(AllocationStrategy::FirstFit).allocate(PS, pid).unwrap();
        assert_eq!(first.as_u64(), PS);
        let best = holes(AllocationStrategy::BestFit).allocate(PS, pid).unwrap();
        assert_eq!(best.as_u64(), 8 * PS);
        let worst = holes(AllocationStrategy::WorstFit).allocate(PS, pid).unwrap();
        assert_eq!(worst.as_u64(), 4 * PS);
    }

    #[test]
    fn next_fit_continues_after_previous_placement() {
        let mut a = holes(AllocationStrategy::NextFit);
        let pid = Pid::new(1);
        assert_eq!(a.allocate(PS, pid).unwrap().as_u64(), PS);
        assert_eq!(a.allocate(PS, pid).unwrap().as_u64(), 2 * PS);
        assert_eq!(a.allocate(PS, pid).unwrap().as_u64(), 4 * PS);
        assert_eq!(a.allocate(2 * PS, pid).unwrap().as_u64(), 5 * PS);
        assert_eq!(a.allocate(PS, pid).unwrap().as_u64(), 8 * PS);
        assert!(a.allocate(PS, pid).is_err());
    }

    #[test]
    fn allocation_is_zeroed_and_owned() {
        let mut a = allocator(4, AllocationStrategy::FirstFit);
        let pid = Pid::new(1);
        let pa = a.allocate(2 * PS, pid).unwrap();
        a.frames().store().fill(pa, 2 * PS as usize, 0xee).unwrap();
        assert!(a.free(pa, pid));

        let again = a.allocate(2 * PS, Pid::new(2)).unwrap();
        let mut buf = vec![1u8; 2 * PS as usize];
        a.frames().store().read(again, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn free_checks_owner() {
        let mut a = allocator(4, AllocationStrategy::FirstFit);
        let pa = a.allocate(100, Pid::new(1)).unwrap();
        assert!(!a.free(pa, Pid::new(2)));
        assert!(!a.free(pa + 1, Pid::new(1)));
        assert_eq!(
            a.try_free(pa, Pid::new(2)),
            Err(AllocationError::NotOwner {
                address: pa,
                pid: Pid::new(2)
            })
        );
        assert!(a.free(pa, Pid::new(1)));
        assert_eq!(a.usage_ratio(), 0.0);
    }

    #[test]
    fn releasing_a_frame_splits_its_block() {
        let mut a = allocator(8, AllocationStrategy::FirstFit);
        let pid = Pid::new(1);
        a.allocate(3 * PS, pid).unwrap();
        assert!(a.release_frame(FrameNumber::new(1)));
        let blocks = a.blocks_of(pid);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].frames, 1);
        assert_eq!(blocks[1].start.as_u64(), 2 * PS);
        assert_eq!(a.free_all(pid), 2);
        assert_eq!(a.frames().free_count(), 8);
    }

    #[test]
    fn transferred_frames_survive_the_old_owner() {
        let mut a = allocator(4, AllocationStrategy::FirstFit);
        let (p1, p2) = (Pid::new(1), Pid::new(2));
        a.allocate(2 * PS, p1).unwrap();
        a.transfer_frame(FrameNumber::new(1), p2, PageNumber::new(9)).unwrap();
        assert_eq!(a.free_all(p1), 1);
        let f = a.frames().get(FrameNumber::new(1)).unwrap();
        assert!(f.allocated);
        assert_eq!(f.owner, Some(p2));
        assert_eq!(a.blocks_of(p2).len(), 1);
        assert!(a.transfer_frame(FrameNumber::new(0), p2, PageNumber::new(0)).is_err());
    }

    #[test]
    fn fragmentation_index() {
        let mut a = allocator(8, AllocationStrategy::FirstFit);
        assert_eq!(a.fragmentation(), 0.0);
        let pid = Pid::new(1);
        for f in [1u64, 3, 5] {
            a.allocate_frame_at(FrameNumber::new(f), pid, PageNumber::new(f))
                .unwrap();
        }
        // Free: {0}, {2}, {4}, {6, 7} -> largest 2 of 5.
        assert!((a.fragmentation() - 0.6).abs() < 1e-9);
        a.free_all(pid);
        assert_eq!(a.fragmentation(), 0.0);
    }
}
