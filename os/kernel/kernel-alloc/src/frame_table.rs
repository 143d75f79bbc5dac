//! # Frame Table
//!
//! Per-frame metadata for the physical store plus an intrusive free list.
//!
//! ```text
//!  frames:  [ 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 ]
//!  state:     A   F   A   F   F   L   A   F        A = allocated, F = free, L = locked
//!  free list: head ─► 1 ◄─► 3 ◄─► 4 ◄─► 7
//! ```
//!
//! The list is doubly linked through `prev`/`next` indices stored beside the
//! metadata, so popping the head and unlinking an arbitrary frame (needed for
//! contiguous placement and compaction) are both O(1). Freed frames go to the
//! head; allocation order is therefore LIFO.
//!
//! Lookup by `(pid, page)` scans only that process's frames.

use crate::phys_store::{PhysicalStore, StoreError};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::Pid;
use kernel_memory_addresses::{FrameNumber, PageNumber};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("no free frames")]
    OutOfFrames,
    #[error("{0} does not exist")]
    InvalidFrame(FrameNumber),
    #[error("{0} is not allocated")]
    NotAllocated(FrameNumber),
    #[error("{0} is already allocated")]
    AlreadyAllocated(FrameNumber),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Snapshot of one frame's metadata.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageFrame {
    pub frame: FrameNumber,
    pub owner: Option<Pid>,
    /// The owner's page mapped to this frame, once bound.
    pub page: Option<PageNumber>,
    pub allocated: bool,
    pub locked: bool,
    pub dirty: bool,
}

#[derive(Debug, Default)]
struct Slot {
    owner: Option<Pid>,
    page: Option<PageNumber>,
    allocated: bool,
    locked: bool,
    dirty: AtomicBool,
    prev: usize,
    next: usize,
}

/// Owner of all per-frame state.
#[derive(Debug)]
pub struct FrameTable {
    store: Arc<PhysicalStore>,
    slots: Vec<Slot>,
    head: usize,
    free: usize,
    by_owner: BTreeMap<Pid, BTreeSet<FrameNumber>>,
}

impl FrameTable {
    /// One slot per frame of `store`, all free.
    #[must_use]
    pub fn new(store: Arc<PhysicalStore>) -> Self {
        let n = store.frame_count();
        let slots = (0..n)
            .map(|i| Slot {
                prev: if i == 0 { NIL } else { i - 1 },
                next: if i + 1 == n { NIL } else { i + 1 },
                ..Slot::default()
            })
            .collect();
        Self {
            store,
            slots,
            head: if n == 0 { NIL } else { 0 },
            free: n,
            by_owner: BTreeMap::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<PhysicalStore> {
        &self.store
    }

    #[inline]
    #[must_use]
    pub fn total(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    #[must_use]
    pub const fn free_count(&self) -> usize {
        self.free
    }

    #[inline]
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.slots.len() - self.free
    }

    fn slot(&self, frame: FrameNumber) -> Result<&Slot, FrameError> {
        self.slots
            .get(frame.as_usize())
            .ok_or(FrameError::InvalidFrame(frame))
    }

    fn slot_mut(&mut self, frame: FrameNumber) -> Result<&mut Slot, FrameError> {
        self.slots
            .get_mut(frame.as_usize())
            .ok_or(FrameError::InvalidFrame(frame))
    }

    fn unlink(&mut self, i: usize) {
        let (prev, next) = (self.slots[i].prev, self.slots[i].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev].next = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        }
        self.slots[i].prev = NIL;
        self.slots[i].next = NIL;
        self.free -= 1;
    }

    fn push_free(&mut self, i: usize) {
        self.slots[i].prev = NIL;
        self.slots[i].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = i;
        }
        self.head = i;
        self.free += 1;
    }

    fn claim(&mut self, i: usize, pid: Pid, page: Option<PageNumber>) -> Result<FrameNumber, FrameError> {
        let frame = FrameNumber::from_index(i);
        self.store.zero_frame(frame)?;
        self.unlink(i);
        let slot = &mut self.slots[i];
        slot.owner = Some(pid);
        slot.page = page;
        slot.allocated = true;
        slot.locked = false;
        slot.dirty.store(false, Ordering::Relaxed);
        self.by_owner.entry(pid).or_default().insert(frame);
        Ok(frame)
    }

    /// Take the frame at the head of the free list, zeroed.
    ///
    /// # Errors
    /// [`FrameError::OutOfFrames`] if no frame is free.
    pub fn allocate_frame(&mut self, pid: Pid, page: Option<PageNumber>) -> Result<FrameNumber, FrameError> {
        if self.head == NIL {
            return Err(FrameError::OutOfFrames);
        }
        self.claim(self.head, pid, page)
    }

    /// Take a specific free frame, zeroed.
    ///
    /// # Errors
    /// The frame does not exist or is already allocated.
    pub fn allocate_frame_at(&mut self, frame: FrameNumber, pid: Pid, page: Option<PageNumber>) -> Result<FrameNumber, FrameError> {
        if self.slot(frame)?.allocated {
            return Err(FrameError::AlreadyAllocated(frame));
        }
        self.claim(frame.as_usize(), pid, page)
    }

    /// Return a frame to the free list. Returns `false` if it was not allocated.
    pub fn free_frame(&mut self, frame: FrameNumber) -> bool {
        let Ok(slot) = self.slot_mut(frame) else {
            return false;
        };
        if !slot.allocated {
            return false;
        }
        let owner = slot.owner.take();
        slot.page = None;
        slot.allocated = false;
        slot.locked = false;
        slot.dirty.store(false, Ordering::Relaxed);
        if let Some(pid) = owner
            && let Some(set) = self.by_owner.get_mut(&pid)
        {
            set.remove(&frame);
            if set.is_empty() {
                self.by_owner.remove(&pid);
            }
        }
        self.push_free(frame.as_usize());
        true
    }

    /// Free every frame owned by `pid`. Returns how many were freed.
    pub fn free_process_frames(&mut self, pid: Pid) -> usize {
        self.frames_of(pid)
            .into_iter()
            .filter(|f| self.free_frame(*f))
            .count()
    }

    /// Exempt a frame from replacement.
    ///
    /// # Errors
    /// The frame does not exist or is not allocated.
    pub fn lock_frame(&mut self, frame: FrameNumber) -> Result<(), FrameError> {
        self.set_locked(frame, true)
    }

    /// # Errors
    /// The frame does not exist or is not allocated.
    pub fn unlock_frame(&mut self, frame: FrameNumber) -> Result<(), FrameError> {
        self.set_locked(frame, false)
    }

    fn set_locked(&mut self, frame: FrameNumber, locked: bool) -> Result<(), FrameError> {
        let slot = self.slot_mut(frame)?;
        if !slot.allocated {
            return Err(FrameError::NotAllocated(frame));
        }
        slot.locked = locked;
        Ok(())
    }

    /// Rebind an allocated frame to `(pid, page)`.
    ///
    /// # Errors
    /// The frame does not exist or is not allocated.
    pub fn set_owner(&mut self, frame: FrameNumber, pid: Pid, page: PageNumber) -> Result<(), FrameError> {
        let slot = self.slot_mut(frame)?;
        if !slot.allocated {
            return Err(FrameError::NotAllocated(frame));
        }
        let old = slot.owner.replace(pid);
        slot.page = Some(page);
        if old != Some(pid) {
            if let Some(old) = old
                && let Some(set) = self.by_owner.get_mut(&old)
            {
                set.remove(&frame);
                if set.is_empty() {
                    self.by_owner.remove(&old);
                }
            }
            self.by_owner.entry(pid).or_default().insert(frame);
        }
        Ok(())
    }

    /// Record a write to the frame. Callable through a shared reference.
    pub fn mark_dirty(&self, frame: FrameNumber) {
        if let Ok(slot) = self.slot(frame) {
            slot.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn clear_dirty(&self, frame: FrameNumber) {
        if let Ok(slot) = self.slot(frame) {
            slot.dirty.store(false, Ordering::Relaxed);
        }
    }

    /// Metadata snapshot for `frame`.
    #[must_use]
    pub fn get(&self, frame: FrameNumber) -> Option<PageFrame> {
        let slot = self.slot(frame).ok()?;
        Some(PageFrame {
            frame,
            owner: slot.owner,
            page: slot.page,
            allocated: slot.allocated,
            locked: slot.locked,
            dirty: slot.dirty.load(Ordering::Relaxed),
        })
    }

    #[must_use]
    pub fn is_free(&self, frame: FrameNumber) -> bool {
        self.slot(frame).is_ok_and(|s| !s.allocated)
    }

    /// The frame owned by `pid` and bound to `page`.
    #[must_use]
    pub fn find(&self, pid: Pid, page: PageNumber) -> Option<FrameNumber> {
        self.by_owner
            .get(&pid)?
            .iter()
            .copied()
            .find(|f| self.slots[f.as_usize()].page == Some(page))
    }

    /// Frames owned by `pid`, ascending.
    #[must_use]
    pub fn frames_of(&self, pid: Pid) -> Vec<FrameNumber> {
        self.by_owner
            .get(&pid)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Pids owning at least one frame.
    pub fn owners(&self) -> impl Iterator<Item = Pid> + '_ {
        self.by_owner.keys().copied()
    }

    /// Metadata of every allocated frame, ascending.
    pub fn allocated(&self) -> impl Iterator<Item = PageFrame> + '_ {
        (0..self.slots.len())
            .filter(|i| self.slots[*i].allocated)
            .filter_map(|i| self.get(FrameNumber::from_index(i)))
    }

    /// Maximal runs of free frames as `(first, length)`, ascending.
    #[must_use]
    pub fn free_runs(&self) -> Vec<(FrameNumber, usize)> {
        let mut runs = Vec::new();
        let mut start = None;
        for (i, s) in self.slots.iter().enumerate() {
            match (s.allocated, start) {
                (false, None) => start = Some(i),
                (true, Some(st)) => {
                    runs.push((FrameNumber::from_index(st), i - st));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(st) = start {
            runs.push((FrameNumber::from_index(st), self.slots.len() - st));
        }
        runs
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kernel_memory_addresses::PageSize;

    fn table(n: usize) -> FrameTable {
        FrameTable::new(Arc::new(PhysicalStore::new(n, PageSize::new(512).unwrap())))
    }

    #[test]
    fn allocate_until_exhausted() {
        let mut t = table(3);
        let pid = Pid::new(1);
        for i in 0..3 {
            t.allocate_frame(pid, Some(PageNumber::new(i))).unwrap();
        }
        assert_eq!(t.free_count(), 0);
        assert_eq!(t.allocate_frame(pid, None), Err(FrameError::OutOfFrames));
    }

    #[test]
    fn freed_frames_are_reused_first() {
        let mut t = table(4);
        let pid = Pid::new(1);
        let a = t.allocate_frame(pid, None).unwrap();
        let _b = t.allocate_frame(pid, None).unwrap();
        assert!(t.free_frame(a));
        assert!(!t.free_frame(a));
        assert_eq!(t.allocate_frame(pid, None).unwrap(), a);
    }

    #[test]
    fn new_frames_are_cleared() {
        let mut t = table(2);
        let pid = Pid::new(1);
        let f = t.allocate_frame(pid, None).unwrap();
        t.store().write_frame(f, 0, &[0xff; 16]).unwrap();
        t.free_frame(f);
        let g = t.allocate_frame(Pid::new(2), None).unwrap();
        assert_eq!(f, g);
        assert!(t.store().is_zero(g).unwrap());
    }

    #[test]
    fn allocate_at_unlinks_from_middle() {
        let mut t = table(5);
        let pid = Pid::new(1);
        t.allocate_frame_at(FrameNumber::new(2), pid, None).unwrap();
        assert_eq!(
            t.allocate_frame_at(FrameNumber::new(2), pid, None),
            Err(FrameError::AlreadyAllocated(FrameNumber::new(2)))
        );
        let mut got: Vec<_> = (0..4).map(|_| t.allocate_frame(pid, None).unwrap().as_u64()).collect();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 3, 4]);
    }

    #[test]
    fn ownership_lookup_and_process_teardown() {
        let mut t = table(6);
        let a = Pid::new(1);
        let b = Pid::new(2);
        let f1 = t.allocate_frame(a, Some(PageNumber::new(10))).unwrap();
        t.allocate_frame(a, Some(PageNumber::new(11))).unwrap();
        let f3 = t.allocate_frame(b, Some(PageNumber::new(10))).unwrap();
        assert_eq!(t.find(a, PageNumber::new(10)), Some(f1));
        assert_eq!(t.find(b, PageNumber::new(10)), Some(f3));

        t.set_owner(f1, b, PageNumber::new(12)).unwrap();
        assert_eq!(t.frames_of(a).len(), 1);
        assert_eq!(t.free_process_frames(b), 2);
        assert_eq!(t.free_count(), 5);
        assert!(t.frames_of(b).is_empty());
    }

    #[test]
    fn lock_and_dirty_flags() {
        let mut t = table(2);
        let f = t.allocate_frame(Pid::new(1), None).unwrap();
        t.lock_frame(f).unwrap();
        t.mark_dirty(f);
        let meta = t.get(f).unwrap();
        assert!(meta.locked && meta.dirty && meta.allocated);
        t.unlock_frame(f).unwrap();
        assert!(!t.get(f).unwrap().locked);
        assert_eq!(
            t.lock_frame(FrameNumber::new(1)),
            Err(FrameError::NotAllocated(FrameNumber::new(1)))
        );
    }

    #[test]
    fn free_runs_reflect_holes() {
        let mut t = table(6);
        let pid = Pid::new(1);
        t.allocate_frame_at(FrameNumber::new(1), pid, None).unwrap();
        t.allocate_frame_at(FrameNumber::new(4), pid, None).unwrap();
        assert_eq!(
            t.free_runs(),
            vec![
                (FrameNumber::new(0), 1),
                (FrameNumber::new(2), 2),
                (FrameNumber::new(5), 1)
            ]
        );
    }
}
