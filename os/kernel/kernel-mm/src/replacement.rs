//! # Page Replacement
//!
//! Victim selection when a fault finds no free frame.
//!
//! [`AccessTracker`] keeps per-frame timestamps and reference bits on a
//! global logical clock. It is updated with atomics from the read-locked
//! access path, so recording an access never takes the manager's write lock.
//!
//! | Policy | Victim |
//! |---|---|
//! | [`Lru`] | smallest last-access tick, ties by lowest frame |
//! | [`Fifo`] | smallest load tick, ties by lowest frame |
//! | [`Clock`] | first unreferenced frame at or after the hand, clearing reference bits on the way |
//!
//! Only frames the caller passes as candidates are considered; locked and
//! shared frames are filtered out before a policy ever sees them.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use kernel_info::ReplacementPolicyKind;
use kernel_memory_addresses::FrameNumber;

/// Per-frame recency and reference state.
pub struct AccessTracker {
    tick: AtomicU64,
    last_access: Box<[AtomicU64]>,
    loaded_at: Box<[AtomicU64]>,
    referenced: Box<[AtomicBool]>,
}

impl fmt::Debug for AccessTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTracker")
            .field("frames", &self.last_access.len())
            .field("tick", &self.tick.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl AccessTracker {
    #[must_use]
    pub fn new(frames: usize) -> Self {
        Self {
            tick: AtomicU64::new(0),
            last_access: (0..frames).map(|_| AtomicU64::new(0)).collect(),
            loaded_at: (0..frames).map(|_| AtomicU64::new(0)).collect(),
            referenced: (0..frames).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record an access to `frame`.
    pub fn touch(&self, frame: FrameNumber) {
        let Some(slot) = self.last_access.get(frame.as_usize()) else {
            return;
        };
        slot.store(self.next_tick(), Ordering::Relaxed);
        self.referenced[frame.as_usize()].store(true, Ordering::Relaxed);
    }

    /// Record that `frame` was just filled with a page.
    pub fn loaded(&self, frame: FrameNumber) {
        let i = frame.as_usize();
        if i >= self.loaded_at.len() {
            return;
        }
        let now = self.next_tick();
        self.loaded_at[i].store(now, Ordering::Relaxed);
        self.last_access[i].store(now, Ordering::Relaxed);
        self.referenced[i].store(true, Ordering::Relaxed);
    }

    /// Reset a freed frame.
    pub fn forget(&self, frame: FrameNumber) {
        let i = frame.as_usize();
        if i >= self.loaded_at.len() {
            return;
        }
        self.loaded_at[i].store(0, Ordering::Relaxed);
        self.last_access[i].store(0, Ordering::Relaxed);
        self.referenced[i].store(false, Ordering::Relaxed);
    }

    /// Carry `from`'s history over to `to` and reset `from`.
    pub fn relocate(&self, from: FrameNumber, to: FrameNumber) {
        let (a, b) = (from.as_usize(), to.as_usize());
        if a >= self.loaded_at.len() || b >= self.loaded_at.len() {
            return;
        }
        self.loaded_at[b].store(self.loaded_at[a].load(Ordering::Relaxed), Ordering::Relaxed);
        self.last_access[b].store(self.last_access[a].load(Ordering::Relaxed), Ordering::Relaxed);
        self.referenced[b].store(self.referenced[a].load(Ordering::Relaxed), Ordering::Relaxed);
        self.forget(from);
    }

    #[must_use]
    pub fn last_access(&self, frame: FrameNumber) -> u64 {
        self.last_access
            .get(frame.as_usize())
            .map_or(0, |a| a.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn loaded_at(&self, frame: FrameNumber) -> u64 {
        self.loaded_at
            .get(frame.as_usize())
            .map_or(0, |a| a.load(Ordering::Relaxed))
    }

    /// Clear the reference bit, returning its previous value.
    pub fn take_reference(&self, frame: FrameNumber) -> bool {
        self.referenced
            .get(frame.as_usize())
            .is_some_and(|r| r.swap(false, Ordering::Relaxed))
    }
}

/// A victim selection policy.
pub trait ReplacementPolicy: Send + Sync + fmt::Debug {
    fn kind(&self) -> ReplacementPolicyKind;

    /// Pick one of `candidates` (ascending, non-empty unless nothing is evictable).
    fn select_victim(&self, tracker: &AccessTracker, candidates: &[FrameNumber]) -> Option<FrameNumber>;
}

/// The policy named by `kind`.
#[must_use]
pub fn policy_for(kind: ReplacementPolicyKind) -> Box<dyn ReplacementPolicy> {
    match kind {
        ReplacementPolicyKind::Lru => Box::new(Lru),
        ReplacementPolicyKind::Fifo => Box::new(Fifo),
        ReplacementPolicyKind::Clock => Box::new(Clock::default()),
    }
}

#[derive(Debug, Default, Copy, Clone)]
pub struct Lru;

impl ReplacementPolicy for Lru {
    fn kind(&self) -> ReplacementPolicyKind {
        ReplacementPolicyKind::Lru
    }

    fn select_victim(&self, tracker: &AccessTracker, candidates: &[FrameNumber]) -> Option<FrameNumber> {
        candidates
            .iter()
            .copied()
            .min_by_key(|f| (tracker.last_access(*f), *f))
    }
}

#[derive(Debug, Default, Copy, Clone)]
pub struct Fifo;

impl ReplacementPolicy for Fifo {
    fn kind(&self) -> ReplacementPolicyKind {
        ReplacementPolicyKind::Fifo
    }

    fn select_victim(&self, tracker: &AccessTracker, candidates: &[FrameNumber]) -> Option<FrameNumber> {
        candidates
            .iter()
            .copied()
            .min_by_key(|f| (tracker.loaded_at(*f), *f))
    }
}

/// Second-chance clock over frame numbers.
#[derive(Debug, Default)]
pub struct Clock {
    hand: AtomicUsize,
}

impl ReplacementPolicy for Clock {
    fn kind(&self) -> ReplacementPolicyKind {
        ReplacementPolicyKind::Clock
    }

    fn select_victim(&self, tracker: &AccessTracker, candidates: &[FrameNumber]) -> Option<FrameNumber> {
        if candidates.is_empty() {
            return None;
        }
        let hand = self.hand.load(Ordering::Relaxed);
        let start = candidates.partition_point(|f| f.as_usize() < hand);
        // Two sweeps: the first clears reference bits, the second is then guaranteed to find one.
        for i in 0..2 * candidates.len() {
            let frame = candidates[(start + i) % candidates.len()];
            if !tracker.take_reference(frame) {
                self.hand.store(frame.as_usize() + 1, Ordering::Relaxed);
                return Some(frame);
            }
        }
        let frame = candidates[start % candidates.len()];
        self.hand.store(frame.as_usize() + 1, Ordering::Relaxed);
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(v: &[u64]) -> Vec<FrameNumber> {
        v.iter().copied().map(FrameNumber::new).collect()
    }

    #[test]
    fn lru_picks_least_recent_and_breaks_ties_low() {
        let t = AccessTracker::new(4);
        let c = frames(&[0, 1, 2, 3]);
        assert_eq!(Lru.select_victim(&t, &c), Some(FrameNumber::new(0)));
        for f in &c {
            t.loaded(*f);
        }
        t.touch(FrameNumber::new(0));
        t.touch(FrameNumber::new(2));
        assert_eq!(Lru.select_victim(&t, &c), Some(FrameNumber::new(1)));
        assert_eq!(Lru.select_victim(&t, &frames(&[0, 2])), Some(FrameNumber::new(0)));
        assert_eq!(Lru.select_victim(&t, &[]), None);
    }

    #[test]
    fn fifo_ignores_later_accesses() {
        let t = AccessTracker::new(3);
        t.loaded(FrameNumber::new(2));
        t.loaded(FrameNumber::new(0));
        t.loaded(FrameNumber::new(1));
        t.touch(FrameNumber::new(2));
        assert_eq!(Fifo.select_victim(&t, &frames(&[0, 1, 2])), Some(FrameNumber::new(2)));
    }

    #[test]
    fn clock_gives_a_second_chance() {
        let t = AccessTracker::new(3);
        let c = frames(&[0, 1, 2]);
        for f in &c {
            t.loaded(*f);
        }
        let clock = Clock::default();
        // All referenced: first sweep clears, frame 0 goes.
        assert_eq!(clock.select_victim(&t, &c), Some(FrameNumber::new(0)));
        t.touch(FrameNumber::new(1));
        // Hand is at 1; frame 1 was referenced again, so 2 goes.
        assert_eq!(clock.select_victim(&t, &c), Some(FrameNumber::new(2)));
        assert_eq!(clock.select_victim(&t, &c), Some(FrameNumber::new(0)));
    }

    #[test]
    fn relocation_moves_history() {
        let t = AccessTracker::new(4);
        t.loaded(FrameNumber::new(3));
        let at = t.loaded_at(FrameNumber::new(3));
        t.relocate(FrameNumber::new(3), FrameNumber::new(0));
        assert_eq!(t.loaded_at(FrameNumber::new(0)), at);
        assert_eq!(t.loaded_at(FrameNumber::new(3)), 0);
        assert_eq!(policy_for(ReplacementPolicyKind::Clock).kind(), ReplacementPolicyKind::Clock);
    }
}
