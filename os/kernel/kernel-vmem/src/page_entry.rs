use crate::Permissions;
use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::FrameNumber;

/// A swap slot index, i.e. the position of one page-sized block in the swap
/// backing store.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SwapSlot(u64);

impl SwapSlot {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// A single page-table entry in its raw bitfield form.
///
/// The layout loosely follows a hardware PTE, but it is a simulation format:
/// there is no architecture it has to match.
///
/// ### Bit layout
///
/// | Bits   | Name             | Meaning |
/// |--------|------------------|---------|
/// | 0      | `present`        | `target` is a frame number |
/// | 1      | `readable`       | Reads allowed |
/// | 2      | `writable`       | Writes allowed |
/// | 3      | `executable`     | Instruction fetches allowed |
/// | 4      | `accessed`       | Touched since load |
/// | 5      | `dirty`          | Written since load |
/// | 6      | `shared`         | Frame is (or was) mapped by more than one process |
/// | 7      | `copy_on_write`  | A write must copy the frame first |
/// | 8      | `swapped`        | `target` is a swap slot |
/// | 9–15   | OS avail         | Unused |
/// | 16–63  | `target`         | Frame number or swap slot |
///
/// ### States
///
/// | `present` | `swapped` | State |
/// |-----------|-----------|-------|
/// | 1 | 0 | Resident in frame `target` |
/// | 0 | 1 | Swapped out to slot `target` |
/// | 0 | 0 | Never materialized, zero-fill on demand |
///
/// ### Example
/// ```rust
/// # use kernel_vmem::{PageEntry, Permissions};
/// # use kernel_memory_addresses::FrameNumber;
/// let e = PageEntry::resident(FrameNumber::new(7), Permissions::READ | Permissions::WRITE);
/// assert!(e.present());
/// assert_eq!(e.frame(), Some(FrameNumber::new(7)));
/// assert!(e.permissions().contains(Permissions::WRITE));
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    pub present: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub shared: bool,
    pub copy_on_write: bool,
    pub swapped: bool,

    #[bits(7)]
    pub os_available: u8,

    #[bits(48)]
    target: u64,
}

impl PageEntry {
    /// A not-yet-materialized page with the given permissions.
    #[inline]
    #[must_use]
    pub const fn zero_fill(perms: Permissions) -> Self {
        Self::new().with_permissions(perms)
    }

    /// A resident page mapped to `frame`.
    #[inline]
    #[must_use]
    pub const fn resident(frame: FrameNumber, perms: Permissions) -> Self {
        Self::zero_fill(perms)
            .with_present(true)
            .with_target(frame.as_u64())
    }

    #[inline]
    #[must_use]
    pub const fn with_permissions(self, perms: Permissions) -> Self {
        self.with_readable(perms.contains(Permissions::READ))
            .with_writable(perms.contains(Permissions::WRITE))
            .with_executable(perms.contains(Permissions::EXECUTE))
    }

    #[inline]
    #[must_use]
    pub const fn permissions(&self) -> Permissions {
        let mut p = Permissions::empty();
        if self.readable() {
            p = p.union(Permissions::READ);
        }
        if self.writable() {
            p = p.union(Permissions::WRITE);
        }
        if self.executable() {
            p = p.union(Permissions::EXECUTE);
        }
        p
    }

    /// The frame backing this page, if resident.
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> Option<FrameNumber> {
        if self.present() {
            Some(FrameNumber::new(self.target()))
        } else {
            None
        }
    }

    /// The swap slot holding this page, if swapped out.
    #[inline]
    #[must_use]
    pub const fn swap_slot(&self) -> Option<SwapSlot> {
        if !self.present() && self.swapped() {
            Some(SwapSlot::new(self.target()))
        } else {
            None
        }
    }

    /// `true` if the page has never been given content.
    #[inline]
    #[must_use]
    pub const fn is_zero_fill(&self) -> bool {
        !self.present() && !self.swapped()
    }

    /// Rebind to a frame; clears `swapped`, `accessed` and `dirty`.
    #[inline]
    #[must_use]
    pub const fn mapped_to(self, frame: FrameNumber) -> Self {
        self.with_present(true)
            .with_swapped(false)
            .with_accessed(false)
            .with_dirty(false)
            .with_target(frame.as_u64())
    }

    /// Move a resident page to another frame, keeping every flag.
    #[inline]
    #[must_use]
    pub const fn relocated_to(self, frame: FrameNumber) -> Self {
        self.with_target(frame.as_u64())
    }

    /// Mark as swapped out to `slot`.
    #[inline]
    #[must_use]
    pub const fn swapped_to(self, slot: SwapSlot) -> Self {
        self.with_present(false)
            .with_swapped(true)
            .with_accessed(false)
            .with_dirty(false)
            .with_target(slot.as_u64())
    }

    /// Revert to zero-fill on demand, keeping permissions and sharing flags.
    #[inline]
    #[must_use]
    pub const fn evicted_clean(self) -> Self {
        self.with_present(false)
            .with_swapped(false)
            .with_accessed(false)
            .with_dirty(false)
            .with_target(0)
    }
}

/// A [`PageEntry`] that can be updated through a shared reference.
///
/// Translation runs under a read lock but still has to record `accessed` and
/// `dirty`; those two bits are set with a single `fetch_or`. Structural changes
/// (remapping, eviction) go through [`store`](Self::store) under the write lock.
#[repr(transparent)]
pub struct AtomicPageEntry(AtomicU64);

impl AtomicPageEntry {
    #[inline]
    #[must_use]
    pub const fn new(e: PageEntry) -> Self {
        Self(AtomicU64::new(e.into_bits()))
    }

    #[inline]
    #[must_use]
    pub fn load(&self) -> PageEntry {
        PageEntry::from_bits(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, e: PageEntry) {
        self.0.store(e.into_bits(), Ordering::Release);
    }

    /// Record an access, returning the entry as it was before.
    #[inline]
    pub fn touch(&self, write: bool) -> PageEntry {
        let mut bits = PageEntry::new().with_accessed(true);
        if write {
            bits.set_dirty(true);
        }
        PageEntry::from_bits(self.0.fetch_or(bits.into_bits(), Ordering::AcqRel))
    }
}

impl Clone for AtomicPageEntry {
    fn clone(&self) -> Self {
        Self::new(self.load())
    }
}

impl core::fmt::Debug for AtomicPageEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&self.load(), f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resident_entry_reports_frame() {
        let e = PageEntry::resident(FrameNumber::new(42), Permissions::READ);
        assert_eq!(e.frame(), Some(FrameNumber::new(42)));
        assert_eq!(e.swap_slot(), None);
        assert!(!e.writable());
        assert!(!e.is_zero_fill());
    }

    #[test]
    fn swap_and_reload_keep_permissions() {
        let rw = Permissions::READ | Permissions::WRITE;
        let e = PageEntry::resident(FrameNumber::new(3), rw).with_dirty(true);
        let out = e.swapped_to(SwapSlot::new(9));
        assert_eq!(out.swap_slot(), Some(SwapSlot::new(9)));
        assert_eq!(out.frame(), None);
        assert!(!out.dirty());
        assert_eq!(out.permissions(), rw);

        let back = out.mapped_to(FrameNumber::new(11));
        assert_eq!(back.frame(), Some(FrameNumber::new(11)));
        assert!(!back.swapped());
        assert_eq!(back.permissions(), rw);
    }

    #[test]
    fn touch_sets_accessed_and_dirty() {
        let a = AtomicPageEntry::new(PageEntry::resident(
            FrameNumber::new(1),
            Permissions::READ | Permissions::WRITE,
        ));
        let before = a.touch(false);
        assert!(!before.accessed());
        assert!(a.load().accessed());
        assert!(!a.load().dirty());
        a.touch(true);
        assert!(a.load().dirty());
    }

    #[test]
    fn relocation_keeps_dirty() {
        let e = PageEntry::resident(FrameNumber::new(2), Permissions::RW).with_dirty(true);
        let moved = e.relocated_to(FrameNumber::new(0));
        assert_eq!(moved.frame(), Some(FrameNumber::new(0)));
        assert!(moved.dirty());
    }

    #[test]
    fn zero_fill_is_neither_present_nor_swapped() {
        let e = PageEntry::zero_fill(Permissions::READ);
        assert!(e.is_zero_fill());
        assert_eq!(e.frame(), None);
        assert_eq!(e.swap_slot(), None);
        let again = PageEntry::resident(FrameNumber::new(5), Permissions::READ).evicted_clean();
        assert!(again.is_zero_fill());
    }
}
