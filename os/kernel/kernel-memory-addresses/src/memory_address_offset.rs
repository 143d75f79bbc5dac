use crate::PageSize;
use core::fmt;

/// The offset within a page (`0..page_size`).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageOffset(u64);

impl PageOffset {
    /// Create from a raw value, asserting it is below the page size in debug.
    #[inline]
    #[must_use]
    pub const fn new(value: u64, ps: PageSize) -> Self {
        debug_assert!(value < ps.bytes(), "offset must be < page size");
        Self(value & ps.mask())
    }

    /// Wrap an already-masked value.
    #[inline]
    #[must_use]
    pub(crate) const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The offset as a buffer index.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_usize(self) -> usize {
        // offsets are bounded by PageSize::MAX, which fits any usize we target
        self.0 as usize
    }
}

impl fmt::Debug for PageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offset({:#X})", self.0)
    }
}

impl fmt::Display for PageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:#X}", self.0)
    }
}
