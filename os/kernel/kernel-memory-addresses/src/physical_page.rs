use crate::{PageOffset, PageSize, PhysicalAddress};
use core::fmt;
use core::ops::Add;

/// Physical frame number.
///
/// A `FrameNumber` indexes one fixed-size frame of the physical store. The
/// frame table, allocator ledger, and page-table entries refer to frames by
/// number and never own the memory behind them.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let ps = PageSize::SIZE_4K;
/// let f = FrameNumber::new(2);
/// assert_eq!(f.base(ps), PhysicalAddress::new(0x2000));
/// assert_eq!(f.join(PageOffset::new(0x10, ps), ps).as_u64(), 0x2010);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameNumber(u64);

impl FrameNumber {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// Frame number from a table index.
    #[inline]
    #[must_use]
    pub const fn from_index(i: usize) -> Self {
        Self(i as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The frame number as a table index.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn base(self, ps: PageSize) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << ps.shift())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: PageOffset, ps: PageSize) -> PhysicalAddress {
        PhysicalAddress::new((self.0 << ps.shift()) | off.as_u64())
    }
}

impl Add<u64> for FrameNumber {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({})", self.0)
    }
}
