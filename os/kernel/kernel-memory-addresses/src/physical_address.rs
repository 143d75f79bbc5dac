use crate::{FrameNumber, MemoryAddress, PageOffset, PageSize};
use core::fmt;
use core::ops::{Add, AddAssign};

/// Physical memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes a byte position in the
/// simulated physical store. Like [`VirtualAddress`](super::VirtualAddress),
/// this type carries intent and prevents accidental VA/PA mix-ups.
///
/// ### Semantics
/// - A physical address is `frame_number * page_size + offset`.
/// - Use [`PhysicalAddress::split`] to recover the [`FrameNumber`] and
///   [`PageOffset`], and [`FrameNumber::join`] for the inverse.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let ps = PageSize::SIZE_4K;
/// let pa = PhysicalAddress::new(0x3042);
/// let (frame, off) = pa.split(ps);
/// assert_eq!(frame, FrameNumber::new(3));
/// assert_eq!(frame.join(off, ps), pa);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(pub(crate) MemoryAddress);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(MemoryAddress::new(v))
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    /// The address as an index into a byte arena.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_usize(self) -> usize {
        self.0.as_u64() as usize
    }

    #[inline]
    #[must_use]
    pub const fn frame(self, ps: PageSize) -> FrameNumber {
        FrameNumber::new(self.0.index(ps))
    }

    #[inline]
    #[must_use]
    pub const fn offset(self, ps: PageSize) -> PageOffset {
        self.0.offset(ps)
    }

    #[inline]
    #[must_use]
    pub const fn split(self, ps: PageSize) -> (FrameNumber, PageOffset) {
        (self.frame(ps), self.offset(ps))
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
