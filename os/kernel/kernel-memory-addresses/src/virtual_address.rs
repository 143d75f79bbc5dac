use crate::{MemoryAddress, PageNumber, PageOffset, PageSize};
use core::fmt;
use core::ops::{Add, AddAssign};

/// Virtual memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes **virtual** addresses
/// of a simulated process. It carries the *kind* of address at the type level
/// so you don't accidentally mix virtual and physical values.
///
/// ### Semantics
/// - Use [`VirtualAddress::page`] / [`VirtualAddress::offset`] / [`VirtualAddress::split`]
///   to derive the page number and the in-page offset for a [`PageSize`].
/// - Combine a [`PageNumber`] and a [`PageOffset`] with [`PageNumber::join`]
///   to reconstruct a `VirtualAddress`.
///
/// ### Invariants
/// - `offset < page size` for every split, by construction.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let ps = PageSize::SIZE_4K;
/// let va = VirtualAddress::new(0x0040_1234);
/// let (page, off) = va.split(ps);
/// assert_eq!(page.as_u64(), 0x401);
/// assert_eq!(off.as_u64(), 0x234);
/// assert_eq!(page.join(off, ps), va);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(pub(crate) MemoryAddress);

impl VirtualAddress {
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

    #[inline]
    #[must_use]
    pub const fn page(self, ps: PageSize) -> PageNumber {
        PageNumber::new(self.0.index(ps))
    }

    #[inline]
    #[must_use]
    pub const fn offset(self, ps: PageSize) -> PageOffset {
        self.0.offset(ps)
    }

    #[inline]
    #[must_use]
    pub const fn split(self, ps: PageSize) -> (PageNumber, PageOffset) {
        (self.page(ps), self.offset(ps))
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, ps: PageSize) -> Self {
        Self(self.0.align_down(ps))
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

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
