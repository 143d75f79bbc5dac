use crate::{PageOffset, PageSize, VirtualAddress};
use core::fmt;
use core::ops::Add;

/// Virtual page number.
///
/// A `PageNumber` identifies one page of a process's virtual address space,
/// i.e. the virtual address shifted right by the page shift. Page-table entries
/// and TLB entries are keyed by it.
///
/// ### Semantics
/// - `base(ps)` returns the first [`VirtualAddress`] of the page.
/// - `join(off, ps)` combines the page with a [`PageOffset`].
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let ps = PageSize::SIZE_4K;
/// let page = PageNumber::containing(VirtualAddress::new(0x5fff), ps);
/// assert_eq!(page.base(ps).as_u64(), 0x5000);
/// assert_eq!(page.next().base(ps).as_u64(), 0x6000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageNumber(u64);

impl PageNumber {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// Page that contains `addr`.
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress, ps: PageSize) -> Self {
        addr.page(ps)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn base(self, ps: PageSize) -> VirtualAddress {
        VirtualAddress::new(self.0 << ps.shift())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: PageOffset, ps: PageSize) -> VirtualAddress {
        VirtualAddress::new((self.0 << ps.shift()) | off.as_u64())
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Add<u64> for PageNumber {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page#{:#x}", self.0)
    }
}

impl fmt::Debug for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageNumber({:#x})", self.0)
    }
}
