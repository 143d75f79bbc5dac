use core::fmt;

/// Page geometry shared by virtual pages and physical frames.
///
/// Unlike hardware paging, the simulated MMU picks its page size at system
/// initialization, so the size is a runtime value instead of a marker type.
/// It is always a power of two between [`PageSize::MIN`] and [`PageSize::MAX`].
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let ps = PageSize::new(4096).unwrap();
/// assert_eq!(ps.shift(), 12);
/// assert_eq!(ps.pages_for(10_000), 3);
/// assert_eq!(ps.align_down(0x1234), 0x1000);
/// assert!(PageSize::new(3000).is_none());
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageSize {
    /// log2(size), i.e., number of low bits used for the offset.
    shift: u32,
}

impl PageSize {
    /// 512 bytes, the smallest supported page.
    pub const MIN: Self = Self { shift: 9 };
    /// 1 GiB, the largest supported page.
    pub const MAX: Self = Self { shift: 30 };
    /// 4 KiB pages (the default).
    pub const SIZE_4K: Self = Self { shift: 12 };

    /// Build from a byte count; `None` unless it is a power of two in range.
    #[inline]
    #[must_use]
    pub const fn new(bytes: u64) -> Option<Self> {
        if !bytes.is_power_of_two() {
            return None;
        }
        Self::from_shift(bytes.trailing_zeros())
    }

    /// Build from the number of offset bits.
    #[inline]
    #[must_use]
    pub const fn from_shift(shift: u32) -> Option<Self> {
        if shift < Self::MIN.shift || shift > Self::MAX.shift {
            return None;
        }
        Some(Self { shift })
    }

    /// Page size in bytes.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        1 << self.shift
    }

    /// Page size in bytes, for sizing buffers.
    #[inline]
    #[must_use]
    pub const fn bytes_usize(self) -> usize {
        1 << self.shift
    }

    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        self.shift
    }

    /// Mask selecting the in-page offset bits.
    #[inline]
    #[must_use]
    pub const fn mask(self) -> u64 {
        self.bytes() - 1
    }

    /// Number of pages needed to hold `len` bytes (rounded up).
    #[inline]
    #[must_use]
    pub const fn pages_for(self, len: u64) -> u64 {
        (len >> self.shift) + ((len & self.mask() != 0) as u64)
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, value: u64) -> u64 {
        value & !self.mask()
    }

    /// Round up to the next page boundary, `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn align_up(self, value: u64) -> Option<u64> {
        match value.checked_add(self.mask()) {
            Some(v) => Some(v & !self.mask()),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, value: u64) -> bool {
        value & self.mask() == 0
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self::SIZE_4K
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.shift {
            30 => f.write_str("1G"),
            20..30 => write!(f, "{}M", 1u64 << (self.shift - 20)),
            10..20 => write!(f, "{}K", 1u64 << (self.shift - 10)),
            _ => write!(f, "{}B", self.bytes()),
        }
    }
}

impl fmt::Debug for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PageSize({self})")
    }
}
