//! Simulated RAM.
//!
//! The store is split into page-sized frames, each behind its own
//! [`RwLock`], so transfers touching different frames never contend. Every
//! access is bounds checked against the arena size.

use kernel_memory_addresses::{FrameNumber, PageSize, PhysicalAddress};
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("access of {len} bytes at {address} exceeds physical memory of {size} bytes")]
    OutOfBounds {
        address: PhysicalAddress,
        len: usize,
        size: u64,
    },
    #[error("{0} does not exist")]
    InvalidFrame(FrameNumber),
}

/// A fixed-size byte arena representing physical memory.
#[derive(Debug)]
pub struct PhysicalStore {
    page_size: PageSize,
    frames: Box<[RwLock<Box<[u8]>>]>,
}

impl PhysicalStore {
    /// A zeroed store of `frame_count` frames.
    #[must_use]
    pub fn new(frame_count: usize, page_size: PageSize) -> Self {
        let frames = (0..frame_count)
            .map(|_| RwLock::new(vec![0u8; page_size.bytes_usize()].into_boxed_slice()))
            .collect();
        Self { page_size, frames }
    }

    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> PageSize {
        self.page_size
    }

    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Total size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.frames.len() as u64 * self.page_size.bytes()
    }

    fn frame(&self, frame: FrameNumber) -> Result<&RwLock<Box<[u8]>>, StoreError> {
        self.frames
            .get(frame.as_usize())
            .ok_or(StoreError::InvalidFrame(frame))
    }

    fn check(&self, address: PhysicalAddress, len: usize) -> Result<(), StoreError> {
        let end = address.as_u64().checked_add(len as u64);
        match end {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(StoreError::OutOfBounds {
                address,
                len,
                size: self.size(),
            }),
        }
    }

    /// Walk `[address, address + len)` frame by frame.
    fn for_each_chunk(
        &self,
        address: PhysicalAddress,
        len: usize,
        mut f: impl FnMut(&RwLock<Box<[u8]>>, usize, core::ops::Range<usize>),
    ) -> Result<(), StoreError> {
        self.check(address, len)?;
        let ps = self.page_size.bytes_usize();
        let mut done = 0;
        while done < len {
            let at = address + done as u64;
            let (frame, offset) = at.split(self.page_size);
            let offset = offset.as_usize();
            let n = (ps - offset).min(len - done);
            f(self.frame(frame)?, offset, done..done + n);
            done += n;
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes starting at `address` into `buf`.
    ///
    /// # Errors
    /// [`StoreError::OutOfBounds`] if the range leaves the arena.
    pub fn read(&self, address: PhysicalAddress, buf: &mut [u8]) -> Result<(), StoreError> {
        let len = buf.len();
        self.for_each_chunk(address, len, |frame, offset, range| {
            let n = range.len();
            buf[range].copy_from_slice(&frame.read()[offset..offset + n]);
        })
    }

    /// Copy `data` into the store starting at `address`.
    ///
    /// # Errors
    /// [`StoreError::OutOfBounds`] if the range leaves the arena.
    pub fn write(&self, address: PhysicalAddress, data: &[u8]) -> Result<(), StoreError> {
        self.for_each_chunk(address, data.len(), |frame, offset, range| {
            let n = range.len();
            frame.write()[offset..offset + n].copy_from_slice(&data[range]);
        })
    }

    /// Set `len` bytes starting at `address` to `value`.
    ///
    /// # Errors
    /// [`StoreError::OutOfBounds`] if the range leaves the arena.
    pub fn fill(&self, address: PhysicalAddress, len: usize, value: u8) -> Result<(), StoreError> {
        self.for_each_chunk(address, len, |frame, offset, range| {
            frame.write()[offset..offset + range.len()].fill(value);
        })
    }

    /// Copy `len` bytes from `src` to `dst`. Overlapping ranges behave like `memmove`.
    ///
    /// # Errors
    /// [`StoreError::OutOfBounds`] if either range leaves the arena.
    pub fn copy(&self, src: PhysicalAddress, dst: PhysicalAddress, len: usize) -> Result<(), StoreError> {
        self.check(dst, len)?;
        let mut tmp = vec![0u8; len];
        self.read(src, &mut tmp)?;
        self.write(dst, &tmp)
    }

    /// Read within one frame.
    ///
    /// # Errors
    /// The frame does not exist or the range leaves the frame.
    pub fn read_frame(&self, frame: FrameNumber, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        self.read(self.frame_address(frame, offset, buf.len())?, buf)
    }

    /// Write within one frame.
    ///
    /// # Errors
    /// The frame does not exist or the range leaves the frame.
    pub fn write_frame(&self, frame: FrameNumber, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        self.write(self.frame_address(frame, offset, data.len())?, data)
    }

    fn frame_address(&self, frame: FrameNumber, offset: usize, len: usize) -> Result<PhysicalAddress, StoreError> {
        self.frame(frame)?;
        let base = frame.base(self.page_size);
        if offset.checked_add(len).is_none_or(|end| end > self.page_size.bytes_usize()) {
            return Err(StoreError::OutOfBounds {
                address: base + offset as u64,
                len,
                size: self.size(),
            });
        }
        Ok(base + offset as u64)
    }

    /// Snapshot of a whole frame.
    ///
    /// # Errors
    /// [`StoreError::InvalidFrame`] if the frame does not exist.
    pub fn frame_bytes(&self, frame: FrameNumber) -> Result<Vec<u8>, StoreError> {
        Ok(self.frame(frame)?.read().to_vec())
    }

    /// Zero a whole frame.
    ///
    /// # Errors
    /// [`StoreError::InvalidFrame`] if the frame does not exist.
    pub fn zero_frame(&self, frame: FrameNumber) -> Result<(), StoreError> {
        self.frame(frame)?.write().fill(0);
        Ok(())
    }

    /// Copy frame `src` over frame `dst`.
    ///
    /// # Errors
    /// [`StoreError::InvalidFrame`] if either frame does not exist.
    pub fn copy_frame(&self, src: FrameNumber, dst: FrameNumber) -> Result<(), StoreError> {
        if src == dst {
            return self.frame(src).map(|_| ());
        }
        let bytes = self.frame_bytes(src)?;
        self.frame(dst)?.write().copy_from_slice(&bytes);
        Ok(())
    }

    /// Whether every byte of the frame is zero.
    ///
    /// # Errors
    /// [`StoreError::InvalidFrame`] if the frame does not exist.
    pub fn is_zero(&self, frame: FrameNumber) -> Result<bool, StoreError> {
        Ok(self.frame(frame)?.read().iter().all(|b| *b == 0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> PhysicalStore {
        PhysicalStore::new(4, PageSize::new(512).unwrap())
    }

    #[test]
    fn read_write_across_frames() {
        let s = store();
        let data: Vec<u8> = (0..=255).cycle().take(700).collect();
        s.write(PhysicalAddress::new(300), &data).unwrap();
        let mut back = vec![0; 700];
        s.read(PhysicalAddress::new(300), &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(s.frame_bytes(FrameNumber::new(1)).unwrap()[0], data[212]);
    }

    #[test]
    fn bounds_are_enforced() {
        let s = store();
        assert_eq!(s.size(), 2048);
        let mut buf = [0u8; 2];
        assert!(matches!(
            s.read(PhysicalAddress::new(2047), &mut buf),
            Err(StoreError::OutOfBounds { .. })
        ));
        assert!(s.write(PhysicalAddress::new(u64::MAX), &[1]).is_err());
        assert!(s.write_frame(FrameNumber::new(0), 511, &[1, 2]).is_err());
        assert_eq!(
            s.zero_frame(FrameNumber::new(4)),
            Err(StoreError::InvalidFrame(FrameNumber::new(4)))
        );
    }

    #[test]
    fn frame_helpers() {
        let s = store();
        s.fill(FrameNumber::new(2).base(s.page_size()), 512, 0x5a).unwrap();
        assert!(!s.is_zero(FrameNumber::new(2)).unwrap());
        s.copy_frame(FrameNumber::new(2), FrameNumber::new(3)).unwrap();
        assert!(s.frame_bytes(FrameNumber::new(3)).unwrap().iter().all(|b| *b == 0x5a));
        s.zero_frame(FrameNumber::new(2)).unwrap();
        assert!(s.is_zero(FrameNumber::new(2)).unwrap());
    }

    #[test]
    fn overlapping_copy() {
        let s = store();
        s.write(PhysicalAddress::new(0), &[1, 2, 3, 4]).unwrap();
        s.copy(PhysicalAddress::new(0), PhysicalAddress::new(2), 4).unwrap();
        let mut out = [0u8; 6];
        s.read(PhysicalAddress::new(0), &mut out).unwrap();
        assert_eq!(out, [1, 2, 1, 2, 3, 4]);
    }
}
