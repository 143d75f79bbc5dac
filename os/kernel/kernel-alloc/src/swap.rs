//! # Swap
//!
//! Page-sized slots in a backing store, each owned by at most one
//! `(pid, page)`. Slot contents are raw page bytes with no header.
//!
//! ```text
//!  slot:    0        1        2        3
//!         ┌────────┬────────┬────────┬────────┐
//!  store  │ page A │  free  │ page B │  free  │   offset = slot * page_size
//!         └────────┴────────┴────────┴────────┘
//! ```
//!
//! A slot stays allocated after its page is swapped back in, so a clean page
//! can later be evicted again without rewriting it. The slot is released when
//! the page is unmapped or its process exits.

use kernel_info::Pid;
use kernel_memory_addresses::{PageNumber, PageSize};
use kernel_vmem::SwapSlot;
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("swap space exhausted")]
    Exhausted,
    #[error("{0} is not an allocated swap slot")]
    InvalidSlot(SwapSlot),
    #[error("buffer of {len} bytes does not match the page size {page_size}")]
    BadLength { len: usize, page_size: u64 },
    #[error("swap I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Raw block storage behind the swap manager.
pub trait SwapBackend: Send + Sync {
    /// Read the block at byte `offset` into `buf`.
    ///
    /// # Errors
    /// Any I/O failure of the backing medium.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `data` at byte `offset`.
    ///
    /// # Errors
    /// Any I/O failure of the backing medium.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Capacity in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Swap kept in a heap buffer.
#[derive(Debug)]
pub struct MemorySwap {
    data: Vec<u8>,
}

impl MemorySwap {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(size: u64) -> Self {
        Self {
            data: vec![0; size as usize],
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn range(&self, offset: u64, len: usize) -> io::Result<core::ops::Range<usize>> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "swap access beyond end of backing buffer",
            )),
        }
    }
}

impl SwapBackend for MemorySwap {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let r = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[r]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let r = self.range(offset, data.len())?;
        self.data[r].copy_from_slice(data);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Swap kept in a file, created or truncated at open.
#[derive(Debug)]
pub struct FileSwap {
    file: File,
    size: u64,
}

impl FileSwap {
    /// # Errors
    /// The file cannot be created or resized.
    pub fn create(path: &Path, size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        log::info!("swap file {} ({size} bytes)", path.display());
        Ok(Self { file, size })
    }
}

impl SwapBackend for FileSwap {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn len(&self) -> u64 {
        self.size
    }
}

/// Allocates swap slots and moves page contents in and out of them.
pub struct SwapManager {
    backend: Box<dyn SwapBackend>,
    page_size: PageSize,
    owners: Vec<Option<(Pid, PageNumber)>>,
    index: HashMap<(Pid, PageNumber), SwapSlot>,
    free: BTreeSet<u64>,
}

impl core::fmt::Debug for SwapManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SwapManager")
            .field("page_size", &self.page_size)
            .field("slots", &self.owners.len())
            .field("used", &self.index.len())
            .finish_non_exhaustive()
    }
}

impl SwapManager {
    /// Slots are `backend.len() / page_size`, lowest first.
    #[must_use]
    pub fn new(backend: Box<dyn SwapBackend>, page_size: PageSize) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let slots = (backend.len() / page_size.bytes()) as usize;
        Self {
            backend,
            page_size,
            owners: vec![None; slots],
            index: HashMap::new(),
            free: (0..slots as u64).collect(),
        }
    }

    /// Heap-backed swap of `size` bytes.
    #[must_use]
    pub fn in_memory(size: u64, page_size: PageSize) -> Self {
        Self::new(Box::new(MemorySwap::new(size)), page_size)
    }

    #[must_use]
    pub fn total_slots(&self) -> usize {
        self.owners.len()
    }

    #[must_use]
    pub fn used_slots(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Reserve a slot for `(pid, page)`, or return the one it already holds.
    ///
    /// # Errors
    /// [`SwapError::Exhausted`] if every slot is taken.
    pub fn allocate_swap_area(&mut self, pid: Pid, page: PageNumber) -> Result<SwapSlot, SwapError> {
        if let Some(slot) = self.index.get(&(pid, page)) {
            return Ok(*slot);
        }
        let raw = self.free.pop_first().ok_or(SwapError::Exhausted)?;
        let slot = SwapSlot::new(raw);
        self.owners[slot.as_usize()] = Some((pid, page));
        self.index.insert((pid, page), slot);
        Ok(slot)
    }

    /// The slot held by `(pid, page)`.
    #[must_use]
    pub fn slot_of(&self, pid: Pid, page: PageNumber) -> Option<SwapSlot> {
        self.index.get(&(pid, page)).copied()
    }

    #[must_use]
    pub fn owner(&self, slot: SwapSlot) -> Option<(Pid, PageNumber)> {
        self.owners.get(slot.as_usize()).copied().flatten()
    }

    fn checked(&self, slot: SwapSlot, len: usize) -> Result<u64, SwapError> {
        if self.owner(slot).is_none() {
            return Err(SwapError::InvalidSlot(slot));
        }
        if len as u64 != self.page_size.bytes() {
            return Err(SwapError::BadLength {
                len,
                page_size: self.page_size.bytes(),
            });
        }
        Ok(slot.as_u64() * self.page_size.bytes())
    }

    /// Write one page to an allocated slot.
    ///
    /// # Errors
    /// Unallocated slot, wrong buffer length, or backend I/O failure.
    pub fn write(&mut self, slot: SwapSlot, data: &[u8]) -> Result<(), SwapError> {
        let offset = self.checked(slot, data.len())?;
        self.backend.write_at(offset, data)?;
        log::debug!("swap out -> {slot}");
        Ok(())
    }

    /// Read one page from an allocated slot.
    ///
    /// # Errors
    /// Unallocated slot, wrong buffer length, or backend I/O failure.
    pub fn read(&mut self, slot: SwapSlot, buf: &mut [u8]) -> Result<(), SwapError> {
        let offset = self.checked(slot, buf.len())?;
        self.backend.read_at(offset, buf)?;
        log::debug!("swap in <- {slot}");
        Ok(())
    }

    /// Release a slot. Returns `false` if it was not allocated.
    pub fn free(&mut self, slot: SwapSlot) -> bool {
        let Some(owner) = self.owners.get_mut(slot.as_usize()).and_then(Option::take) else {
            return false;
        };
        self.index.remove(&owner);
        self.free.insert(slot.as_u64());
        true
    }

    /// Release the slot held by `(pid, page)`, if any.
    pub fn free_page(&mut self, pid: Pid, page: PageNumber) -> bool {
        self.slot_of(pid, page).is_some_and(|s| self.free(s))
    }

    /// Release every slot of `pid`. Returns how many were released.
    pub fn free_process(&mut self, pid: Pid) -> usize {
        let slots: Vec<SwapSlot> = self
            .index
            .iter()
            .filter(|((p, _), _)| *p == pid)
            .map(|(_, s)| *s)
            .collect();
        slots.into_iter().filter(|s| self.free(*s)).count()
    }

    /// Every allocated slot with its owner.
    #[must_use]
    pub fn allocated(&self) -> Vec<(SwapSlot, Pid, PageNumber)> {
        self.index
            .iter()
            .map(|(&(pid, page), &slot)| (slot, pid, page))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PS: usize = 512;

    fn swap(slots: u64) -> SwapManager {
        SwapManager::in_memory(slots * PS as u64, PageSize::new(PS as u64).unwrap())
    }

    #[test]
    fn round_trips_a_page() {
        let mut s = swap(4);
        let pid = Pid::new(1);
        let slot = s.allocate_swap_area(pid, PageNumber::new(7)).unwrap();
        s.write(slot, &[0x42; PS]).unwrap();
        let mut buf = [0u8; PS];
        s.read(slot, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0x42));
        assert_eq!(s.slot_of(pid, PageNumber::new(7)), Some(slot));
        assert_eq!(s.owner(slot), Some((pid, PageNumber::new(7))));
    }

    #[test]
    fn exhaustion_and_reuse() {
        let mut s = swap(2);
        let pid = Pid::new(1);
        let a = s.allocate_swap_area(pid, PageNumber::new(1)).unwrap();
        let again = s.allocate_swap_area(pid, PageNumber::new(1)).unwrap();
        assert_eq!(a, again);
        s.allocate_swap_area(pid, PageNumber::new(2)).unwrap();
        assert!(matches!(
            s.allocate_swap_area(pid, PageNumber::new(3)),
            Err(SwapError::Exhausted)
        ));
        assert!(s.free(a));
        assert!(!s.free(a));
        assert_eq!(s.allocate_swap_area(pid, PageNumber::new(3)).unwrap(), a);
    }

    #[test]
    fn rejects_unallocated_slots_and_bad_lengths() {
        let mut s = swap(2);
        let mut buf = [0u8; PS];
        assert!(matches!(
            s.read(SwapSlot::new(0), &mut buf),
            Err(SwapError::InvalidSlot(_))
        ));
        let slot = s.allocate_swap_area(Pid::new(1), PageNumber::new(0)).unwrap();
        assert!(matches!(
            s.write(slot, &[0u8; 10]),
            Err(SwapError::BadLength { .. })
        ));
    }

    #[test]
    fn free_process_releases_only_that_pid() {
        let mut s = swap(4);
        for p in 0..2 {
            s.allocate_swap_area(Pid::new(1), PageNumber::new(p)).unwrap();
        }
        s.allocate_swap_area(Pid::new(2), PageNumber::new(0)).unwrap();
        assert_eq!(s.free_process(Pid::new(1)), 2);
        assert_eq!(s.used_slots(), 1);
        assert!(s.free_page(Pid::new(2), PageNumber::new(0)));
        assert_eq!(s.free_slots(), 4);
    }
}
