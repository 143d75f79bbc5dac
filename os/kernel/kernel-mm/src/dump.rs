//! # Memory Dumps
//!
//! A dump is a flat little-endian stream: one [`DumpHeader`], then for every
//! region a fixed record followed by the region's page contents.
//!
//! ```text
//! ┌──────────── header (24 bytes) ────────────┐
//! │ magic u64 │ version u32 │ page_size u64 │ regions u32 │
//! ├──────────── region record (29 bytes) ─────┤
//! │ pid u32 │ start u64 │ size u64 │ pages u64 │ perms u8 │
//! ├──────────── pages × page_size bytes ──────┤
//! │ resident, swapped or zero-fill contents   │
//! └───────────────────────────────────────────┘
//! ```
//!
//! Shared regions are written with the contents they see and come back as
//! private regions.

use crate::error::MemoryError;
use crate::state::VmState;
use kernel_info::Pid;
use kernel_info::memory::USER_SPACE_END;
use kernel_memory_addresses::{PageNumber, VirtualAddress};
use kernel_vmem::{AddressSpace, Permissions, Region, RegionKind};
use std::io::{self, Read, Write};

/// Magic signature of a dump file; the ASCII bytes `"VMEMDUMP"` read as little endian.
pub const DUMP_MAGIC: u64 = u64::from_le_bytes(*b"VMEMDUMP");

/// Current dump layout version.
pub const DUMP_VERSION: u32 = 1;

/// Fixed-size header at the start of every dump.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DumpHeader {
    pub magic: u64,
    pub version: u32,
    pub page_size: u64,
    pub regions: u32,
}

impl DumpHeader {
    fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&self.magic.to_le_bytes())?;
        w.write_all(&self.version.to_le_bytes())?;
        w.write_all(&self.page_size.to_le_bytes())?;
        w.write_all(&self.regions.to_le_bytes())
    }

    fn read_from(r: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            magic: read_u64(r)?,
            version: read_u32(r)?,
            page_size: read_u64(r)?,
            regions: read_u32(r)?,
        })
    }
}

/// What a dump contained or produced.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DumpSummary {
    pub regions: usize,
    pub pages: u64,
    pub bytes: u64,
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn invalid(msg: &'static str) -> MemoryError {
    io::Error::new(io::ErrorKind::InvalidData, msg).into()
}

impl VmState {
    /// The contents of one page as a process would read them.
    fn page_contents(&mut self, pid: Pid, page: PageNumber, buf: &mut [u8]) -> Result<(), MemoryError> {
        buf.fill(0);
        let Some(entry) = self.entry(pid, page) else {
            return Ok(());
        };
        if let Some(frame) = entry.frame() {
            self.cache.read(frame, 0, buf)?;
        } else if let Some(slot) = entry.swap_slot() {
            self.swap.read(slot, buf)?;
        }
        Ok(())
    }

    pub fn write_dump(&mut self, w: &mut impl Write) -> Result<DumpSummary, MemoryError> {
        let ps = self.page_size;
        let regions: Vec<(Pid, Region)> = self
            .spaces
            .iter()
            .flat_map(|(pid, s)| s.regions().map(move |r| (*pid, *r)))
            .collect();
        let count = u32::try_from(regions.len()).map_err(|_| invalid("too many regions"))?;
        DumpHeader {
            magic: DUMP_MAGIC,
            version: DUMP_VERSION,
            page_size: ps.bytes(),
            regions: count,
        }
        .write_to(w)?;

        let mut summary = DumpSummary::default();
        let mut buf = vec![0u8; ps.bytes_usize()];
        for (pid, region) in &regions {
            w.write_all(&pid.as_u32().to_le_bytes())?;
            w.write_all(&region.start.as_u64().to_le_bytes())?;
            w.write_all(&region.size.to_le_bytes())?;
            w.write_all(&region.pages.to_le_bytes())?;
            w.write_all(&[region.permissions.bits()])?;
            for page in region.page_numbers(ps) {
                self.page_contents(*pid, page, &mut buf)?;
                w.write_all(&buf)?;
            }
            summary.regions += 1;
            summary.pages += region.pages;
            summary.bytes += region.pages * ps.bytes();
        }
        w.flush()?;
        log::info!(
            "dumped {} regions ({} pages)",
            summary.regions,
            summary.pages
        );
        Ok(summary)
    }

    /// Recreate the regions of a dump as private mappings at their original addresses.
    pub fn load_dump(&mut self, r: &mut impl Read) -> Result<DumpSummary, MemoryError> {
        let ps = self.page_size;
        let header = DumpHeader::read_from(r)?;
        if header.magic != DUMP_MAGIC {
            return Err(invalid("not a memory dump"));
        }
        if header.version != DUMP_VERSION {
            return Err(invalid("unsupported dump version"));
        }
        if header.page_size != ps.bytes() {
            return Err(invalid("dump page size does not match"));
        }

        let mut summary = DumpSummary::default();
        let mut buf = vec![0u8; ps.bytes_usize()];
        for _ in 0..header.regions {
            let pid = Pid::new(read_u32(r)?);
            let start = VirtualAddress::new(read_u64(r)?);
            let size = read_u64(r)?;
            let pages = read_u64(r)?;
            let mut perms = [0u8; 1];
            r.read_exact(&mut perms)?;
            let permissions =
                Permissions::from_bits(perms[0]).ok_or_else(|| invalid("bad permission bits"))?;
            if pages != ps.pages_for(size) {
                return Err(invalid("region size does not match its page count"));
            }

            self.check_commit(size)?;
            let base = self.config.user_space_base;
            self.spaces
                .entry(pid)
                .or_insert_with(|| AddressSpace::new(pid, ps, base, USER_SPACE_END))
                .insert_region(Region {
                    start,
                    size,
                    pages,
                    permissions,
                    kind: RegionKind::Private,
                })?;
            self.protection
                .set_access_control(pid, start, pages * ps.bytes(), permissions);

            for page in start.page(ps).as_u64()..start.page(ps).as_u64() + pages {
                r.read_exact(&mut buf)?;
                if buf.iter().any(|b| *b != 0) {
                    self.populate(pid, PageNumber::new(page), &buf)?;
                }
            }
            summary.regions += 1;
            summary.pages += pages;
            summary.bytes += pages * ps.bytes();
        }
        log::info!(
            "loaded {} regions ({} pages) from dump",
            summary.regions,
            summary.pages
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_stable() {
        let h = DumpHeader {
            magic: DUMP_MAGIC,
            version: DUMP_VERSION,
            page_size: 4096,
            regions: 3,
        };
        let mut bytes = Vec::new();
        h.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[..8], b"VMEMDUMP");
        assert_eq!(DumpHeader::read_from(&mut bytes.as_slice()).unwrap(), h);
    }

    #[test]
    fn truncated_header_is_an_error() {
        let mut short: &[u8] = b"VMEM";
        assert!(DumpHeader::read_from(&mut short).is_err());
    }
}
