//! # Address Translation
//!
//! [`Translator`] walks `TLB → page table` for one access and classifies
//! everything that is not a plain hit:
//!
//! | Outcome | Meaning | Who handles it |
//! |---|---|---|
//! | `Ok(Translation)` | Resident and permitted | caller transfers data |
//! | [`TranslateError::Translation`] | No page table / unmapped | surfaced |
//! | [`TranslateError::PageFault`] | Mapped but not resident | fault pipeline, then retry |
//! | [`TranslateError::CopyOnWrite`] | Write to a shared COW page | COW copy, then retry |
//! | [`TranslateError::Protection`] | Page bits deny the access | surfaced + signal |
//!
//! Read and execute checks never fall into the COW path; a read-only page
//! without the COW flag always faults as a protection violation.

use crate::address_space::AddressSpace;
use crate::permissions::Access;
use crate::protection::{DenialReason, ProtectionError};
use crate::tlb::{TlbLevel, TwoLevelTlb};
use core::fmt;
use kernel_info::Pid;
use kernel_memory_addresses::{FrameNumber, PageNumber, PageSize, PhysicalAddress, VirtualAddress};

/// Which structure produced a translation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TranslationSource {
    Tlb(TlbLevel),
    PageTable,
}

/// A successful translation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Translation {
    pub physical: PhysicalAddress,
    pub frame: FrameNumber,
    pub page: PageNumber,
    pub source: TranslationSource,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum TranslationError {
    #[error("{0} has no page table")]
    NoPageTable(Pid),
    #[error("{address} is not mapped for {pid}")]
    Unmapped { pid: Pid, address: VirtualAddress },
}

/// Minor faults are satisfied from memory (zero fill); major faults need swap I/O.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FaultKind {
    Minor,
    Major,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Minor => "minor",
            Self::Major => "major",
        })
    }
}

/// A page-fault descriptor.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
#[error("{kind} page fault on {access} of {address} for {pid}")]
pub struct PageFault {
    pub pid: Pid,
    pub address: VirtualAddress,
    pub page: PageNumber,
    pub access: Access,
    pub kind: FaultKind,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum TranslateError {
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error(transparent)]
    PageFault(PageFault),
    #[error("copy-on-write fault at {address} for {pid}")]
    CopyOnWrite {
        pid: Pid,
        address: VirtualAddress,
        page: PageNumber,
    },
    #[error(transparent)]
    Protection(#[from] ProtectionError),
}

/// TLB-backed translator for one page geometry.
#[derive(Copy, Clone)]
pub struct Translator<'a> {
    tlb: &'a TwoLevelTlb,
    page_size: PageSize,
}

impl<'a> Translator<'a> {
    #[must_use]
    pub const fn new(tlb: &'a TwoLevelTlb, page_size: PageSize) -> Self {
        Self { tlb, page_size }
    }

    /// Translate `va` in `space` for `access`.
    ///
    /// A successful translation records the access on the page entry
    /// (`accessed`, plus `dirty` for writes) and leaves the translation cached
    /// in both TLB levels.
    ///
    /// # Errors
    /// See the table in the module documentation.
    pub fn translate(
        &self,
        pid: Pid,
        space: Option<&AddressSpace>,
        va: VirtualAddress,
        access: Access,
    ) -> Result<Translation, TranslateError> {
        let space = space.ok_or(TranslationError::NoPageTable(pid))?;
        let (page, offset) = va.split(self.page_size);

        if let Some((entry, level)) = self.tlb.lookup(pid, page)
            && entry.permissions.allows(access)
            && space.page_table().touch(page, access.is_write()).is_some()
        {
            return Ok(Translation {
                physical: entry.frame.join(offset, self.page_size),
                frame: entry.frame,
                page,
                source: TranslationSource::Tlb(level),
            });
        }

        let entry = space
            .page_table()
            .get(page)
            .ok_or(TranslationError::Unmapped { pid, address: va })?;

        let Some(frame) = entry.frame() else {
            let kind = if entry.swapped() {
                FaultKind::Major
            } else {
                FaultKind::Minor
            };
            return Err(TranslateError::PageFault(PageFault {
                pid,
                address: va,
                page,
                access,
                kind,
            }));
        };

        if !entry.permissions().allows(access) {
            if access.is_write() && entry.shared() && entry.copy_on_write() {
                return Err(TranslateError::CopyOnWrite {
                    pid,
                    address: va,
                    page,
                });
            }
            return Err(ProtectionError {
                pid,
                address: va,
                access,
                reason: DenialReason::Page,
            }
            .into());
        }

        space.page_table().touch(page, access.is_write());
        self.tlb.insert(pid, page, frame, entry.permissions());
        log::trace!("translated {va} -> frame {frame} for {pid} via page table");
        Ok(Translation {
            physical: frame.join(offset, self.page_size),
            frame,
            page,
            source: TranslationSource::PageTable,
        })
    }

    /// The page-table-only answer for `va`, ignoring the TLB and recording nothing.
    #[must_use]
    pub fn walk(&self, space: &AddressSpace, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (page, offset) = va.split(self.page_size);
        let frame = space.page_table().get(page)?.frame()?;
        Some(frame.join(offset, self.page_size))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address_space::{Region, RegionKind};
    use crate::page_entry::{PageEntry, SwapSlot};
    use crate::permissions::Permissions;

    const BASE: u64 = 0x0040_0000;

    fn setup(perms: Permissions) -> (AddressSpace, PageNumber) {
        let ps = PageSize::SIZE_4K;
        let mut space = AddressSpace::new(Pid::new(7), ps, BASE, BASE + (1 << 20));
        space
            .insert_region(Region {
                start: VirtualAddress::new(BASE),
                size: 4096,
                pages: 1,
                permissions: perms,
                kind: RegionKind::Anonymous,
            })
            .unwrap();
        (space, VirtualAddress::new(BASE).page(ps))
    }

    #[test]
    fn no_page_table_and_unmapped() {
        let tlb = TwoLevelTlb::new(4, 8);
        let t = Translator::new(&tlb, PageSize::SIZE_4K);
        let va = VirtualAddress::new(BASE);
        assert_eq!(
            t.translate(Pid::new(7), None, va, Access::Read),
            Err(TranslateError::Translation(TranslationError::NoPageTable(Pid::new(7))))
        );
        let (space, _) = setup(Permissions::RW);
        let far = VirtualAddress::new(BASE + 0x10_000);
        assert!(matches!(
            t.translate(Pid::new(7), Some(&space), far, Access::Read),
            Err(TranslateError::Translation(TranslationError::Unmapped { .. }))
        ));
    }

    #[test]
    fn faults_are_classified() {
        let tlb = TwoLevelTlb::new(4, 8);
        let t = Translator::new(&tlb, PageSize::SIZE_4K);
        let (mut space, page) = setup(Permissions::RW);
        let va = VirtualAddress::new(BASE + 8);
        let Err(TranslateError::PageFault(f)) = t.translate(Pid::new(7), Some(&space), va, Access::Read) else {
            panic!("expected a page fault");
        };
        assert_eq!(f.kind, FaultKind::Minor);

        space
            .page_table_mut()
            .update(page, |e| e.swapped_to(SwapSlot::new(3)));
        let Err(TranslateError::PageFault(f)) = t.translate(Pid::new(7), Some(&space), va, Access::Write) else {
            panic!("expected a page fault");
        };
        assert_eq!(f.kind, FaultKind::Major);
    }

    #[test]
    fn second_translation_hits_l1_with_same_address() {
        let tlb = TwoLevelTlb::new(4, 8);
        let t = Translator::new(&tlb, PageSize::SIZE_4K);
        let (mut space, page) = setup(Permissions::RW);
        space
            .page_table_mut()
            .set(page, PageEntry::resident(FrameNumber::new(5), Permissions::RW));
        let va = VirtualAddress::new(BASE + 0x123);

        let first = t.translate(Pid::new(7), Some(&space), va, Access::Read).unwrap();
        assert_eq!(first.source, TranslationSource::PageTable);
        assert_eq!(first.physical.as_u64(), 5 * 4096 + 0x123);

        let second = t.translate(Pid::new(7), Some(&space), va, Access::Read).unwrap();
        assert_eq!(second.source, TranslationSource::Tlb(TlbLevel::L1));
        assert_eq!(second.physical, first.physical);
        assert_eq!(t.walk(&space, va), Some(first.physical));
    }

    #[test]
    fn write_to_read_only_is_denied_unless_cow() {
        let tlb = TwoLevelTlb::new(4, 8);
        let t = Translator::new(&tlb, PageSize::SIZE_4K);
        let (mut space, page) = setup(Permissions::READ);
        space
            .page_table_mut()
            .set(page, PageEntry::resident(FrameNumber::new(1), Permissions::READ));
        let va = VirtualAddress::new(BASE);
        assert!(matches!(
            t.translate(Pid::new(7), Some(&space), va, Access::Write),
            Err(TranslateError::Protection(_))
        ));
        // The denied write did not mark the page dirty.
        assert!(!space.page_table().get(page).unwrap().dirty());

        space
            .page_table_mut()
            .update(page, |e| e.with_shared(true).with_copy_on_write(true));
        assert!(matches!(
            t.translate(Pid::new(7), Some(&space), va, Access::Write),
            Err(TranslateError::CopyOnWrite { .. })
        ));
        assert!(matches!(
            t.translate(Pid::new(7), Some(&space), va, Access::Execute),
            Err(TranslateError::Protection(_))
        ));
    }

    #[test]
    fn write_hit_marks_dirty() {
        let tlb = TwoLevelTlb::new(4, 8);
        let t = Translator::new(&tlb, PageSize::SIZE_4K);
        let (mut space, page) = setup(Permissions::RW);
        space
            .page_table_mut()
            .set(page, PageEntry::resident(FrameNumber::new(2), Permissions::RW));
        let va = VirtualAddress::new(BASE);
        t.translate(Pid::new(7), Some(&space), va, Access::Read).unwrap();
        assert!(!space.page_table().get(page).unwrap().dirty());
        let tr = t.translate(Pid::new(7), Some(&space), va, Access::Write).unwrap();
        assert_eq!(tr.source, TranslationSource::Tlb(TlbLevel::L1));
        assert!(space.page_table().get(page).unwrap().dirty());
    }
}
