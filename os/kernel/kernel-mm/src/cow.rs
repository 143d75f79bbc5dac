//! Copy-on-write resolution.

use crate::error::MemoryError;
use crate::state::VmState;
use crate::stats::Counter;
use kernel_info::Pid;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{Access, DenialReason, Permissions, ProtectionError, TranslationError};

impl VmState {
    /// Give `pid` a private, writable copy of the shared page containing `va`.
    ///
    /// The last remaining mapper takes the frame over in place instead of copying.
    pub fn copy_on_write(&mut self, pid: Pid, va: VirtualAddress) -> Result<(), MemoryError> {
        let page = va.page(self.page_size);
        let entry = self
            .entry(pid, page)
            .ok_or(TranslationError::Unmapped { pid, address: va })?;
        // Resolved by another writer, or evicted; the retry sorts it out.
        let Some(old) = entry.frame() else {
            return Ok(());
        };
        if entry.writable() {
            return Ok(());
        }

        let denied = ProtectionError {
            pid,
            address: va,
            access: Access::Write,
            reason: DenialReason::Page,
        };
        let permissions = self
            .effective_permissions(pid, va)
            .filter(|p| p.contains(Permissions::WRITE))
            .ok_or(denied)?;
        if !(entry.shared() && entry.copy_on_write()) {
            return Err(denied.into());
        }

        let sole = self.shared.get(&old).is_none_or(|m| m.len() <= 1);
        if sole {
            self.shared.remove(&old);
            if self
                .allocator
                .frames()
                .get(old)
                .is_some_and(|f| f.owner.zip(f.page) != Some((pid, page)))
            {
                self.allocator.transfer_frame(old, pid, page)?;
                self.allocator.frames().mark_dirty(old);
            }
            self.space_mut(pid)?.page_table_mut().update(page, |e| {
                e.with_shared(false)
                    .with_copy_on_write(false)
                    .with_permissions(permissions)
            });
            self.tlb.invalidate(pid, page);
            log::debug!("{pid} {page}: last copy-on-write mapper takes {old}");
            return Ok(());
        }

        let new = self.obtain_frame(pid, page)?;
        let copied = self
            .cache
            .evict(old)
            .and_then(|()| self.store.copy_frame(old, new));
        if let Err(e) = copied {
            self.release_frame(new);
            return Err(MemoryError::fault(pid, va, e.into()));
        }

        self.space_mut(pid)?.page_table_mut().update(page, |e| {
            e.mapped_to(new)
                .with_shared(false)
                .with_copy_on_write(false)
                .with_permissions(permissions)
                .with_dirty(true)
        });
        self.allocator.frames().mark_dirty(new);
        self.tracker.loaded(new);
        self.tlb.invalidate(pid, page);
        self.leave_shared(pid, page, old)?;
        self.stats
            .record(pid, Counter::CowCopies, |p| p.cow_copies += 1);
        log::debug!("{pid} {page}: copied {old} -> {new} on write");
        Ok(())
    }
}
