//! The state behind the manager's reader/writer lock.
//!
//! Everything here that takes `&mut self` runs under the write lock. The
//! `&self` methods are safe from the read-locked access path: they only touch
//! atomics, per-level TLB locks, the cache mutex and per-frame store locks.
//!
//! ## Shared frames
//!
//! A frame mapped by more than one `(pid, page)` is listed in `shared` with
//! all of its mappers. The frame table keeps exactly one of them as owner;
//! when the owner goes away ownership moves to the next mapper, and when
//! only one mapper is left the frame becomes private again.

use crate::cache::WriteBackCache;
use crate::error::MemoryError;
use crate::replacement::{AccessTracker, ReplacementPolicy, policy_for};
use crate::stats::{Counter, MemoryStats};
use core::ops::Range;
use kernel_alloc::{AllocationError, Allocator, FileSwap, PhysicalStore, SwapError, SwapManager};
use kernel_info::memory::USER_SPACE_END;
use kernel_info::{MemoryConfig, Pid, SwapBackendKind};
use kernel_memory_addresses::{FrameNumber, PageNumber, PageSize, VirtualAddress};
use kernel_vmem::{
    Access, AccessControl, AddressSpace, AddressSpaceError, DenialReason, PageEntry, Permissions,
    ProtectionError, Region, RegionKind, TranslateError, Translation, TranslationError, Translator,
    TwoLevelTlb,
};
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) struct VmState {
    pub config: MemoryConfig,
    pub page_size: PageSize,
    pub store: Arc<PhysicalStore>,
    pub allocator: Allocator,
    pub swap: SwapManager,
    pub spaces: BTreeMap<Pid, AddressSpace>,
    pub tlb: TwoLevelTlb,
    pub protection: AccessControl,
    pub tracker: AccessTracker,
    pub policy: Box<dyn ReplacementPolicy>,
    pub shared: BTreeMap<FrameNumber, Vec<(Pid, PageNumber)>>,
    pub cache: Arc<WriteBackCache>,
    pub stats: MemoryStats,
}

impl VmState {
    pub fn new(config: MemoryConfig) -> Result<Self, MemoryError> {
        let ps = config.validate()?;
        let swap = match &config.swap_backend {
            SwapBackendKind::Memory => SwapManager::in_memory(config.swap_size, ps),
            SwapBackendKind::File(path) => {
                let file = FileSwap::create(path, config.swap_size).map_err(SwapError::from)?;
                SwapManager::new(Box::new(file), ps)
            }
        };
        Self::with_swap(config, swap)
    }

    /// Like [`new`](Self::new), paging to `swap` instead of the configured backend.
    pub fn with_swap(config: MemoryConfig, swap: SwapManager) -> Result<Self, MemoryError> {
        let ps = config.validate()?;
        let frames = usize::try_from(config.frame_count())
            .map_err(|_| MemoryError::Invariant("frame count exceeds the address width"))?;
        let store = Arc::new(PhysicalStore::new(frames, ps));
        let cache = Arc::new(WriteBackCache::new(
            Arc::clone(&store),
            config.write_policy,
            config.cache_capacity,
        ));
        log::info!(
            "memory: {frames} frames of {ps}, {} swap slots, {} allocation, {} replacement",
            swap.total_slots(),
            config.allocation_strategy,
            config.replacement_policy
        );
        Ok(Self {
            page_size: ps,
            allocator: Allocator::new(Arc::clone(&store), config.allocation_strategy),
            swap,
            spaces: BTreeMap::new(),
            tlb: TwoLevelTlb::new(config.tlb_l1_capacity, config.tlb_l2_capacity),
            protection: AccessControl::new(ps, config.violation_history),
            tracker: AccessTracker::new(frames),
            policy: policy_for(config.replacement_policy),
            shared: BTreeMap::new(),
            cache,
            stats: MemoryStats::default(),
            store,
            config,
        })
    }

    pub fn translator(&self) -> Translator<'_> {
        Translator::new(&self.tlb, self.page_size)
    }

    pub fn translate(&self, pid: Pid, va: VirtualAddress, access: Access) -> Result<Translation, TranslateError> {
        self.translator()
            .translate(pid, self.spaces.get(&pid), va, access)
    }

    pub fn space(&self, pid: Pid) -> Result<&AddressSpace, MemoryError> {
        self.spaces
            .get(&pid)
            .ok_or_else(|| TranslationError::NoPageTable(pid).into())
    }

    pub fn space_mut(&mut self, pid: Pid) -> Result<&mut AddressSpace, MemoryError> {
        self.spaces
            .get_mut(&pid)
            .ok_or_else(|| TranslationError::NoPageTable(pid).into())
    }

    pub fn entry(&self, pid: Pid, page: PageNumber) -> Option<PageEntry> {
        self.spaces.get(&pid)?.page_table().get(page)
    }

    /// Pids with at least one region.
    pub fn busy_processes(&self) -> usize {
        self.spaces.values().filter(|s| s.region_count() > 0).count()
    }

    /// Permissions in force for `va`: the protection rule if one covers it,
    /// otherwise the permissions the region was created with.
    pub fn effective_permissions(&self, pid: Pid, va: VirtualAddress) -> Option<Permissions> {
        self.protection
            .region_for(pid, va)
            .map(|r| r.permissions)
            .or_else(|| {
                self.spaces
                    .get(&pid)?
                    .region_containing(va)
                    .map(|r| r.permissions)
            })
    }

    /// Region and page-level check of every page in `[va, va + len)`, without
    /// touching anything. Region denials are recorded.
    pub fn validate_access(&self, pid: Pid, va: VirtualAddress, len: usize, access: Access) -> Result<(), MemoryError> {
        let space = self.space(pid)?;
        let ps = self.page_size;
        let last = va
            .checked_add(len.saturating_sub(1) as u64)
            .ok_or(TranslationError::Unmapped { pid, address: va })?;
        let (first, last) = (va.page(ps), last.page(ps));
        let mut page = first;
        loop {
            let address = if page == first { va } else { page.base(ps) };
            self.protection.check_access(pid, address, access)?;
            let entry = space
                .page_table()
                .get(page)
                .ok_or(TranslationError::Unmapped { pid, address })?;
            let cow = access.is_write() && entry.shared() && entry.copy_on_write();
            if !entry.permissions().allows(access) && !cow {
                return Err(ProtectionError {
                    pid,
                    address,
                    access,
                    reason: DenialReason::Page,
                }
                .into());
            }
            if page == last {
                return Ok(());
            }
            page = page.next();
        }
    }

    /// Like [`validate_access`](Self::validate_access), but records nothing.
    pub fn permits(&self, pid: Pid, va: VirtualAddress, len: u64, access: Access) -> bool {
        let ps = self.page_size;
        let Some(space) = self.spaces.get(&pid) else {
            return false;
        };
        let Some(last) = va.checked_add(len.saturating_sub(1)) else {
            return false;
        };
        let mut page = va.page(ps);
        loop {
            let address = page.base(ps).max(va);
            let allowed = self.protection.permits(pid, address, access)
                && space.page_table().get(page).is_some_and(|e| {
                    e.permissions().allows(access)
                        || (access.is_write() && e.shared() && e.copy_on_write())
                });
            if !allowed {
                return false;
            }
            if page == last.page(ps) {
                return true;
            }
            page = page.next();
        }
    }

    /// Handle a translation outcome that needs the write lock.
    pub fn resolve(&mut self, err: TranslateError) -> Result<(), MemoryError> {
        match err {
            TranslateError::PageFault(f) => self.resolve_fault(f.pid, f.address, f.access).map(|_| ()),
            TranslateError::CopyOnWrite { pid, address, .. } => self.copy_on_write(pid, address),
            other => Err(other.into()),
        }
    }

    /// Free a frame along with its cache line and replacement history.
    pub fn release_frame(&mut self, frame: FrameNumber) {
        self.cache.discard(frame);
        self.tracker.forget(frame);
        self.allocator.release_frame(frame);
    }

    fn commit_limit(&self) -> u64 {
        let backing = (self.allocator.frames().total() + self.swap.total_slots()) as f64;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let limit = (backing * self.config.overcommit_ratio) as u64;
        limit
    }

    fn committed(&self) -> u64 {
        self.spaces.values().map(AddressSpace::committed_pages).sum()
    }

    /// Refuse `size` bytes that would push committed pages over the limit.
    pub fn check_commit(&self, size: u64) -> Result<u64, MemoryError> {
        if size == 0 {
            return Err(AllocationError::ZeroSize.into());
        }
        let ps = self.page_size;
        let pages = ps.pages_for(size);
        let limit = self.commit_limit();
        if self.committed().saturating_add(pages) > limit {
            return Err(AllocationError::TooLarge {
                requested: size,
                capacity: limit.saturating_mul(ps.bytes()),
            }
            .into());
        }
        Ok(pages)
    }

    /// Reserve and install a region of `pages` zero-fill pages.
    pub fn map_region(&mut self, pid: Pid, pages: u64, size: u64, permissions: Permissions, kind: RegionKind) -> Result<VirtualAddress, MemoryError> {
        let ps = self.page_size;
        let base = self.config.user_space_base;
        let space = self
            .spaces
            .entry(pid)
            .or_insert_with(|| AddressSpace::new(pid, ps, base, USER_SPACE_END));
        let placed = space.reserve(pages).and_then(|start| {
            space.insert_region(Region {
                start,
                size,
                pages,
                permissions,
                kind,
            })?;
            Ok(start)
        });
        let start = match placed {
            Ok(start) => start,
            Err(e) => {
                if space.region_count() == 0 {
                    self.spaces.remove(&pid);
                }
                return Err(e.into());
            }
        };
        self.protection
            .set_access_control(pid, start, pages * ps.bytes(), permissions);
        Ok(start)
    }

    /// Anonymous memory: placed contiguously when possible, otherwise demand paged.
    pub fn allocate(&mut self, pid: Pid, size: u64) -> Result<VirtualAddress, MemoryError> {
        let pages = self.check_commit(size)?;
        let start = self.map_region(pid, pages, size, Permissions::RW, RegionKind::Anonymous)?;
        match self.place_eagerly(pid, start, size) {
            Ok(true) => {}
            Ok(false) => log::debug!("{pid}: {pages} pages at {start} left to demand paging"),
            Err(e) => {
                if let Err(undo) = self.unmap_region(pid, start) {
                    log::warn!("rollback of {start} for {pid} failed: {undo}");
                }
                return Err(e);
            }
        }
        self.stats.record(pid, Counter::Allocations, |p| {
            p.allocations += 1;
            p.bytes_allocated += size;
        });
        self.apply_swap_threshold();
        Ok(start)
    }

    /// Back a fresh region with one contiguous run of frames. Returns `false`
    /// if no run is available even after a reclaim pass.
    fn place_eagerly(&mut self, pid: Pid, start: VirtualAddress, size: u64) -> Result<bool, MemoryError> {
        let ps = self.page_size;
        let pa = match self.allocator.allocate(size, pid) {
            Ok(pa) => pa,
            Err(AllocationError::OutOfMemory { frames, largest_hole }) => {
                log::warn!("no run of {frames} frames (largest {largest_hole}); reclaiming");
                self.force_reclaim()?;
                match self.allocator.allocate(size, pid) {
                    Ok(pa) => pa,
                    Err(AllocationError::OutOfMemory { .. }) => return Ok(false),
                    Err(e) => return Err(e.into()),
                }
            }
            Err(AllocationError::TooLarge { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let first_frame = pa.frame(ps);
        let first_page = start.page(ps);
        for i in 0..ps.pages_for(size) {
            let (frame, page) = (first_frame + i, first_page + i);
            self.allocator.frames_mut().set_owner(frame, pid, page)?;
            self.space_mut(pid)?
                .page_table_mut()
                .update(page, |e| e.mapped_to(frame));
            self.tracker.loaded(frame);
        }
        Ok(true)
    }

    /// Swap pages out while usage stays above the configured threshold.
    pub fn apply_swap_threshold(&mut self) {
        let threshold = self.config.swap_threshold;
        if threshold >= 1.0 {
            return;
        }
        while self.allocator.usage_ratio() > threshold {
            match self.evict_one() {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    log::warn!("proactive swap-out stopped: {e}");
                    break;
                }
            }
        }
    }

    /// Make `(pid, page)` resident and overwrite its first `bytes.len()` bytes.
    pub fn populate(&mut self, pid: Pid, page: PageNumber, bytes: &[u8]) -> Result<(), MemoryError> {
        let va = page.base(self.page_size);
        self.resolve_fault(pid, va, Access::Write)?;
        let frame = self
            .entry(pid, page)
            .and_then(|e| e.frame())
            .ok_or(MemoryError::Invariant("populated page is not resident"))?;
        self.cache.write(frame, 0, bytes)?;
        self.allocator.frames().mark_dirty(frame);
        self.space(pid)?.page_table().touch(page, true);
        Ok(())
    }

    /// A private mapping, optionally filled from `contents`.
    pub fn map_private(&mut self, pid: Pid, size: u64, permissions: Permissions, contents: Option<&[u8]>) -> Result<VirtualAddress, MemoryError> {
        let pages = self.check_commit(size)?;
        if let Some(bytes) = contents
            && bytes.len() as u64 > size
        {
            return Err(AllocationError::TooLarge {
                requested: bytes.len() as u64,
                capacity: size,
            }
            .into());
        }
        let start = self.map_region(pid, pages, size, permissions, RegionKind::Private)?;
        if let Some(bytes) = contents {
            let first = start.page(self.page_size);
            for (i, chunk) in bytes.chunks(self.page_size.bytes_usize()).enumerate() {
                if chunk.iter().all(|b| *b == 0) {
                    continue;
                }
                if let Err(e) = self.populate(pid, first + i as u64, chunk) {
                    if let Err(undo) = self.unmap_region(pid, start) {
                        log::warn!("rollback of {start} for {pid} failed: {undo}");
                    }
                    return Err(e);
                }
            }
        }
        self.stats.record(pid, Counter::Allocations, |p| {
            p.allocations += 1;
            p.bytes_allocated += size;
        });
        log::debug!("{pid}: private mapping of {pages} pages at {start}");
        Ok(start)
    }

    /// Map `size` bytes of `owner`'s memory at `owner_va` into `target`.
    pub fn map_shared(&mut self, owner: Pid, owner_va: VirtualAddress, target: Pid, size: u64, copy_on_write: bool) -> Result<VirtualAddress, MemoryError> {
        let ps = self.page_size;
        if size == 0 {
            return Err(AllocationError::ZeroSize.into());
        }
        if !ps.is_aligned(owner_va.as_u64()) {
            return Err(AddressSpaceError::BadAddress(owner_va).into());
        }
        let pages = ps.pages_for(size);
        let region = *self
            .space(owner)?
            .region_containing(owner_va)
            .ok_or(TranslationError::Unmapped {
                pid: owner,
                address: owner_va,
            })?;
        let last = pages
            .checked_mul(ps.bytes())
            .and_then(|bytes| owner_va.checked_add(bytes - 1))
            .ok_or(AddressSpaceError::BadAddress(owner_va))?;
        if !region.contains(last, ps) {
            return Err(AddressSpaceError::BadAddress(owner_va).into());
        }

        let kind = RegionKind::Shared {
            owner,
            owner_start: owner_va,
            copy_on_write,
        };
        let start = self.map_region(target, pages, size, region.permissions, kind)?;
        for i in 0..pages {
            let pages = (owner_va.page(ps) + i, start.page(ps) + i);
            if let Err(e) = self.share_page(owner, target, pages, region.permissions, copy_on_write) {
                if let Err(undo) = self.unmap_region(target, start) {
                    log::warn!("rollback of shared mapping at {start} for {target} failed: {undo}");
                }
                return Err(e);
            }
        }
        log::debug!(
            "{target}: {pages} pages at {start} shared from {owner} {owner_va}{}",
            if copy_on_write { " (copy-on-write)" } else { "" }
        );
        Ok(start)
    }

    fn share_page(&mut self, owner: Pid, target: Pid, (owner_page, page): (PageNumber, PageNumber), mut permissions: Permissions, copy_on_write: bool) -> Result<(), MemoryError> {
        let ps = self.page_size;
        self.resolve_fault(owner, owner_page.base(ps), Access::Read)?;
        let entry = self
            .entry(owner, owner_page)
            .ok_or(MemoryError::Invariant("shared page vanished"))?;
        let frame = entry
            .frame()
            .ok_or(MemoryError::Invariant("shared page is not resident"))?;

        let mappers = self.shared.entry(frame).or_default();
        if mappers.is_empty() {
            mappers.push((owner, owner_page));
        }
        let existing = mappers.clone();
        mappers.push((target, page));

        // Once any mapper is copy-on-write, all of them are.
        let cow = entry.copy_on_write() || copy_on_write;
        for (pid, p) in existing {
            if let Some(space) = self.spaces.get_mut(&pid) {
                space.page_table_mut().update(p, |e| {
                    e.with_shared(true)
                        .with_copy_on_write(cow)
                        .with_writable(e.writable() && !cow)
                });
            }
            self.tlb.invalidate(pid, p);
        }

        if cow {
            permissions.remove(Permissions::WRITE);
        }
        self.space_mut(target)?.page_table_mut().set(
            page,
            PageEntry::resident(frame, permissions)
                .with_shared(true)
                .with_copy_on_write(cow),
        );
        Ok(())
    }

    /// Detach the region starting at `start` and release everything behind it.
    pub fn unmap_region(&mut self, pid: Pid, start: VirtualAddress) -> Result<Region, MemoryError> {
        let ps = self.page_size;
        let (region, entries) = self
            .space_mut(pid)?
            .remove_region(start)
            .ok_or(TranslationError::Unmapped { pid, address: start })?;
        for (page, entry) in entries {
            self.tlb.invalidate(pid, page);
            if let Some(frame) = entry.frame() {
                self.drop_mapping(pid, page, frame)?;
            }
            self.swap.free_page(pid, page);
        }
        self.protection
            .remove_access_control(pid, start, region.pages * ps.bytes());
        log::debug!("{pid}: unmapped {} pages at {start}", region.pages);
        Ok(region)
    }

    fn drop_mapping(&mut self, pid: Pid, page: PageNumber, frame: FrameNumber) -> Result<(), MemoryError> {
        if self.leave_shared(pid, page, frame)? {
            return Ok(());
        }
        if self
            .allocator
            .frames()
            .get(frame)
            .is_some_and(|f| f.owner == Some(pid))
        {
            self.release_frame(frame);
        } else {
            log::warn!("{pid} {page} mapped {frame} without owning it");
        }
        Ok(())
    }

    /// Remove `(pid, page)` from the mappers of `frame`. Returns `false` if the
    /// frame is not shared.
    pub fn leave_shared(&mut self, pid: Pid, page: PageNumber, frame: FrameNumber) -> Result<bool, MemoryError> {
        let Some(mappers) = self.shared.get_mut(&frame) else {
            return Ok(false);
        };
        mappers.retain(|m| *m != (pid, page));
        let remaining = mappers.clone();
        if remaining.len() <= 1 {
            self.shared.remove(&frame);
        }
        let owner = self
            .allocator
            .frames()
            .get(frame)
            .and_then(|f| f.owner.zip(f.page));
        match remaining.first() {
            None => self.release_frame(frame),
            Some(&(next, next_page)) => {
                if owner == Some((pid, page)) {
                    self.allocator.transfer_frame(frame, next, next_page)?;
                    // Any retained swap copy belongs to the old owner.
                    self.allocator.frames().mark_dirty(frame);
                }
                if remaining.len() == 1 {
                    self.unshare(next, next_page);
                }
            }
        }
        Ok(true)
    }

    /// Turn the last mapper of a formerly shared frame back into a private page.
    fn unshare(&mut self, pid: Pid, page: PageNumber) {
        let va = page.base(self.page_size);
        let permissions = self.effective_permissions(pid, va);
        if let Some(space) = self.spaces.get_mut(&pid) {
            space.page_table_mut().update(page, |e| {
                let e = e.with_shared(false).with_copy_on_write(false);
                permissions.map_or(e, |p| e.with_permissions(p))
            });
        }
        self.tlb.invalidate(pid, page);
        log::debug!("{pid} {page} is private again");
    }

    /// Rewrite the permission bits of every page in `[va, va + size)` and drop
    /// their cached translations. Copy-on-write pages stay read-only.
    pub fn apply_page_permissions(&mut self, pid: Pid, va: VirtualAddress, size: u64) {
        let ps = self.page_size;
        let first = va.page(ps).as_u64();
        let end = VirtualAddress::new(va.as_u64().saturating_add(size.max(1)) - 1)
            .page(ps)
            .as_u64()
            + 1;
        // Only pages of mapped regions can carry an entry.
        let pages: Vec<PageNumber> = self
            .spaces
            .get(&pid)
            .map(|space| {
                space
                    .regions()
                    .flat_map(|r| {
                        let start = r.start.page(ps).as_u64();
                        start.max(first)..(start + r.pages).min(end)
                    })
                    .map(PageNumber::new)
                    .collect()
            })
            .unwrap_or_default();
        for page in pages {
            let Some(permissions) = self.effective_permissions(pid, page.base(ps)) else {
                continue;
            };
            let Some(space) = self.spaces.get_mut(&pid) else {
                return;
            };
            space.page_table_mut().update(page, |e| {
                let cow = e.copy_on_write();
                e.with_permissions(permissions)
                    .with_writable(permissions.contains(Permissions::WRITE) && !cow)
            });
            self.tlb.invalidate(pid, page);
        }
    }

    /// Tear down everything `pid` owns.
    pub fn release_process(&mut self, pid: Pid) -> Result<usize, MemoryError> {
        let starts: Vec<VirtualAddress> = self
            .spaces
            .get(&pid)
            .map(|s| s.regions().map(|r| r.start).collect())
            .unwrap_or_default();
        for start in &starts {
            self.unmap_region(pid, *start)?;
        }
        for frame in self.allocator.frames().frames_of(pid) {
            log::warn!("{pid} still owned {frame} after unmapping");
            self.cache.discard(frame);
            self.tracker.forget(frame);
        }
        self.allocator.free_all(pid);
        let slots = self.swap.free_process(pid);
        if slots > 0 {
            log::warn!("{pid} still held {slots} swap slots after unmapping");
        }
        self.tlb.invalidate_all(pid);
        self.protection.clear_process(pid);
        self.spaces.remove(&pid);
        self.stats.remove_process(pid);
        log::info!("{pid}: released {} regions", starts.len());
        Ok(starts.len())
    }
}

/// Split `[va, va + len)` into per-page pieces: the address of each piece and
/// its range within the caller's buffer.
pub(crate) fn chunks(ps: PageSize, va: VirtualAddress, len: usize) -> impl Iterator<Item = (VirtualAddress, Range<usize>)> {
    let mut done = 0;
    core::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let at = va + done as u64;
        let n = (ps.bytes_usize() - at.offset(ps).as_usize()).min(len - done);
        let range = done..done + n;
        done += n;
        Some((at, range))
    })
}
