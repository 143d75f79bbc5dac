//! # Memory Manager
//!
//! The facade the rest of the system talks to. All state sits behind one
//! [`RwLock`]:
//!
//! - allocation, unmapping, fault handling and maintenance take the write lock;
//! - reads and writes of mapped memory run under the read lock and only
//!   escalate to the write lock when a page has to be faulted in or copied,
//!   downgrading again before the data is moved.
//!
//! ```text
//!  read/write ──► read lock ──► validate all pages ──► per page: translate
//!                                                          │
//!                           ┌────── fault / COW ◄──────────┤
//!                           ▼                              │ ok
//!                      write lock: resolve                 ▼
//!                           │ downgrade            cache read / write
//!                           └────────► retry ─────────────►┘
//! ```
//!
//! An access is validated against every page it touches before any byte moves,
//! so a denied write leaves memory untouched.

use crate::cache::FlushDaemon;
use crate::dump::DumpSummary;
use crate::error::MemoryError;
use crate::reclaim::{CompressReport, DefragReport, GcReport, ReclaimReport};
use crate::replacement::policy_for;
use crate::signal::{LogSignals, Signal, SignalSink};
use crate::state::{VmState, chunks};
use crate::stats::{Counter, MemoryStatsSnapshot, ProcessStats};
use core::ops::Range;
use kernel_alloc::{SwapBackend, SwapManager};
use kernel_info::{AllocationStrategy, ConfigError, MemoryConfig, Pid, ReplacementPolicyKind, WritePolicy};
use kernel_memory_addresses::{PageSize, PhysicalAddress, VirtualAddress};
use kernel_vmem::{
    Access, DenialReason, Permissions, ProtectionError, ProtectionRegion, Region, TranslateError,
    Translation, TranslationError, Violation,
};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

/// Faults resolved for one page before an access gives up. Another thread may
/// evict the page between resolution and the retried translation.
const MAX_FAULT_RETRIES: usize = 4;

pub struct MemoryManager {
    state: RwLock<VmState>,
    signals: Arc<dyn SignalSink>,
    flusher: Mutex<Option<FlushDaemon>>,
}

impl core::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryManager").finish_non_exhaustive()
    }
}

fn start_flusher(state: &VmState) -> Option<FlushDaemon> {
    let config = &state.config;
    if config.write_policy != WritePolicy::WriteBack || config.cache_capacity == 0 {
        return None;
    }
    let interval = config.flush_interval?;
    match FlushDaemon::spawn(Arc::clone(&state.cache), interval) {
        Ok(daemon) => Some(daemon),
        Err(e) => {
            log::warn!("running without a write-back flusher: {e}");
            None
        }
    }
}

impl MemoryManager {
    /// # Errors
    /// The configuration is invalid or the swap file cannot be created.
    pub fn new(config: MemoryConfig) -> Result<Self, MemoryError> {
        Self::with_signals(config, Arc::new(LogSignals))
    }

    /// Like [`new`](Self::new), delivering segmentation faults to `signals`.
    ///
    /// # Errors
    /// The configuration is invalid or the swap file cannot be created.
    pub fn with_signals(config: MemoryConfig, signals: Arc<dyn SignalSink>) -> Result<Self, MemoryError> {
        Ok(Self::from_state(VmState::new(config)?, signals))
    }

    /// Like [`with_signals`](Self::with_signals), paging to `backend` instead
    /// of the configured swap. A later [`reconfigure`](Self::reconfigure)
    /// returns to the configured backend.
    ///
    /// # Errors
    /// The configuration is invalid.
    pub fn with_swap_backend(config: MemoryConfig, signals: Arc<dyn SignalSink>, backend: Box<dyn SwapBackend>) -> Result<Self, MemoryError> {
        let swap = SwapManager::new(backend, config.validate()?);
        Ok(Self::from_state(VmState::with_swap(config, swap)?, signals))
    }

    fn from_state(state: VmState, signals: Arc<dyn SignalSink>) -> Self {
        let flusher = start_flusher(&state);
        Self {
            state: RwLock::new(state),
            signals,
            flusher: Mutex::new(flusher),
        }
    }

    #[must_use]
    pub fn config(&self) -> MemoryConfig {
        self.state.read().config.clone()
    }

    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.state.read().page_size
    }

    /// Record a denial and notify the signal sink once the lock is released.
    fn fail(&self, state: RwLockReadGuard<'_, VmState>, err: MemoryError, report: bool) -> MemoryError {
        if !report {
            return err;
        }
        let signal = match &err {
            MemoryError::Protection(p) => {
                if p.reason == DenialReason::Page {
                    state.protection.record_violation(p);
                }
                state
                    .stats
                    .record(p.pid, Counter::Violations, |s| s.violations += 1);
                Some(Signal::SegmentationFault {
                    pid: p.pid,
                    address: p.address,
                    access: p.access,
                })
            }
            MemoryError::Fault { .. } => {
                log::error!("{err}");
                None
            }
            _ => None,
        };
        drop(state);
        if let Some(signal) = signal {
            self.signals.deliver(signal);
        }
        err
    }

    /// Translate every page of `[va, va + len)` for `access` and hand each
    /// translation to `transfer` with the matching range of the caller's buffer.
    ///
    /// Without `report`, failures are returned as they are: nothing is
    /// validated up front, recorded, counted, or signalled.
    fn access(
        &self,
        pid: Pid,
        va: VirtualAddress,
        len: usize,
        access: Access,
        report: bool,
        mut transfer: impl FnMut(&VmState, &Translation, Range<usize>) -> Result<(), MemoryError>,
    ) -> Result<(), MemoryError> {
        let mut state = self.state.read();
        if report && let Err(e) = state.validate_access(pid, va, len, access) {
            return Err(self.fail(state, e, report));
        }
        let ps = state.page_size;
        for (at, range) in chunks(ps, va, len) {
            let mut retries = 0;
            let translation = loop {
                match state.translate(pid, at, access) {
                    Ok(t) => break t,
                    Err(e @ (TranslateError::PageFault(_) | TranslateError::CopyOnWrite { .. }))
                        if retries < MAX_FAULT_RETRIES =>
                    {
                        retries += 1;
                        drop(state);
                        let mut writer = self.state.write();
                        let resolved = writer.resolve(e);
                        state = RwLockWriteGuard::downgrade(writer);
                        if let Err(e) = resolved {
                            return Err(self.fail(state, e, report));
                        }
                    }
                    Err(e) => return Err(self.fail(state, e.into(), report)),
                }
            };
            state
                .stats
                .record(pid, Counter::Accesses, |p| p.accesses += 1);
            if let Err(e) = transfer(&state, &translation, range) {
                return Err(self.fail(state, e, report));
            }
            state.tracker.touch(translation.frame);
        }
        Ok(())
    }

    /// Allocate `size` bytes of read/write anonymous memory for `pid`.
    ///
    /// # Errors
    /// Zero size, a request over the commit limit, or an address space with no
    /// room left.
    pub fn allocate_memory(&self, pid: Pid, size: u64) -> Result<VirtualAddress, MemoryError> {
        self.state.write().allocate(pid, size)
    }

    /// Release the allocation or mapping that starts at `va`.
    ///
    /// # Errors
    /// [`TranslationError`](kernel_vmem::TranslationError) if nothing starts at `va`.
    pub fn free_memory(&self, pid: Pid, va: VirtualAddress) -> Result<(), MemoryError> {
        let mut state = self.state.write();
        state.unmap_region(pid, va)?;
        state.stats.record(pid, Counter::Frees, |p| p.frees += 1);
        Ok(())
    }

    /// Tear down everything `pid` owns. Returns the number of regions released.
    ///
    /// # Errors
    /// An internal inconsistency while unmapping.
    pub fn free_all_process_memory(&self, pid: Pid) -> Result<usize, MemoryError> {
        self.state.write().release_process(pid)
    }

    /// # Errors
    /// Unmapped memory, a protection violation, or an unresolvable page fault.
    pub fn read_memory(&self, pid: Pid, va: VirtualAddress, size: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0u8; size];
        self.read_into(pid, va, &mut buf)?;
        Ok(buf)
    }

    /// Read `buf.len()` bytes starting at `va`.
    ///
    /// # Errors
    /// Unmapped memory, a protection violation, or an unresolvable page fault.
    pub fn read_into(&self, pid: Pid, va: VirtualAddress, buf: &mut [u8]) -> Result<(), MemoryError> {
        if buf.is_empty() {
            return Ok(());
        }
        let ps = self.page_size();
        self.access(pid, va, buf.len(), Access::Read, true, |state, t, range| {
            let offset = t.physical.offset(ps).as_usize();
            state.cache.read(t.frame, offset, &mut buf[range])?;
            Ok(())
        })
    }

    /// # Errors
    /// Unmapped memory, a protection violation, or an unresolvable page fault.
    /// Nothing is written unless every page accepts the write.
    pub fn write_memory(&self, pid: Pid, va: VirtualAddress, data: &[u8]) -> Result<(), MemoryError> {
        if data.is_empty() {
            return Ok(());
        }
        let ps = self.page_size();
        self.access(pid, va, data.len(), Access::Write, true, |state, t, range| {
            let offset = t.physical.offset(ps).as_usize();
            state.cache.write(t.frame, offset, &data[range])?;
            state.allocator.frames().mark_dirty(t.frame);
            Ok(())
        })
    }

    /// The physical address behind `va`, faulting the page in if needed.
    ///
    /// This is a query rather than an access: it translates for the first of
    /// read, execute and write that the page permits, and a denial is neither
    /// recorded as a violation nor signalled.
    ///
    /// # Errors
    /// Unmapped memory, a page without any permission, or an unresolvable
    /// page fault.
    pub fn translate(&self, pid: Pid, va: VirtualAddress) -> Result<PhysicalAddress, MemoryError> {
        let access = {
            let state = self.state.read();
            state
                .space(pid)?
                .page_table()
                .get(va.page(state.page_size))
                .ok_or(TranslationError::Unmapped { pid, address: va })?;
            [Access::Read, Access::Execute, Access::Write]
                .into_iter()
                .find(|a| state.permits(pid, va, 1, *a))
                .ok_or(ProtectionError {
                    pid,
                    address: va,
                    access: Access::Read,
                    reason: DenialReason::Page,
                })?
        };
        let mut physical = PhysicalAddress::zero();
        self.access(pid, va, 1, access, false, |_, t, _| {
            physical = t.physical;
            Ok(())
        })?;
        Ok(physical)
    }

    /// Map `size` bytes with `permissions`, filled from `contents` when given.
    ///
    /// # Errors
    /// `contents` longer than `size`, or the same conditions as
    /// [`allocate_memory`](Self::allocate_memory).
    pub fn create_private_mapping(&self, pid: Pid, size: u64, permissions: Permissions, contents: Option<&[u8]>) -> Result<VirtualAddress, MemoryError> {
        self.state.write().map_private(pid, size, permissions, contents)
    }

    /// Map `size` bytes of `owner`'s memory at the page-aligned `owner_va` into
    /// `target`. With `copy_on_write` both sides become read-only until written.
    ///
    /// # Errors
    /// `owner_va` unaligned or the range leaving the owner's region, or no
    /// room in `target`'s address space.
    pub fn create_shared_mapping(&self, owner: Pid, owner_va: VirtualAddress, target: Pid, size: u64, copy_on_write: bool) -> Result<VirtualAddress, MemoryError> {
        self.state
            .write()
            .map_shared(owner, owner_va, target, size, copy_on_write)
    }

    /// # Errors
    /// Nothing is mapped at `va`.
    pub fn remove_memory_mapping(&self, pid: Pid, va: VirtualAddress) -> Result<(), MemoryError> {
        self.state.write().unmap_region(pid, va).map(|_| ())
    }

    /// Whether `access` to every byte of `[va, va + size)` would be allowed.
    /// Nothing is recorded.
    #[must_use]
    pub fn check_memory_permission(&self, pid: Pid, va: VirtualAddress, size: u64, access: Access) -> bool {
        self.state.read().permits(pid, va, size, access)
    }

    /// Apply `permissions` to the pages covering `[va, va + size)`.
    ///
    /// # Errors
    /// `pid` has no address space.
    pub fn set_access_control(&self, pid: Pid, va: VirtualAddress, size: u64, permissions: Permissions) -> Result<ProtectionRegion, MemoryError> {
        let mut state = self.state.write();
        state.space(pid)?;
        let region = state
            .protection
            .set_access_control(pid, va, size, permissions);
        state.apply_page_permissions(pid, va, size);
        Ok(region)
    }

    /// Drop the rules covering `[va, va + size)`; pages fall back to the
    /// permissions of their region.
    pub fn remove_access_control(&self, pid: Pid, va: VirtualAddress, size: u64) -> bool {
        let mut state = self.state.write();
        let removed = state.protection.remove_access_control(pid, va, size);
        if removed {
            state.apply_page_permissions(pid, va, size);
        }
        removed
    }

    /// Change the permissions of an already protected range.
    pub fn change_access_permission(&self, pid: Pid, va: VirtualAddress, size: u64, permissions: Permissions) -> bool {
        let mut state = self.state.write();
        let changed = state
            .protection
            .change_access_permission(pid, va, size, permissions);
        if changed {
            state.apply_page_permissions(pid, va, size);
        }
        changed
    }

    /// Decide a protection fault: copy a copy-on-write page, or deny and signal.
    /// Returns whether the access can now proceed.
    ///
    /// # Errors
    /// Unmapped memory, or the copy failed for lack of memory.
    pub fn handle_protection_fault(&self, pid: Pid, va: VirtualAddress, access: Access) -> Result<bool, MemoryError> {
        let mut state = self.state.write();
        let page = va.page(state.page_size);
        let entry = state
            .entry(pid, page)
            .ok_or(TranslationError::Unmapped { pid, address: va })?;
        let denied = ProtectionError {
            pid,
            address: va,
            access,
            reason: DenialReason::Page,
        };
        if !state.protection.permits(pid, va, access) {
            let err = ProtectionError {
                reason: DenialReason::Region,
                ..denied
            };
            state.protection.record_violation(&err);
            let state = RwLockWriteGuard::downgrade(state);
            self.fail(state, err.into(), true);
            return Ok(false);
        }
        if entry.permissions().allows(access) {
            return Ok(true);
        }
        if access.is_write() && entry.shared() && entry.copy_on_write() {
            state.resolve_fault(pid, va, access)?;
            return match state.copy_on_write(pid, va) {
                Ok(()) => Ok(true),
                Err(MemoryError::Protection(p)) => {
                    self.fail(RwLockWriteGuard::downgrade(state), p.into(), true);
                    Ok(false)
                }
                Err(e) => Err(e),
            };
        }
        self.fail(RwLockWriteGuard::downgrade(state), denied.into(), true);
        Ok(false)
    }

    /// Fault in the page containing `va` and exempt its frame from replacement.
    ///
    /// # Errors
    /// Unmapped memory or an unresolvable page fault.
    pub fn lock_page(&self, pid: Pid, va: VirtualAddress) -> Result<(), MemoryError> {
        let mut state = self.state.write();
        state.resolve_fault(pid, va, Access::Read)?;
        let frame = state
            .entry(pid, va.page(state.page_size))
            .and_then(|e| e.frame())
            .ok_or(MemoryError::Invariant("locked page is not resident"))?;
        state.allocator.frames_mut().lock_frame(frame)?;
        Ok(())
    }

    /// # Errors
    /// `va` is unmapped or not resident.
    pub fn unlock_page(&self, pid: Pid, va: VirtualAddress) -> Result<(), MemoryError> {
        let mut state = self.state.write();
        let frame = state
            .entry(pid, va.page(state.page_size))
            .and_then(|e| e.frame())
            .ok_or(TranslationError::Unmapped { pid, address: va })?;
        state.allocator.frames_mut().unlock_frame(frame)?;
        Ok(())
    }

    /// # Errors
    /// A frame copy failed; pages moved so far stay moved.
    pub fn defragment_memory(&self) -> Result<DefragReport, MemoryError> {
        self.state.write().defragment()
    }

    /// # Errors
    /// A cache write-back or frame scan failed.
    pub fn compress_physical_memory(&self) -> Result<CompressReport, MemoryError> {
        self.state.write().compress()
    }

    pub fn perform_garbage_collection(&self) -> GcReport {
        self.state.write().collect_garbage()
    }

    /// # Errors
    /// A cache write-back or frame scan failed.
    pub fn force_memory_reclaim(&self) -> Result<ReclaimReport, MemoryError> {
        self.state.write().force_reclaim()
    }

    pub fn flush_tlb(&self) {
        self.state.read().tlb.flush();
        log::debug!("TLB flushed");
    }

    /// Drop every cached translation of `pid`. Returns how many were dropped.
    pub fn flush_process_tlb(&self, pid: Pid) -> usize {
        self.state.read().tlb.invalidate_all(pid)
    }

    /// Write every dirty cache line back. Returns how many were written.
    ///
    /// # Errors
    /// The store rejected a write.
    pub fn flush_cache(&self) -> Result<usize, MemoryError> {
        Ok(self.state.read().cache.flush_all()?)
    }

    pub fn set_allocation_strategy(&self, strategy: AllocationStrategy) {
        let mut state = self.state.write();
        state.allocator.set_strategy(strategy);
        state.config.allocation_strategy = strategy;
        log::info!("allocation strategy: {strategy}");
    }

    pub fn set_page_replacement_strategy(&self, policy: ReplacementPolicyKind) {
        let mut state = self.state.write();
        state.policy = policy_for(policy);
        state.config.replacement_policy = policy;
        log::info!("replacement policy: {policy}");
    }

    /// Resize both TLB levels, dropping what no longer fits.
    ///
    /// # Errors
    /// Either capacity is zero.
    pub fn set_tlb_capacity(&self, l1: usize, l2: usize) -> Result<(), MemoryError> {
        if l1 == 0 || l2 == 0 {
            return Err(ConfigError::ZeroTlbCapacity { l1, l2 }.into());
        }
        let mut state = self.state.write();
        state.tlb.set_capacity(l1, l2);
        state.config.tlb_l1_capacity = l1;
        state.config.tlb_l2_capacity = l2;
        log::info!("TLB capacity: L1 {l1}, L2 {l2}");
        Ok(())
    }

    /// Apply a change to the live configuration if it still validates.
    fn update_config(&self, f: impl FnOnce(&mut MemoryConfig)) -> Result<(), MemoryError> {
        let mut state = self.state.write();
        let mut config = state.config.clone();
        f(&mut config);
        config.validate()?;
        state.config = config;
        Ok(())
    }

    /// # Errors
    /// `ratio` is outside `0.0..=1.0`.
    pub fn set_swap_threshold(&self, ratio: f64) -> Result<(), MemoryError> {
        self.update_config(|c| c.swap_threshold = ratio)
    }

    /// # Errors
    /// `ratio` is outside `0.1..=16.0`.
    pub fn set_overcommit_ratio(&self, ratio: f64) -> Result<(), MemoryError> {
        self.update_config(|c| c.overcommit_ratio = ratio)
    }

    pub fn set_violation_history(&self, entries: usize) {
        let mut state = self.state.write();
        state.protection.set_history(entries);
        state.config.violation_history = entries;
    }

    /// Rebuild the manager with a new configuration, including geometry.
    ///
    /// # Errors
    /// [`MemoryError::Busy`] while any process owns memory, or the new
    /// configuration is invalid; the old state is kept in both cases.
    pub fn reconfigure(&self, config: MemoryConfig) -> Result<(), MemoryError> {
        let mut state = self.state.write();
        let busy = state.busy_processes();
        if busy > 0 {
            return Err(MemoryError::Busy(busy));
        }
        let fresh = VmState::new(config)?;
        let mut flusher = self.flusher.lock();
        if let Some(daemon) = flusher.take() {
            daemon.stop();
        }
        *state = fresh;
        *flusher = start_flusher(&state);
        log::info!("memory manager reconfigured");
        Ok(())
    }

    #[must_use]
    pub fn statistics(&self) -> MemoryStatsSnapshot {
        let state = self.state.read();
        let (tlb_l1, tlb_l2) = state.tlb.stats();
        let frames = state.allocator.frames();
        MemoryStatsSnapshot {
            tlb_l1,
            tlb_l2,
            cache: state.cache.stats(),
            total_frames: frames.total(),
            free_frames: frames.free_count(),
            swap_slots: state.swap.total_slots(),
            swap_slots_used: state.swap.used_slots(),
            processes: state.spaces.len(),
            usage_ratio: state.allocator.usage_ratio(),
            fragmentation: state.allocator.fragmentation(),
            ..MemoryStatsSnapshot::counters(&state.stats)
        }
    }

    #[must_use]
    pub fn process_statistics(&self, pid: Pid) -> Option<ProcessStats> {
        self.state.read().stats.process(pid)
    }

    /// Most recent protection violations, oldest first.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.state.read().protection.violations()
    }

    /// Regions of `pid` in address order.
    #[must_use]
    pub fn regions(&self, pid: Pid) -> Vec<Region> {
        self.state
            .read()
            .spaces
            .get(&pid)
            .map(|s| s.regions().copied().collect())
            .unwrap_or_default()
    }

    /// Write every region of every process to `path`.
    ///
    /// # Errors
    /// File I/O, or a swap read failed.
    pub fn create_memory_dump(&self, path: impl AsRef<Path>) -> Result<DumpSummary, MemoryError> {
        let mut out = BufWriter::new(File::create(path.as_ref())?);
        self.state.write().write_dump(&mut out)
    }

    /// Recreate the regions stored in `path`.
    ///
    /// # Errors
    /// File I/O, a malformed dump or one with another page size, or a region
    /// that overlaps existing memory. Regions before the failing one stay loaded.
    pub fn load_memory_dump(&self, path: impl AsRef<Path>) -> Result<DumpSummary, MemoryError> {
        let mut input = BufReader::new(File::open(path.as_ref())?);
        self.state.write().load_dump(&mut input)
    }

    /// Stop the background flusher and write every dirty cache line back.
    pub fn shutdown(&self) {
        let daemon = self.flusher.lock().take();
        if let Some(daemon) = daemon {
            daemon.stop();
        }
        match self.state.read().cache.flush_all() {
            Ok(n) => log::info!("memory manager shut down ({n} lines flushed)"),
            Err(e) => log::warn!("final cache flush failed: {e}"),
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
