//! Drives a [`MemoryManager`] through two scenarios and prints what happened.
//!
//! ```text
//! VMSIM_LOG=debug vmsim [dump-path]
//! ```
//!
//! With a path, the state after the pressure scenario is written there as a
//! memory dump.

mod logger;

use kernel_info::{MemoryConfig, Pid};
use kernel_mm::{MemoryError, MemoryManager, MemoryStatsSnapshot};
use kernel_vmem::{Access, Permissions};
use log::LevelFilter;
use logger::StderrLogger;
use std::env;
use std::process::ExitCode;

fn main() -> ExitCode {
    let level = env::var("VMSIM_LOG")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(LevelFilter::Info);
    if let Err(e) = StderrLogger::new(level).init() {
        eprintln!("logger: {e}");
    }

    let dump = env::args().nth(1);
    match run(dump.as_deref()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(dump: Option<&str>) -> Result<(), MemoryError> {
    let mm = MemoryManager::new(MemoryConfig::default())?;
    basic(&mm)?;
    report("basic", &mm.statistics());
    mm.shutdown();

    let mm = MemoryManager::new(
        MemoryConfig::default()
            .with_physical_memory_size(64 * 1024)
            .with_swap_size(1024 * 1024),
    )?;
    pressure(&mm)?;
    report("pressure", &mm.statistics());
    if let Some(path) = dump {
        let summary = mm.create_memory_dump(path)?;
        println!(
            "dump: {} regions, {} pages written to {path}",
            summary.regions, summary.pages
        );
    }
    mm.shutdown();
    Ok(())
}

/// Allocate, fill two pages, read them back, and trip a protection fault.
fn basic(mm: &MemoryManager) -> Result<(), MemoryError> {
    let pid = Pid::new(7);
    let va = mm.allocate_memory(pid, 10_000)?;
    mm.write_memory(pid, va, &[0xAB; 4096])?;
    mm.write_memory(pid, va + 4096, &[0xCD; 4096])?;

    let back = mm.read_memory(pid, va, 8192)?;
    let ok = back[..4096].iter().all(|b| *b == 0xAB) && back[4096..].iter().all(|b| *b == 0xCD);
    println!("{pid}: 10000 bytes at {va}, read back {}", if ok { "intact" } else { "CORRUPT" });
    println!("{pid}: {va} -> {}", mm.translate(pid, va)?);

    let ro = mm.create_private_mapping(pid, 4096, Permissions::READ, Some(b"read only"))?;
    if let Err(e) = mm.write_memory(pid, ro, b"nope") {
        println!("{pid}: write to {ro} refused: {e}");
    }
    println!(
        "{pid}: may execute {va}? {}",
        mm.check_memory_permission(pid, va, 1, Access::Execute)
    );
    mm.free_all_process_memory(pid)?;
    Ok(())
}

/// Four processes each touch twice their share of physical memory.
fn pressure(mm: &MemoryManager) -> Result<(), MemoryError> {
    let frames = mm.statistics().total_frames as u64;
    let page = mm.page_size().bytes();
    let size = frames / 2 * page;
    let mut regions = Vec::new();
    for n in 1..=4u8 {
        let pid = Pid::new(u32::from(n));
        let va = mm.allocate_memory(pid, size)?;
        for off in (0..size).step_by(usize::try_from(page).unwrap_or(usize::MAX)) {
            mm.write_memory(pid, va + off, &[n; 64])?;
        }
        regions.push((pid, n, va));
    }

    let mut intact = true;
    for (pid, n, va) in &regions {
        for off in (0..size).step_by(usize::try_from(page).unwrap_or(usize::MAX)) {
            intact &= mm.read_memory(*pid, *va + off, 64)?.iter().all(|b| b == n);
        }
    }
    println!("pressure: {} processes, data {}", regions.len(), if intact { "intact" } else { "CORRUPT" });

    let reclaim = mm.force_memory_reclaim()?;
    println!("pressure: reclaim freed {} frames", reclaim.frames_freed());
    let defrag = mm.defragment_memory()?;
    println!(
        "pressure: defragment moved {} frames, fragmentation {:.3} -> {:.3}",
        defrag.frames_moved, defrag.fragmentation_before, defrag.fragmentation_after
    );
    Ok(())
}

fn report(name: &str, s: &MemoryStatsSnapshot) {
    println!(
        "{name}: {} allocations, {} faults ({} major), fault rate {:.3}, {} evictions, {} swap outs",
        s.allocations,
        s.page_faults(),
        s.major_faults,
        s.fault_rate(),
        s.evictions,
        s.swap_outs
    );
    println!(
        "{name}: TLB L1 {}/{} L2 {}/{}, {} of {} frames free, {} of {} swap slots used",
        s.tlb_l1.hits,
        s.tlb_l1.hits + s.tlb_l1.misses,
        s.tlb_l2.hits,
        s.tlb_l2.hits + s.tlb_l2.misses,
        s.free_frames,
        s.total_frames,
        s.swap_slots_used,
        s.swap_slots
    );
}
