mod common;

use common::{PS, pattern, small};
use kernel_alloc::{MemorySwap, SwapBackend};
use kernel_info::Pid;
use kernel_mm::{LogSignals, MemoryError, MemoryManager};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-memory swap whose reads and writes fail while `failing` is set.
struct FlakySwap {
    inner: MemorySwap,
    failing: Arc<AtomicBool>,
}

impl FlakySwap {
    fn check(&self) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::other("swap device unavailable"));
        }
        Ok(())
    }
}

impl SwapBackend for FlakySwap {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check()?;
        self.inner.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.check()?;
        self.inner.write_at(offset, data)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }
}

fn flaky(frames: u64, swap_slots: u64) -> (MemoryManager, Arc<AtomicBool>) {
    let failing = Arc::new(AtomicBool::new(false));
    let backend = FlakySwap {
        inner: MemorySwap::new(swap_slots * PS),
        failing: Arc::clone(&failing),
    };
    let config = small(frames, swap_slots);
    let mm = MemoryManager::with_swap_backend(config, Arc::new(LogSignals), Box::new(backend)).unwrap();
    (mm, failing)
}

#[test]
fn failed_swap_out_keeps_the_victim_resident() {
    let (mm, failing) = flaky(4, 16);
    let (p1, p2, p3) = (Pid::new(1), Pid::new(2), Pid::new(3));
    let data = pattern(3, 3 * PS as usize);
    let va1 = mm.allocate_memory(p1, 3 * PS).unwrap();
    mm.write_memory(p1, va1, &data).unwrap();
    let va2 = mm.allocate_memory(p2, PS).unwrap();
    mm.write_memory(p2, va2, &[0x5A; 16]).unwrap();
    let before = mm.statistics();
    assert_eq!(before.free_frames, 0);

    failing.store(true, Ordering::SeqCst);
    let va3 = mm.allocate_memory(p3, PS).unwrap();
    assert!(matches!(
        mm.write_memory(p3, va3, &[1]),
        Err(MemoryError::Fault { .. })
    ));
    let after = mm.statistics();
    assert_eq!(after.free_frames, 0);
    assert_eq!(after.swap_slots_used, 0);
    assert_eq!(after.swap_outs, 0);
    assert_eq!(after.evictions, 0);

    failing.store(false, Ordering::SeqCst);
    assert_eq!(mm.read_memory(p1, va1, data.len()).unwrap(), data);
    assert_eq!(mm.read_memory(p2, va2, 16).unwrap(), vec![0x5A; 16]);
    assert_eq!(mm.statistics().major_faults, 0);
    mm.write_memory(p3, va3, &[1]).unwrap();
    assert_eq!(mm.statistics().swap_outs, 1);
}

#[test]
fn failed_swap_in_leaves_the_page_in_swap() {
    let (mm, failing) = flaky(4, 16);
    let (p1, p2) = (Pid::new(1), Pid::new(2));
    let data = pattern(5, 4 * PS as usize);
    let va1 = mm.allocate_memory(p1, 4 * PS).unwrap();
    mm.write_memory(p1, va1, &data).unwrap();
    let va2 = mm.allocate_memory(p2, 4 * PS).unwrap();
    mm.write_memory(p2, va2, &pattern(6, 4 * PS as usize)).unwrap();
    mm.free_memory(p2, va2).unwrap();
    let before = mm.statistics();
    assert_eq!(before.free_frames, 4);
    assert_eq!(before.swap_slots_used, 4);

    failing.store(true, Ordering::SeqCst);
    assert!(matches!(
        mm.read_memory(p1, va1, 1),
        Err(MemoryError::Fault { .. })
    ));
    let after = mm.statistics();
    assert_eq!(after.free_frames, 4);
    assert_eq!(after.swap_slots_used, 4);
    assert_eq!(after.swap_ins, 0);

    failing.store(false, Ordering::SeqCst);
    assert_eq!(mm.read_memory(p1, va1, data.len()).unwrap(), data);
    assert_eq!(mm.statistics().swap_ins, 4);
}
