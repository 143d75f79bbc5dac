mod common;

use common::{PS, pattern, small};
use kernel_info::{MemoryConfig, Pid};
use kernel_mm::MemoryManager;
use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: u32 = 4;

fn hammer(mm: &Arc<MemoryManager>, pages: u64, rounds: u8) {
    let barrier = Arc::new(Barrier::new(THREADS as usize));
    let handles: Vec<_> = (1..=THREADS)
        .map(|n| {
            let mm = Arc::clone(mm);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let pid = Pid::new(n);
                let len = (pages * mm.page_size().bytes()) as usize;
                let va = mm.allocate_memory(pid, len as u64).unwrap();
                barrier.wait();
                for round in 0..rounds {
                    let seed = (n as u8).wrapping_mul(17).wrapping_add(round);
                    mm.write_memory(pid, va, &pattern(seed, len)).unwrap();
                    assert_eq!(mm.read_memory(pid, va, len).unwrap(), pattern(seed, len));
                }
                mm.free_all_process_memory(pid).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn independent_processes_on_the_default_machine() {
    let mm = Arc::new(MemoryManager::new(MemoryConfig::default()).unwrap());
    hammer(&mm, 8, 4);
    let stats = mm.statistics();
    assert_eq!(stats.free_frames, stats.total_frames);
    assert_eq!(stats.processes, 0);
}

#[test]
fn independent_processes_under_memory_pressure() {
    let mm = Arc::new(MemoryManager::new(small(8, 64)).unwrap());
    hammer(&mm, 4, 3);
    let stats = mm.statistics();
    assert!(stats.evictions > 0);
    assert_eq!(stats.free_frames, 8);
    assert_eq!(stats.swap_slots_used, 0);
}

#[test]
fn readers_see_a_consistent_shared_page() {
    let mm = Arc::new(MemoryManager::new(small(8, 16)).unwrap());
    let owner = Pid::new(1);
    let va = mm.allocate_memory(owner, PS).unwrap();
    mm.write_memory(owner, va, &[9; 64]).unwrap();
    let readers: Vec<_> = (2..=THREADS)
        .map(|n| {
            let vb = mm
                .create_shared_mapping(owner, va, Pid::new(n), PS, false)
                .unwrap();
            (Pid::new(n), vb)
        })
        .collect();

    let handles: Vec<_> = readers
        .into_iter()
        .map(|(pid, vb)| {
            let mm = Arc::clone(&mm);
            thread::spawn(move || {
                for _ in 0..50 {
                    assert_eq!(mm.read_memory(pid, vb, 64).unwrap(), vec![9; 64]);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(mm.statistics().cow_copies, 0);
}
