//! Property tests for the manager: memory behaves like a flat byte array per
//! process no matter how often pages move between frames and swap, and
//! processes never see each other's frames.

mod common;

use common::{PS, small};
use kernel_info::Pid;
use kernel_mm::MemoryManager;
use proptest::prelude::*;
use std::collections::BTreeSet;

const PAGES: u64 = 12;

#[derive(Debug, Clone)]
struct Write {
    offset: usize,
    bytes: Vec<u8>,
}

fn arb_write() -> impl Strategy<Value = Write> {
    let len = (PAGES * PS) as usize;
    (0..len, prop::collection::vec(any::<u8>(), 1..=2 * PS as usize)).prop_map(move |(offset, mut bytes)| {
        bytes.truncate(len - offset);
        Write { offset, bytes }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn memory_matches_a_flat_model(writes in prop::collection::vec(arb_write(), 1..24)) {
        let mm = MemoryManager::new(small(8, 64)).unwrap();
        let pid = Pid::new(1);
        let len = (PAGES * PS) as usize;
        let va = mm.allocate_memory(pid, len as u64).unwrap();
        let mut model = vec![0u8; len];

        for w in &writes {
            mm.write_memory(pid, va + w.offset as u64, &w.bytes).unwrap();
            model[w.offset..w.offset + w.bytes.len()].copy_from_slice(&w.bytes);
        }
        prop_assert_eq!(mm.read_memory(pid, va, len).unwrap(), model);
    }

    #[test]
    fn processes_never_share_frames(sizes in prop::collection::vec(1u64..=4, 1..6)) {
        let mm = MemoryManager::new(small(64, 64)).unwrap();
        let mut seen = BTreeSet::new();
        for (i, pages) in sizes.iter().enumerate() {
            let pid = Pid::new(i as u32 + 1);
            let len = (pages * PS) as usize;
            let va = mm.allocate_memory(pid, len as u64).unwrap();
            mm.write_memory(pid, va, &vec![i as u8 + 1; len]).unwrap();
            for p in 0..*pages {
                let frame = mm.translate(pid, va + p * PS).unwrap().as_u64() / PS;
                prop_assert!(seen.insert(frame), "frame {} mapped twice", frame);
            }
        }
        for (i, pages) in sizes.iter().enumerate() {
            let pid = Pid::new(i as u32 + 1);
            let va = mm.regions(pid)[0].start;
            let len = (pages * PS) as usize;
            prop_assert_eq!(mm.read_memory(pid, va, len).unwrap(), vec![i as u8 + 1; len]);
        }
    }

    #[test]
    fn fragmentation_stays_in_unit_interval(
        ops in prop::collection::vec((any::<bool>(), 1u64..=3, any::<usize>()), 1..40),
    ) {
        let mm = MemoryManager::new(small(16, 32)).unwrap();
        let mut live = Vec::new();
        for (alloc, pages, pick) in ops {
            let pid = Pid::new(1 + (pick % 3) as u32);
            if alloc || live.is_empty() {
                if let Ok(va) = mm.allocate_memory(pid, pages * PS) {
                    live.push((pid, va));
                }
            } else {
                let (pid, va) = live.swap_remove(pick % live.len());
                mm.free_memory(pid, va).unwrap();
            }
            let f = mm.statistics().fragmentation;
            prop_assert!((0.0..=1.0).contains(&f), "fragmentation {}", f);
        }
        let report = mm.defragment_memory().unwrap();
        prop_assert!(report.fragmentation_after <= report.fragmentation_before + f64::EPSILON);
    }
}
