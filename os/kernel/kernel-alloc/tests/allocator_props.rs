//! Property tests for the placement allocator: whatever sequence of
//! allocations and frees runs, the ledger stays disjoint and the
//! fragmentation index stays in `[0, 1]`.

use kernel_alloc::{Allocator, PhysicalStore};
use kernel_info::{AllocationStrategy, Pid};
use kernel_memory_addresses::{FrameNumber, PageSize};
use proptest::prelude::*;
use std::sync::Arc;

const FRAMES: usize = 32;
const PS: u64 = 512;

#[derive(Debug, Clone)]
enum Op {
    Alloc { pid: u32, bytes: u64 },
    Free { index: usize },
    Release { frame: u64 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u32..4, 1u64..=6 * PS).prop_map(|(pid, bytes)| Op::Alloc { pid, bytes }),
        2 => any::<usize>().prop_map(|index| Op::Free { index }),
        1 => (0u64..FRAMES as u64).prop_map(|frame| Op::Release { frame }),
    ]
}

fn arb_strategy() -> impl Strategy<Value = AllocationStrategy> {
    prop_oneof![
        Just(AllocationStrategy::FirstFit),
        Just(AllocationStrategy::BestFit),
        Just(AllocationStrategy::WorstFit),
        Just(AllocationStrategy::NextFit),
    ]
}

fn new_allocator(strategy: AllocationStrategy) -> Allocator {
    Allocator::new(
        Arc::new(PhysicalStore::new(FRAMES, PageSize::new(PS).unwrap())),
        strategy,
    )
}

proptest! {
    #[test]
    fn fragmentation_stays_in_unit_interval(
        strategy in arb_strategy(),
        ops in prop::collection::vec(arb_op(), 1..80),
    ) {
        let mut a = new_allocator(strategy);
        let mut live = Vec::new();
        for op in ops {
            match op {
                Op::Alloc { pid, bytes } => {
                    if let Ok(pa) = a.allocate(bytes, Pid::new(pid)) {
                        live.push((pa, Pid::new(pid)));
                    }
                }
                Op::Free { index } if !live.is_empty() => {
                    let (pa, pid) = live.swap_remove(index % live.len());
                    a.free(pa, pid);
                }
                Op::Free { .. } => {}
                Op::Release { frame } => {
                    a.release_frame(FrameNumber::new(frame));
                }
            }
            let f = a.fragmentation();
            prop_assert!((0.0..=1.0).contains(&f), "fragmentation {f} out of range");
            let u = a.usage_ratio();
            prop_assert!((0.0..=1.0).contains(&u));
        }
    }

    #[test]
    fn blocks_never_overlap(
        strategy in arb_strategy(),
        ops in prop::collection::vec(arb_op(), 1..80),
    ) {
        let mut a = new_allocator(strategy);
        let mut live = Vec::new();
        for op in ops {
            match op {
                Op::Alloc { pid, bytes } => {
                    if let Ok(pa) = a.allocate(bytes, Pid::new(pid)) {
                        live.push((pa, Pid::new(pid)));
                    }
                }
                Op::Free { index } if !live.is_empty() => {
                    let (pa, pid) = live.swap_remove(index % live.len());
                    a.free(pa, pid);
                }
                Op::Free { .. } => {}
                Op::Release { frame } => {
                    a.release_frame(FrameNumber::new(frame));
                }
            }
            let blocks = a.blocks();
            let mut used = 0usize;
            for pair in blocks.windows(2) {
                let end = pair[0].start.as_u64() + pair[0].frames as u64 * PS;
                prop_assert!(end <= pair[1].start.as_u64());
            }
            for b in &blocks {
                used += b.frames;
            }
            prop_assert_eq!(used, a.frames().allocated_count());
        }
    }
}

#[test]
fn scattered_holes_score_higher_than_one_hole() {
    let pid = Pid::new(1);

    // One contiguous hole.
    let mut compact = new_allocator(AllocationStrategy::FirstFit);
    compact.allocate(16 * PS, pid).unwrap();
    assert_eq!(compact.fragmentation(), 0.0);

    // Same amount of free space split into single-frame holes.
    let mut scattered = new_allocator(AllocationStrategy::FirstFit);
    let pa = scattered.allocate(32 * PS, pid).unwrap();
    assert_eq!(pa.as_u64(), 0);
    for f in (0..32).step_by(2) {
        scattered.release_frame(FrameNumber::new(f));
    }
    assert_eq!(scattered.frames().free_count(), 16);
    assert!(scattered.fragmentation() > compact.fragmentation());
    assert!((scattered.fragmentation() - (1.0 - 1.0 / 16.0)).abs() < 1e-9);
}
