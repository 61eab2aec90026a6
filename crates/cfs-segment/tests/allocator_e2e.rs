#![forbid(unsafe_code)]
//! E2E tests for the segment allocator.
//!
//! Scenarios tested:
//! 1. The four-segment reference scenario: two in-segment allocations, then
//!    rollover into a previously free segment with a pre-claimed successor.
//! 2. Checkpoint round trip: flush, rebuild from the new root, resume
//!    allocation without handing out a live address.
//! 3. Concurrent allocation across purposes: every address unique.
//! 4. Concurrent allocate/invalidate keeps the global live count exact.

use cfs_pmem::{PmemDevice, RamPmem};
use cfs_segment::{AllocPurpose, CheckpointView, SegmentManager, SummaryEntry, tree};
use cfs_types::{BlockAddr, OwnerId, SegGeometry, SegNo};
use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex};

fn owner(n: u64) -> SummaryEntry {
    SummaryEntry {
        owner: OwnerId(n),
        ofs_in_owner: 0,
    }
}

fn fresh_checkpoint(node_seg: u64, data_seg: u64) -> CheckpointView {
    CheckpointView {
        cur_node_segno: SegNo(node_seg),
        cur_node_blkoff: 0,
        cur_data_segno: SegNo(data_seg),
        cur_data_blkoff: 0,
        sit_root: BlockAddr::NULL,
        sit_journal: Vec::new(),
        elapsed_secs: 0,
    }
}

// ---------------------------------------------------------------------------
// Scenario 1: four segments, two pages each
// ---------------------------------------------------------------------------

#[test]
fn four_segment_reference_scenario() {
    // TOTAL_SEGS = 4, P = 2. Segment 0 is the data cursor at offset 0,
    // segment 1 is held by the node cursor, segments 2 and 3 are free.
    let geo = SegGeometry::new(256, 2, 4, 0, 4096, 1024, 1).expect("geometry");
    let dev = Arc::new(RamPmem::new(8192));
    let mgr = SegmentManager::build(dev, geo, &fresh_checkpoint(1, 0)).expect("build");

    assert_eq!(mgr.free_segments(), 2);

    // The first two allocations fill segment 0 in log order.
    let a0 = mgr.allocate_data_block(owner(1)).unwrap();
    let a1 = mgr.allocate_data_block(owner(2)).unwrap();
    assert_eq!(geo.split_addr(a0), Some((SegNo(0), 0)));
    assert_eq!(geo.split_addr(a1), Some((SegNo(0), 1)));

    // The third triggers rollover into the first free segment (the scan
    // starts just past segment 0 and skips in-use segment 1), and the
    // remaining free segment is pre-claimed as the successor.
    let a2 = mgr.allocate_data_block(owner(3)).unwrap();
    assert_eq!(geo.split_addr(a2), Some((SegNo(2), 0)));
    assert_eq!(mgr.cursor_position(AllocPurpose::Data), (SegNo(2), 1));
    assert_eq!(mgr.free_segments(), 0);

    // The pre-claimed successor carries the next rollover without touching
    // the (now empty) free pool.
    let a3 = mgr.allocate_data_block(owner(4)).unwrap();
    let a4 = mgr.allocate_data_block(owner(5)).unwrap();
    assert_eq!(geo.split_addr(a3), Some((SegNo(2), 1)));
    assert_eq!(geo.split_addr(a4), Some((SegNo(3), 0)));
}

// ---------------------------------------------------------------------------
// Scenario 2: checkpoint round trip
// ---------------------------------------------------------------------------

fn medium_geo() -> SegGeometry {
    // 256-byte pages, 8 pages per segment, 64 segments, tree height 1.
    SegGeometry::new(256, 8, 64, 0, 65536, 4096, 1).expect("geometry")
}

#[test]
fn checkpoint_round_trip_resumes_cleanly() {
    let geo = medium_geo();
    let dev: Arc<RamPmem> = Arc::new(RamPmem::new(256 * 1024));
    let mgr = SegmentManager::build(Arc::clone(&dev) as Arc<dyn PmemDevice>, geo, &fresh_checkpoint(0, 1))
        .expect("build");

    // A little history: twelve data blocks, one of them invalidated.
    let mut live = Vec::new();
    for i in 0..12u64 {
        live.push(mgr.allocate_data_block(owner(100 + i)).unwrap());
    }
    let dropped = live.remove(4);
    mgr.invalidate_block(dropped).unwrap();

    let root = mgr.flush_dirty_sit(BlockAddr::NULL).unwrap();
    mgr.persist_active_summaries().unwrap();

    let (node_seg, node_off) = mgr.cursor_position(AllocPurpose::Node);
    let (data_seg, data_off) = mgr.cursor_position(AllocPurpose::Data);
    let live_count = mgr.valid_blocks_total();
    drop(mgr);

    // Remount from the published root.
    let cp = CheckpointView {
        cur_node_segno: node_seg,
        cur_node_blkoff: node_off,
        cur_data_segno: data_seg,
        cur_data_blkoff: data_off,
        sit_root: root,
        sit_journal: Vec::new(),
        elapsed_secs: 10,
    };
    let mgr2 = SegmentManager::build(Arc::clone(&dev) as Arc<dyn PmemDevice>, geo, &cp).expect("rebuild");

    assert_eq!(mgr2.valid_blocks_total(), live_count);

    // Summaries survive the remount.
    let summary = mgr2.summary_entry_for(live[0]).unwrap();
    assert_eq!(summary.owner, OwnerId(100));

    // Resumed allocation never hands out a live address.
    let live_set: HashSet<u64> = live.iter().map(|a| a.0).collect();
    for i in 0..20u64 {
        let addr = mgr2.allocate_data_block(owner(200 + i)).unwrap();
        assert!(
            !live_set.contains(&addr.0),
            "live address {addr} handed out again"
        );
    }
}

#[test]
fn old_root_survives_later_flushes() {
    let geo = medium_geo();
    let dev: Arc<RamPmem> = Arc::new(RamPmem::new(256 * 1024));
    let mgr = SegmentManager::build(Arc::clone(&dev) as Arc<dyn PmemDevice>, geo, &fresh_checkpoint(0, 1))
        .expect("build");

    let first = mgr.allocate_data_block(owner(1)).unwrap();
    let (first_seg, _) = geo.split_addr(first).unwrap();
    let root1 = mgr.flush_dirty_sit(BlockAddr::NULL).unwrap();
    let rec1 = tree::lookup(dev.as_ref(), &geo, root1, first_seg)
        .unwrap()
        .expect("persisted record");

    // More history and a second flush epoch.
    for i in 0..10u64 {
        mgr.allocate_data_block(owner(2 + i)).unwrap();
    }
    mgr.invalidate_block(first).unwrap();
    let root2 = mgr.flush_dirty_sit(root1).unwrap();
    assert_ne!(root1, root2);

    // Every leaf reachable from the old root is unchanged.
    let rec1_again = tree::lookup(dev.as_ref(), &geo, root1, first_seg)
        .unwrap()
        .expect("old snapshot record");
    assert_eq!(rec1, rec1_again);

    // The new snapshot reflects the invalidation.
    let rec2 = tree::lookup(dev.as_ref(), &geo, root2, first_seg)
        .unwrap()
        .expect("new snapshot record");
    assert!(rec2.valid_blocks > 0);
    assert_ne!(rec1, rec2);
}

// ---------------------------------------------------------------------------
// Scenario 3: concurrent allocation
// ---------------------------------------------------------------------------

#[test]
fn concurrent_allocations_are_exclusive() {
    let geo = medium_geo();
    let dev = Arc::new(RamPmem::new(256 * 1024));
    let mgr = Arc::new(
        SegmentManager::build(dev, geo, &fresh_checkpoint(0, 1)).expect("build"),
    );

    let threads = 4usize;
    let per_thread = 50u64;
    let barrier = Arc::new(Barrier::new(threads));
    let collected = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..threads)
        .map(|tid| {
            let mgr = Arc::clone(&mgr);
            let barrier = Arc::clone(&barrier);
            let collected = Arc::clone(&collected);
            std::thread::spawn(move || {
                barrier.wait();
                let mut local = Vec::new();
                for i in 0..per_thread {
                    let id = tid as u64 * 1_000 + i;
                    // Alternate purposes across threads.
                    let addr = if tid % 2 == 0 {
                        mgr.allocate_data_block(owner(id)).unwrap()
                    } else {
                        mgr.allocate_node_block(owner(id)).unwrap()
                    };
                    local.push(addr.0);
                }
                collected.lock().unwrap().extend(local);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let addrs = collected.lock().unwrap();
    let unique: HashSet<u64> = addrs.iter().copied().collect();
    assert_eq!(unique.len(), threads * per_thread as usize);
    assert_eq!(mgr.valid_blocks_total(), (threads as u64) * per_thread);
}

// ---------------------------------------------------------------------------
// Scenario 4: allocate/invalidate under contention
// ---------------------------------------------------------------------------

#[test]
fn concurrent_invalidate_keeps_counts_exact() {
    let geo = medium_geo();
    let dev = Arc::new(RamPmem::new(256 * 1024));
    let mgr = Arc::new(
        SegmentManager::build(dev, geo, &fresh_checkpoint(0, 1)).expect("build"),
    );

    let threads = 4usize;
    let per_thread = 40u64;
    let barrier = Arc::new(Barrier::new(threads));

    // Each thread allocates, then invalidates every other block it owns.
    let handles: Vec<_> = (0..threads)
        .map(|tid| {
            let mgr = Arc::clone(&mgr);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let mut mine = Vec::new();
                for i in 0..per_thread {
                    mine.push(mgr.allocate_data_block(owner(tid as u64 * 101 + i)).unwrap());
                }
                for addr in mine.iter().step_by(2) {
                    mgr.invalidate_block(*addr).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total = threads as u64 * per_thread;
    assert_eq!(mgr.valid_blocks_total(), total / 2);
    // Everything that changed is tracked for the next flush.
    assert!(mgr.dirty_entries() > 0);

    let root = mgr.flush_dirty_sit(BlockAddr::NULL).unwrap();
    assert!(!root.is_null());
    assert_eq!(mgr.dirty_entries(), 0);
}
