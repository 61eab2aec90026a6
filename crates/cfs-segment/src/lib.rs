#![forbid(unsafe_code)]
//! Segment allocation and segment-metadata indexing for CinderFS.
//!
//! This crate decides where new node and data blocks physically land in the
//! persistent-memory log, tracks which pages of each fixed-size segment are
//! live, and persists that liveness crash-consistently through a
//! copy-on-write SIT tree.
//!
//! ## Design
//!
//! The subsystem is layered:
//!
//! 1. **[`segmap`]** — free-segment bitmap with circular first-fit acquire.
//! 2. **[`sit`]** — per-segment entries, dirty index, mount-relative clock.
//! 3. **[`curseg`]** — per-purpose cursors performing log-structured
//!    allocation.
//! 4. **[`tree`]** — the copy-on-write persistent SIT tree.
//! 5. **[`SegmentManager`]** — the allocator context owning all of the
//!    above, one value per mounted volume (never process-wide state).
//!
//! Lock discipline: one mutex per purpose cursor, one mutex over the SIT
//! table, a reader/writer lock over the free map. The cursor lock is always
//! taken before the SIT lock; the free map is only touched from rollover
//! and from the reclaimer's release path.

pub mod build;
pub mod curseg;
pub mod segmap;
pub mod sit;
pub mod summary;
pub mod tree;

pub use build::{CheckpointView, SIT_JOURNAL_CAP};
pub use curseg::AllocPurpose;
pub use segmap::FreeSegmap;
pub use sit::{BlockChange, MAX_SIT_GANG, SegEntry, SitRecord};
pub use summary::{SummaryBlock, SummaryEntry};
pub use tree::{FlushEpoch, NodeBlockAllocator};

use crate::curseg::CursegInfo;
use crate::sit::SitTable;
use crate::summary::{load_summary_block, store_summary_block};
use cfs_error::{CfsError, Result};
use cfs_pmem::PmemDevice;
use cfs_types::{BlockAddr, SegGeometry, SegNo};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// The allocator context for one mounted volume.
///
/// All mutable allocator state lives in this value — per-purpose cursors,
/// the flat segment table, the free bitmap — so multiple mounted volumes
/// coexist without hidden globals.
pub struct SegmentManager {
    geo: SegGeometry,
    dev: Arc<dyn PmemDevice>,
    free: RwLock<FreeSegmap>,
    sit: Mutex<SitTable>,
    cursegs: [Mutex<CursegInfo>; 2],
}

impl std::fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentManager")
            .field("geo", &self.geo)
            .field("free_segments", &self.free.read().free_count())
            .field("dirty_entries", &self.sit.lock().dirty_count())
            .finish_non_exhaustive()
    }
}

impl SegmentManager {
    /// Restore the manager from checkpoint state at mount time.
    pub fn build(
        dev: Arc<dyn PmemDevice>,
        geo: SegGeometry,
        cp: &CheckpointView,
    ) -> Result<Self> {
        let (table, free, [node_cur, data_cur]) = build::build_tables(dev.as_ref(), &geo, cp)?;
        Ok(Self {
            geo,
            dev,
            free: RwLock::new(free),
            sit: Mutex::new(table),
            cursegs: [Mutex::new(node_cur), Mutex::new(data_cur)],
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &SegGeometry {
        &self.geo
    }

    /// Allocate a data block, recording `owner` in the segment summary.
    pub fn allocate_data_block(&self, owner: SummaryEntry) -> Result<BlockAddr> {
        self.allocate(AllocPurpose::Data, owner)
    }

    /// Allocate a node block, recording `owner` in the segment summary.
    pub fn allocate_node_block(&self, owner: SummaryEntry) -> Result<BlockAddr> {
        self.allocate(AllocPurpose::Node, owner)
    }

    /// Hand out the next physical address of `purpose`'s log.
    ///
    /// The whole sequence — rollover if the active segment is exhausted,
    /// address computation, SIT update, summary write-through, cursor
    /// advance — runs under the purpose's cursor lock, so allocations of
    /// one purpose are serialized while purposes never contend with each
    /// other. Rollover is performed on entry when the previous call
    /// exhausted the segment: the allocation then either fully commits or
    /// does not start.
    fn allocate(&self, purpose: AllocPurpose, owner: SummaryEntry) -> Result<BlockAddr> {
        let mut cur = self.cursegs[purpose.index()].lock();
        if cur.next_blkoff >= self.geo.pages_per_seg() {
            self.rollover(purpose, &mut cur)?;
        }

        let addr = self.geo.addr_of(cur.segno, cur.next_blkoff).ok_or_else(|| {
            CfsError::corruption(
                0,
                format!(
                    "{} cursor out of range: segment {} offset {}",
                    purpose.name(),
                    cur.segno,
                    cur.next_blkoff
                ),
            )
        })?;

        // Cursor lock is held; the SIT lock nests inside it.
        self.sit
            .lock()
            .update_entry(cur.segno, cur.next_blkoff, BlockChange::Allocated)?;

        let blkoff = cur.next_blkoff;
        cur.sum_blk.set(blkoff, owner)?;
        cur.next_blkoff += 1;
        Ok(addr)
    }

    /// Mark the page at `addr` dead.
    ///
    /// Takes only the SIT lock: the target may belong to a segment no
    /// cursor currently owns (overwrite of old data, reclamation).
    pub fn invalidate_block(&self, addr: BlockAddr) -> Result<()> {
        let (segno, blkoff) = self.geo.split_addr(addr).ok_or_else(|| {
            CfsError::corruption(addr.0, "invalidate of address outside the main area")
        })?;
        self.sit.lock().update_entry(segno, blkoff, BlockChange::Freed)
    }

    /// Write every dirty SIT entry into a copy-on-write update of the tree
    /// rooted at `old_root`, returning the new root for the checkpoint
    /// collaborator to republish.
    ///
    /// The old root's tree is never mutated; until the caller republishes,
    /// a crash leaves the previous checkpoint fully intact. The caller
    /// serializes flush epochs and quiesces allocation for the duration
    /// (this layer is not the checkpoint's timer). With no dirty entries
    /// this returns `old_root` and writes nothing.
    pub fn flush_dirty_sit(&self, old_root: BlockAddr) -> Result<BlockAddr> {
        let mut epoch = FlushEpoch::new();
        let mut root = old_root;
        let mut flushed = 0usize;

        loop {
            let batch = self.sit.lock().gather_dirty(MAX_SIT_GANG);
            if batch.is_empty() {
                break;
            }
            root = tree::flush(self.dev.as_ref(), &self.geo, &mut epoch, root, &batch, self)?;
            self.dev.sync()?;

            // Durability confirmed; only now do the tags come off.
            let segnos: Vec<SegNo> = batch.iter().map(|(segno, _)| *segno).collect();
            self.sit.lock().clear_dirty_many(&segnos);
            flushed += segnos.len();
        }

        if flushed > 0 {
            tracing::debug!(
                target: "cfs::tree",
                entries = flushed,
                old_root = old_root.0,
                new_root = root.0,
                "dirty SIT entries flushed"
            );
        }
        Ok(root)
    }

    /// Reverse lookup from a physical address to its owner summary.
    ///
    /// Active cursor segments answer from the in-memory summary block; all
    /// others read the SSA.
    pub fn summary_entry_for(&self, addr: BlockAddr) -> Result<SummaryEntry> {
        let (segno, blkoff) = self.geo.split_addr(addr).ok_or_else(|| {
            CfsError::corruption(addr.0, "summary lookup outside the main area")
        })?;
        for purpose in AllocPurpose::ALL {
            let cur = self.cursegs[purpose.index()].lock();
            if cur.segno == segno {
                return cur.sum_blk.get(blkoff);
            }
        }
        load_summary_block(self.dev.as_ref(), &self.geo, segno)?.get(blkoff)
    }

    /// Persist the active cursors' summary blocks to the SSA (checkpoint
    /// time; rollover persists them on segment exit).
    pub fn persist_active_summaries(&self) -> Result<()> {
        for purpose in AllocPurpose::ALL {
            let cur = self.cursegs[purpose.index()].lock();
            store_summary_block(self.dev.as_ref(), &self.geo, cur.segno, &cur.sum_blk)?;
        }
        self.dev.sync()
    }

    /// Return an empty segment to the candidate pool. Reclaimer-only.
    pub fn release_segment(&self, segno: SegNo) -> Result<()> {
        for purpose in AllocPurpose::ALL {
            let cur = self.cursegs[purpose.index()].lock();
            if cur.segno == segno || cur.next_segno == Some(segno) {
                return Err(CfsError::corruption(
                    0,
                    format!("release of active {} segment {segno}", purpose.name()),
                ));
            }
        }
        let valid = self.sit.lock().entry(segno)?.valid_blocks();
        if valid != 0 {
            return Err(CfsError::corruption(
                0,
                format!("release of segment {segno} holding {valid} valid blocks"),
            ));
        }
        self.free.write().release(segno)
    }

    /// Current `(segno, next_blkoff)` of a purpose, for checkpoint capture.
    #[must_use]
    pub fn cursor_position(&self, purpose: AllocPurpose) -> (SegNo, u32) {
        let cur = self.cursegs[purpose.index()].lock();
        (cur.segno, cur.next_blkoff)
    }

    /// Free segments remaining (reader side of the free-map lock).
    #[must_use]
    pub fn free_segments(&self) -> u64 {
        self.free.read().free_count()
    }

    /// SIT entries modified since the last flush.
    #[must_use]
    pub fn dirty_entries(&self) -> usize {
        self.sit.lock().dirty_count()
    }

    /// Live pages across all segments.
    #[must_use]
    pub fn valid_blocks_total(&self) -> u64 {
        self.sit.lock().valid_blocks_total()
    }

    /// Cumulative mounted seconds (the mtime clock), for checkpoint capture.
    #[must_use]
    pub fn elapsed_secs(&self) -> u64 {
        self.sit.lock().mtime_now()
    }

    /// Switch a cursor from its exhausted segment to a successor.
    ///
    /// Adopts the pre-claimed `next_segno` when one exists (its bit is
    /// already set), otherwise acquires directly; then eagerly pre-claims a
    /// fresh successor so the next rollover never stalls. The outgoing
    /// segment's summary block is persisted on the way out. Failing to
    /// pre-claim is not an error for the allocation in flight — the next
    /// rollover reports exhaustion if the pool is still empty.
    fn rollover(&self, purpose: AllocPurpose, cur: &mut CursegInfo) -> Result<()> {
        let old_segno = cur.segno;
        store_summary_block(self.dev.as_ref(), &self.geo, old_segno, &cur.sum_blk)?;

        let adopted = match cur.next_segno.take() {
            Some(segno) => segno,
            None => self
                .free
                .write()
                .acquire(SegNo(old_segno.0.wrapping_add(1)))?,
        };
        cur.reset_to(adopted, self.geo.pages_per_seg());

        match self.free.write().acquire(SegNo(adopted.0.wrapping_add(1))) {
            Ok(next) => cur.next_segno = Some(next),
            Err(CfsError::NoSpace) => {
                tracing::warn!(
                    target: "cfs::curseg",
                    purpose = purpose.name(),
                    segno = adopted.0,
                    "no free segment left to pre-claim"
                );
                cur.next_segno = None;
            }
            Err(e) => return Err(e),
        }

        tracing::debug!(
            target: "cfs::curseg",
            purpose = purpose.name(),
            from = old_segno.0,
            to = adopted.0,
            next = cur.next_segno.map(|s| s.0),
            "segment rollover"
        );
        Ok(())
    }
}

impl NodeBlockAllocator for SegmentManager {
    /// Raw bump allocation off the node cursor for SIT tree blocks.
    ///
    /// Deliberately skips SIT accounting and summary write-through: tree
    /// blocks are live iff reachable from a published root, and entering
    /// them into the SIT would make the flush dirty its own metadata.
    fn alloc_node_block(&self) -> Result<BlockAddr> {
        let mut cur = self.cursegs[AllocPurpose::Node.index()].lock();
        if cur.next_blkoff >= self.geo.pages_per_seg() {
            self.rollover(AllocPurpose::Node, &mut cur)?;
        }
        let addr = self.geo.addr_of(cur.segno, cur.next_blkoff).ok_or_else(|| {
            CfsError::corruption(
                0,
                format!(
                    "node cursor out of range: segment {} offset {}",
                    cur.segno, cur.next_blkoff
                ),
            )
        })?;
        cur.next_blkoff += 1;
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_pmem::RamPmem;
    use cfs_types::OwnerId;

    fn geo() -> SegGeometry {
        // 256-byte pages, 4 pages per segment, 16 segments, tree height 1.
        SegGeometry::new(256, 4, 16, 0, 4096, 1024, 1).expect("geometry")
    }

    fn fresh_manager() -> SegmentManager {
        let g = geo();
        let dev = Arc::new(RamPmem::new(64 * 1024));
        let cp = CheckpointView {
            cur_node_segno: SegNo(0),
            cur_node_blkoff: 0,
            cur_data_segno: SegNo(1),
            cur_data_blkoff: 0,
            sit_root: BlockAddr::NULL,
            sit_journal: Vec::new(),
            elapsed_secs: 0,
        };
        SegmentManager::build(dev, g, &cp).expect("build")
    }

    fn owner(n: u64) -> SummaryEntry {
        SummaryEntry {
            owner: OwnerId(n),
            ofs_in_owner: 0,
        }
    }

    #[test]
    fn allocations_follow_log_order() {
        let mgr = fresh_manager();
        let g = *mgr.geometry();

        let a0 = mgr.allocate_data_block(owner(1)).unwrap();
        let a1 = mgr.allocate_data_block(owner(2)).unwrap();
        assert_eq!(g.split_addr(a0), Some((SegNo(1), 0)));
        assert_eq!(g.split_addr(a1), Some((SegNo(1), 1)));
        assert_eq!(mgr.valid_blocks_total(), 2);
        assert_eq!(mgr.cursor_position(AllocPurpose::Data), (SegNo(1), 2));
    }

    #[test]
    fn purposes_use_separate_segments() {
        let mgr = fresh_manager();
        let g = *mgr.geometry();

        let data = mgr.allocate_data_block(owner(1)).unwrap();
        let node = mgr.allocate_node_block(owner(2)).unwrap();
        let (dseg, _) = g.split_addr(data).unwrap();
        let (nseg, _) = g.split_addr(node).unwrap();
        assert_ne!(dseg, nseg);
    }

    #[test]
    fn rollover_moves_to_a_previously_free_segment() {
        let mgr = fresh_manager();
        let g = *mgr.geometry();
        let pages = g.pages_per_seg();

        let mut addrs = Vec::new();
        for i in 0..=pages {
            addrs.push(mgr.allocate_data_block(owner(u64::from(i))).unwrap());
        }

        // First P allocations fill segment 1; the (P+1)-th lands at offset 0
        // of a different segment.
        let (first_seg, _) = g.split_addr(addrs[0]).unwrap();
        let (new_seg, new_off) = g.split_addr(addrs[pages as usize]).unwrap();
        assert_eq!(first_seg, SegNo(1));
        assert_ne!(new_seg, first_seg);
        assert_eq!(new_off, 0);

        // The adopted segment is marked in-use and a successor is
        // pre-claimed.
        let (cur_seg, _) = mgr.cursor_position(AllocPurpose::Data);
        assert_eq!(cur_seg, new_seg);
    }

    #[test]
    fn sequential_allocations_never_collide() {
        let mgr = fresh_manager();
        let mut seen = std::collections::HashSet::new();
        // 14 segments available to the data log (16 minus two cursors),
        // stay under that times P.
        for i in 0..40u64 {
            let addr = mgr.allocate_data_block(owner(i)).unwrap();
            assert!(seen.insert(addr.0), "duplicate address {addr}");
        }
    }

    #[test]
    fn allocate_then_invalidate_is_inverse() {
        let mgr = fresh_manager();

        let before = mgr.valid_blocks_total();
        let addr = mgr.allocate_data_block(owner(9)).unwrap();
        assert_eq!(mgr.valid_blocks_total(), before + 1);

        mgr.invalidate_block(addr).unwrap();
        assert_eq!(mgr.valid_blocks_total(), before);

        // The same page cannot be freed twice.
        assert!(matches!(
            mgr.invalidate_block(addr),
            Err(CfsError::Corruption { .. })
        ));
    }

    #[test]
    fn invalidate_rejects_foreign_addresses() {
        let mgr = fresh_manager();
        assert!(mgr.invalidate_block(BlockAddr(7)).is_err());
    }

    #[test]
    fn exhaustion_is_a_hard_failure() {
        let mgr = fresh_manager();
        // Drain the pool: 14 free segments of 4 pages behind the active
        // segment's remaining 4.
        let mut last_err = None;
        for i in 0..200u64 {
            match mgr.allocate_data_block(owner(i)) {
                Ok(_) => {}
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }
        assert!(matches!(last_err, Some(CfsError::NoSpace)));
    }

    #[test]
    fn summary_reverse_lookup_covers_active_and_persisted() {
        let mgr = fresh_manager();
        let g = *mgr.geometry();
        let pages = g.pages_per_seg();

        let tagged = mgr
            .allocate_data_block(SummaryEntry {
                owner: OwnerId(0xABCD),
                ofs_in_owner: 3,
            })
            .unwrap();

        // Active segment answers from memory.
        let summary = mgr.summary_entry_for(tagged).unwrap();
        assert_eq!(summary.owner, OwnerId(0xABCD));
        assert_eq!(summary.ofs_in_owner, 3);

        // Roll the cursor off the segment; the SSA now answers.
        for i in 0..=pages {
            mgr.allocate_data_block(owner(u64::from(i))).unwrap();
        }
        let summary = mgr.summary_entry_for(tagged).unwrap();
        assert_eq!(summary.owner, OwnerId(0xABCD));
    }

    #[test]
    fn flush_persists_and_clears_dirty() {
        let mgr = fresh_manager();
        let g = *mgr.geometry();

        let addr = mgr.allocate_data_block(owner(5)).unwrap();
        assert!(mgr.dirty_entries() > 0);

        let root = mgr.flush_dirty_sit(BlockAddr::NULL).unwrap();
        assert!(!root.is_null());
        assert_eq!(mgr.dirty_entries(), 0);

        let (segno, blkoff) = g.split_addr(addr).unwrap();
        let rec = tree::lookup(mgr.dev.as_ref(), &g, root, segno)
            .unwrap()
            .expect("flushed record");
        assert_eq!(rec.valid_blocks, 1);
        assert!(crate::segmap::bit_get(&rec.valid_map, u64::from(blkoff)));
    }

    #[test]
    fn flush_is_idempotent_without_new_writes() {
        let mgr = fresh_manager();

        mgr.allocate_data_block(owner(1)).unwrap();
        let root1 = mgr.flush_dirty_sit(BlockAddr::NULL).unwrap();

        let pos_before = mgr.cursor_position(AllocPurpose::Node);
        let root2 = mgr.flush_dirty_sit(root1).unwrap();
        assert_eq!(root1, root2);
        // No block allocation happened on the second flush.
        assert_eq!(mgr.cursor_position(AllocPurpose::Node), pos_before);
    }

    #[test]
    fn release_rejects_live_and_active_segments() {
        let mgr = fresh_manager();
        let g = *mgr.geometry();

        let addr = mgr.allocate_data_block(owner(1)).unwrap();
        let (live_seg, _) = g.split_addr(addr).unwrap();
        assert!(mgr.release_segment(live_seg).is_err());

        let (node_seg, _) = mgr.cursor_position(AllocPurpose::Node);
        assert!(mgr.release_segment(node_seg).is_err());
    }

    #[test]
    fn release_returns_reclaimed_segment() {
        let mgr = fresh_manager();
        let g = *mgr.geometry();
        let pages = g.pages_per_seg();

        // Fill segment 1 and roll off it, then invalidate everything in it.
        let mut addrs = Vec::new();
        for i in 0..=pages {
            addrs.push(mgr.allocate_data_block(owner(u64::from(i))).unwrap());
        }
        for addr in &addrs[..pages as usize] {
            mgr.invalidate_block(*addr).unwrap();
        }

        let before = mgr.free_segments();
        mgr.release_segment(SegNo(1)).unwrap();
        assert_eq!(mgr.free_segments(), before + 1);
    }
}
