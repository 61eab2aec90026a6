//! Mount-time reconstruction of the segment manager from checkpoint state.
//!
//! Restore order: flat SIT table and dirty index, free map provisionally
//! all-in-use, per-segment entries from the checkpoint's journal overlay
//! with a persistent-tree lookup as the fallback, cursors from the
//! checkpoint's recorded positions, and finally free-map bits cleared for
//! empty segments with the active cursor segments re-marked in-use.

use crate::curseg::{AllocPurpose, CursegInfo};
use crate::segmap::FreeSegmap;
use crate::sit::{SegEntry, SitRecord, SitTable};
use crate::summary::load_summary_block;
use crate::tree;
use cfs_error::{CfsError, Result};
use cfs_pmem::PmemDevice;
use cfs_types::{BlockAddr, SegGeometry, SegNo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Capacity of the checkpoint's embedded SIT journal: recently modified
/// entries persisted inside the checkpoint record itself, consulted before
/// any tree read.
pub const SIT_JOURNAL_CAP: usize = 6;

/// Segment-manager state consumed from the checkpoint collaborator at
/// mount time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointView {
    pub cur_node_segno: SegNo,
    pub cur_node_blkoff: u32,
    pub cur_data_segno: SegNo,
    pub cur_data_blkoff: u32,
    /// Root of the persisted SIT tree; null on a freshly formatted volume.
    pub sit_root: BlockAddr,
    /// Journaled recent SIT entries, at most [`SIT_JOURNAL_CAP`].
    pub sit_journal: Vec<(SegNo, SitRecord)>,
    /// Cumulative mounted seconds at checkpoint time (mtime base).
    pub elapsed_secs: u64,
}

impl CheckpointView {
    /// Validate checkpoint fields against the geometry before restore.
    pub fn validate(&self, geo: &SegGeometry) -> Result<()> {
        for (purpose, segno, blkoff) in [
            (
                AllocPurpose::Node,
                self.cur_node_segno,
                self.cur_node_blkoff,
            ),
            (
                AllocPurpose::Data,
                self.cur_data_segno,
                self.cur_data_blkoff,
            ),
        ] {
            if segno.0 >= geo.total_segs() {
                return Err(CfsError::Format(format!(
                    "checkpoint {} cursor segment {segno} out of range",
                    purpose.name()
                )));
            }
            if blkoff > geo.pages_per_seg() {
                return Err(CfsError::Format(format!(
                    "checkpoint {} cursor offset {blkoff} past segment end",
                    purpose.name()
                )));
            }
        }
        if self.sit_journal.len() > SIT_JOURNAL_CAP {
            return Err(CfsError::Format(format!(
                "checkpoint SIT journal holds {} entries, capacity {SIT_JOURNAL_CAP}",
                self.sit_journal.len()
            )));
        }
        Ok(())
    }
}

/// Restore the SIT table, free map, and cursors.
pub(crate) fn build_tables(
    dev: &dyn PmemDevice,
    geo: &SegGeometry,
    cp: &CheckpointView,
) -> Result<(SitTable, FreeSegmap, [CursegInfo; 2])> {
    cp.validate(geo)?;

    let mut table = SitTable::new(geo, cp.elapsed_secs);
    let mut free = FreeSegmap::new_all_inuse(geo);

    // Hot segments resolve from the checkpoint journal without a tree read.
    let journal: BTreeMap<u64, &SitRecord> =
        cp.sit_journal.iter().map(|(s, r)| (s.0, r)).collect();

    let mut corrections = 0u64;
    for segno in 0..geo.total_segs() {
        let record = match journal.get(&segno) {
            Some(rec) => Some((*rec).clone()),
            None => tree::lookup(dev, geo, cp.sit_root, SegNo(segno))?,
        };
        let Some(record) = record else {
            // Never persisted: stays the empty entry the table started with.
            continue;
        };
        let (entry, corrected) = SegEntry::from_record(&record, geo.map_bytes());
        if corrected {
            corrections += 1;
            tracing::warn!(
                target: "cfs::build",
                segno,
                recorded = record.valid_blocks,
                recomputed = entry.valid_blocks(),
                "restored valid-block count from persisted bitmap"
            );
        }
        table.install_entry(SegNo(segno), entry);
    }

    // Cursors come from the checkpoint, summaries from the SSA; the write
    // position skips pages already valid past the recorded offset.
    let node_sum = load_summary_block(dev, geo, cp.cur_node_segno)?;
    let mut node_cur = CursegInfo::new(cp.cur_node_segno, cp.cur_node_blkoff, node_sum);
    node_cur.skip_to_free_offset(table.entry(cp.cur_node_segno)?, geo.pages_per_seg());

    let data_sum = load_summary_block(dev, geo, cp.cur_data_segno)?;
    let mut data_cur = CursegInfo::new(cp.cur_data_segno, cp.cur_data_blkoff, data_sum);
    data_cur.skip_to_free_offset(table.entry(cp.cur_data_segno)?, geo.pages_per_seg());

    // Empty segments return to the candidate pool; the active cursor
    // segments must never be handed out while active.
    for segno in 0..geo.total_segs() {
        if table.entry(SegNo(segno))?.valid_blocks() == 0 {
            free.set_free(SegNo(segno));
        }
    }
    free.mark_inuse(node_cur.segno());
    free.mark_inuse(data_cur.segno());

    tracing::debug!(
        target: "cfs::build",
        total_segs = geo.total_segs(),
        free = free.free_count(),
        valid_blocks = table.valid_blocks_total(),
        corrections,
        "segment manager restored"
    );
    Ok((table, free, [node_cur, data_cur]))
}
