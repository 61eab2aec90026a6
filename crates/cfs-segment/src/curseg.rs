//! Current-segment cursors: the unit that actually hands out block
//! addresses, one per allocation purpose.

use crate::sit::SegEntry;
use crate::summary::SummaryBlock;
use cfs_types::SegNo;
use serde::{Deserialize, Serialize};

/// What a block will hold; each purpose logs into its own segment chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocPurpose {
    /// Node metadata blocks (inode/indirect nodes, SIT tree nodes).
    Node,
    /// File data blocks.
    Data,
}

impl AllocPurpose {
    pub const ALL: [Self; 2] = [Self::Node, Self::Data];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Node => 0,
            Self::Data => 1,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Data => "data",
        }
    }
}

/// The active segment and write position of one allocation purpose.
///
/// `next_segno` is a successor pre-claimed at rollover time so the next
/// rollover never stalls on the Free Segment Map; it is `None` right after
/// restore (the checkpoint does not record one) and after segment
/// exhaustion left nothing to pre-claim.
#[derive(Debug)]
pub struct CursegInfo {
    pub(crate) segno: SegNo,
    pub(crate) next_blkoff: u32,
    pub(crate) next_segno: Option<SegNo>,
    pub(crate) sum_blk: SummaryBlock,
}

impl CursegInfo {
    pub(crate) fn new(segno: SegNo, next_blkoff: u32, sum_blk: SummaryBlock) -> Self {
        Self {
            segno,
            next_blkoff,
            next_segno: None,
            sum_blk,
        }
    }

    #[must_use]
    pub fn segno(&self) -> SegNo {
        self.segno
    }

    #[must_use]
    pub fn next_blkoff(&self) -> u32 {
        self.next_blkoff
    }

    #[must_use]
    pub fn next_segno(&self) -> Option<SegNo> {
        self.next_segno
    }

    /// Point the cursor at a freshly adopted segment.
    pub(crate) fn reset_to(&mut self, segno: SegNo, pages_per_seg: u32) {
        self.segno = segno;
        self.next_blkoff = 0;
        self.sum_blk = SummaryBlock::new_empty(pages_per_seg);
    }

    /// Advance `next_blkoff` past pages the entry already shows valid.
    ///
    /// Restore lands the cursor on the checkpointed offset; blocks written
    /// after that checkpoint are still marked in the validity map and must
    /// not be handed out again.
    pub(crate) fn skip_to_free_offset(&mut self, entry: &SegEntry, pages_per_seg: u32) {
        let mut ofs = self.next_blkoff;
        while ofs < pages_per_seg && entry.is_block_valid(ofs) {
            ofs += 1;
        }
        self.next_blkoff = ofs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sit::{BlockChange, SitTable};
    use cfs_types::SegGeometry;

    fn geo() -> SegGeometry {
        SegGeometry::new(256, 4, 8, 0, 65536, 1024, 1).expect("geometry")
    }

    #[test]
    fn purpose_indexes_are_stable() {
        assert_eq!(AllocPurpose::Node.index(), 0);
        assert_eq!(AllocPurpose::Data.index(), 1);
        assert_eq!(AllocPurpose::ALL.len(), 2);
    }

    #[test]
    fn reset_clears_offset_and_summaries() {
        let mut cur = CursegInfo::new(SegNo(3), 2, SummaryBlock::new_empty(4));
        cur.next_segno = Some(SegNo(5));
        cur.reset_to(SegNo(5), 4);
        assert_eq!(cur.segno(), SegNo(5));
        assert_eq!(cur.next_blkoff(), 0);
        assert_eq!(cur.sum_blk, SummaryBlock::new_empty(4));
    }

    #[test]
    fn skip_to_free_offset_walks_past_valid_blocks() {
        let g = geo();
        let mut table = SitTable::new(&g, 0);
        // Blocks 0..3 live, block 3 free.
        for blkoff in 0..3 {
            table
                .update_entry(SegNo(2), blkoff, BlockChange::Allocated)
                .unwrap();
        }

        let mut cur = CursegInfo::new(SegNo(2), 0, SummaryBlock::new_empty(4));
        cur.skip_to_free_offset(table.entry(SegNo(2)).unwrap(), 4);
        assert_eq!(cur.next_blkoff(), 3);

        // A fully valid segment skips to the exhausted position.
        table
            .update_entry(SegNo(2), 3, BlockChange::Allocated)
            .unwrap();
        let mut full = CursegInfo::new(SegNo(2), 0, SummaryBlock::new_empty(4));
        full.skip_to_free_offset(table.entry(SegNo(2)).unwrap(), 4);
        assert_eq!(full.next_blkoff(), 4);
    }
}
