//! Segment Information Table: per-segment liveness metadata and the dirty
//! index consumed by the flush path.
//!
//! The flat entry array owns every [`SegEntry`]; [`SitIndex`] tracks which
//! segment numbers changed since the last flush and never owns entry
//! lifetime. The in-memory index is an ordered set — the original's
//! tree-shaped index was an implementation artifact, not a semantic
//! requirement; what matters is O(1)-ish dirty marking and an ordered
//! bounded gang lookup.

use crate::segmap::{bit_clear, bit_get, bit_set, count_set_bits};
use cfs_error::{CfsError, Result};
use cfs_types::{LayoutError, SegGeometry, SegNo, read_le_u16, read_le_u64, write_le_u16, write_le_u64};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;

/// Upper bound on one dirty gang lookup; the flush path batches at this size.
pub const MAX_SIT_GANG: usize = 64;

/// Whether a page transitioned to live or dead in [`SitTable::update_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockChange {
    /// A page became live (`valid_blocks += 1`, bit set).
    Allocated,
    /// A page became dead (`valid_blocks -= 1`, bit cleared).
    Freed,
}

// ── Packed on-media record ──────────────────────────────────────────────────

/// The persisted form of one SIT entry, as packed into tree leaf blocks and
/// the checkpoint journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitRecord {
    pub valid_blocks: u16,
    pub mtime: u64,
    pub valid_map: Vec<u8>,
}

impl SitRecord {
    /// Bytes of one packed record for the given bitmap width.
    #[must_use]
    pub fn encoded_len(map_bytes: usize) -> usize {
        2 + 8 + map_bytes
    }

    /// Pack this record into `out` (which must be exactly one record long).
    pub fn encode_into(&self, out: &mut [u8]) -> std::result::Result<(), LayoutError> {
        write_le_u16(out, 0, self.valid_blocks)?;
        write_le_u64(out, 2, self.mtime)?;
        if out.len() != Self::encoded_len(self.valid_map.len()) {
            return Err(LayoutError::InvalidField {
                field: "sit_record",
                reason: "output length does not match record length",
            });
        }
        out[10..].copy_from_slice(&self.valid_map);
        Ok(())
    }

    /// Unpack a record from `data`.
    pub fn decode(data: &[u8], map_bytes: usize) -> std::result::Result<Self, LayoutError> {
        let valid_blocks = read_le_u16(data, 0)?;
        let mtime = read_le_u64(data, 2)?;
        if data.len() < Self::encoded_len(map_bytes) {
            return Err(LayoutError::InsufficientData {
                needed: Self::encoded_len(map_bytes),
                offset: 0,
                actual: data.len(),
            });
        }
        Ok(Self {
            valid_blocks,
            mtime,
            valid_map: data[10..10 + map_bytes].to_vec(),
        })
    }
}

// ── In-memory entry ─────────────────────────────────────────────────────────

/// One DRAM-resident segment entry.
///
/// Invariant: `valid_blocks == popcount(valid_map)` at all times; every
/// mutation re-checks it and a violation surfaces as corruption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegEntry {
    valid_blocks: u32,
    mtime: u64,
    valid_map: Vec<u8>,
}

impl SegEntry {
    #[must_use]
    pub fn new_empty(map_bytes: usize) -> Self {
        Self {
            valid_blocks: 0,
            mtime: 0,
            valid_map: vec![0u8; map_bytes],
        }
    }

    /// Rebuild an entry from its persisted record.
    ///
    /// The bitmap is the source of truth: when the recorded count disagrees
    /// with its popcount, the count is recomputed and the second element of
    /// the return is `true` so restore can log the correction.
    #[must_use]
    pub fn from_record(rec: &SitRecord, map_bytes: usize) -> (Self, bool) {
        let mut valid_map = rec.valid_map.clone();
        valid_map.resize(map_bytes, 0);
        #[allow(clippy::cast_possible_truncation)] // popcount of P bits fits u32
        let recomputed = count_set_bits(&valid_map, valid_map.len() as u64 * 8) as u32;
        let corrected = recomputed != u32::from(rec.valid_blocks);
        (
            Self {
                valid_blocks: recomputed,
                mtime: rec.mtime,
                valid_map,
            },
            corrected,
        )
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // valid_blocks <= P <= 8192
    pub fn to_record(&self) -> SitRecord {
        SitRecord {
            valid_blocks: self.valid_blocks as u16,
            mtime: self.mtime,
            valid_map: self.valid_map.clone(),
        }
    }

    #[must_use]
    pub fn valid_blocks(&self) -> u32 {
        self.valid_blocks
    }

    #[must_use]
    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    #[must_use]
    pub fn is_block_valid(&self, blkoff: u32) -> bool {
        bit_get(&self.valid_map, u64::from(blkoff))
    }

    #[must_use]
    pub fn popcount(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let n = count_set_bits(&self.valid_map, self.valid_map.len() as u64 * 8) as u32;
        n
    }
}

// ── Dirty index ─────────────────────────────────────────────────────────────

/// Sparse, segment-number-keyed dirty index over the flat entry array.
#[derive(Debug, Default)]
pub struct SitIndex {
    dirty: BTreeSet<u64>,
}

impl SitIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag `segno` dirty, returning whether it was newly tagged.
    pub fn mark_dirty(&mut self, segno: SegNo) -> bool {
        self.dirty.insert(segno.0)
    }

    /// Remove the dirty tag, returning whether it was present.
    pub fn clear_dirty(&mut self, segno: SegNo) -> bool {
        self.dirty.remove(&segno.0)
    }

    #[must_use]
    pub fn is_dirty(&self, segno: SegNo) -> bool {
        self.dirty.contains(&segno.0)
    }

    #[must_use]
    pub fn any_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Up to `limit` dirty segment numbers in ascending order.
    #[must_use]
    pub fn gather(&self, limit: usize) -> Vec<SegNo> {
        self.dirty.iter().take(limit).map(|&s| SegNo(s)).collect()
    }
}

// ── Table ───────────────────────────────────────────────────────────────────

/// The in-memory Segment Information Table: one entry per segment plus the
/// dirty index and the mount-relative modification clock.
#[derive(Debug)]
pub struct SitTable {
    entries: Vec<SegEntry>,
    index: SitIndex,
    pages_per_seg: u32,
    map_bytes: usize,
    elapsed_base: u64,
    mounted_at: Instant,
    written_valid_blocks: u64,
}

impl SitTable {
    /// Allocate the flat array and dirty index, sized to the segment count,
    /// with every entry empty.
    #[must_use]
    pub fn new(geo: &SegGeometry, elapsed_base: u64) -> Self {
        let map_bytes = geo.map_bytes();
        let entries = (0..geo.total_segs())
            .map(|_| SegEntry::new_empty(map_bytes))
            .collect();
        Self {
            entries,
            index: SitIndex::new(),
            pages_per_seg: geo.pages_per_seg(),
            map_bytes,
            elapsed_base,
            mounted_at: Instant::now(),
            written_valid_blocks: 0,
        }
    }

    pub fn entry(&self, segno: SegNo) -> Result<&SegEntry> {
        usize::try_from(segno.0)
            .ok()
            .and_then(|idx| self.entries.get(idx))
            .ok_or_else(|| CfsError::corruption(0, format!("segment {segno} out of range")))
    }

    /// Seconds of cumulative mounted time, the mtime domain.
    #[must_use]
    pub fn mtime_now(&self) -> u64 {
        self.elapsed_base
            .saturating_add(self.mounted_at.elapsed().as_secs())
    }

    /// Apply a single page transition to `segno`'s entry and tag it dirty.
    ///
    /// Double allocate, double free, and a count leaving `[0, P]` are
    /// consistency violations: the operation aborts with corruption instead
    /// of clamping or continuing with a torn invariant.
    pub fn update_entry(&mut self, segno: SegNo, blkoff: u32, change: BlockChange) -> Result<()> {
        if blkoff >= self.pages_per_seg {
            return Err(CfsError::corruption(
                0,
                format!("segment {segno}: page offset {blkoff} out of range"),
            ));
        }
        let pages_per_seg = self.pages_per_seg;
        let mtime = self.mtime_now();
        let idx = usize::try_from(segno.0)
            .ok()
            .filter(|&i| i < self.entries.len())
            .ok_or_else(|| CfsError::corruption(0, format!("segment {segno} out of range")))?;
        let entry = &mut self.entries[idx];

        match change {
            BlockChange::Allocated => {
                if entry.valid_blocks >= pages_per_seg {
                    return Err(CfsError::corruption(
                        0,
                        format!("segment {segno}: valid block count would exceed {pages_per_seg}"),
                    ));
                }
                if bit_get(&entry.valid_map, u64::from(blkoff)) {
                    return Err(CfsError::corruption(
                        0,
                        format!("segment {segno}: double allocate of page {blkoff}"),
                    ));
                }
                bit_set(&mut entry.valid_map, u64::from(blkoff));
                entry.valid_blocks += 1;
                self.written_valid_blocks += 1;
            }
            BlockChange::Freed => {
                if entry.valid_blocks == 0 {
                    return Err(CfsError::corruption(
                        0,
                        format!("segment {segno}: valid block count would underflow"),
                    ));
                }
                if !bit_get(&entry.valid_map, u64::from(blkoff)) {
                    return Err(CfsError::corruption(
                        0,
                        format!("segment {segno}: double free of page {blkoff}"),
                    ));
                }
                bit_clear(&mut entry.valid_map, u64::from(blkoff));
                entry.valid_blocks -= 1;
                self.written_valid_blocks -= 1;
            }
        }
        entry.mtime = mtime;

        // The count/bitmap invariant is re-checked after every mutation.
        if entry.valid_blocks != entry.popcount() {
            return Err(CfsError::corruption(
                0,
                format!(
                    "segment {segno}: valid count {} disagrees with bitmap popcount {}",
                    entry.valid_blocks,
                    entry.popcount()
                ),
            ));
        }

        self.index.mark_dirty(segno);
        tracing::trace!(
            target: "cfs::sit",
            segno = segno.0,
            blkoff,
            change = ?change,
            valid_blocks = entry.valid_blocks,
            "sit entry updated"
        );
        Ok(())
    }

    /// Up to `limit` dirty entries in segment-number order, as persisted
    /// records. Dirty tags are left in place; they are cleared only after
    /// the flush confirms durability.
    #[must_use]
    pub fn gather_dirty(&self, limit: usize) -> Vec<(SegNo, SitRecord)> {
        self.index
            .gather(limit)
            .into_iter()
            .map(|segno| {
                let rec = self.entries[segno.0 as usize].to_record();
                (segno, rec)
            })
            .collect()
    }

    /// Drop the dirty tags of entries a completed flush has persisted.
    pub fn clear_dirty_many(&mut self, segnos: &[SegNo]) {
        for &segno in segnos {
            self.index.clear_dirty(segno);
        }
    }

    #[must_use]
    pub fn any_dirty(&self) -> bool {
        self.index.any_dirty()
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.index.dirty_count()
    }

    /// Total live pages across all segments.
    #[must_use]
    pub fn valid_blocks_total(&self) -> u64 {
        self.written_valid_blocks
    }

    #[must_use]
    pub fn elapsed_base(&self) -> u64 {
        self.elapsed_base
    }

    #[must_use]
    pub fn map_bytes(&self) -> usize {
        self.map_bytes
    }

    /// Install a restored entry without dirtying it (restore path only).
    pub(crate) fn install_entry(&mut self, segno: SegNo, entry: SegEntry) {
        let idx = segno.0 as usize;
        self.written_valid_blocks += u64::from(entry.valid_blocks());
        self.entries[idx] = entry;
    }
}
