//! Free Segment Map: one bit per segment, `1` = in-use or reserved.
//!
//! Cleared bits are exactly the allocator's candidate pool. The map hands
//! out segments with a circular first-fit scan from a caller-supplied hint;
//! wraparound is a deliberate policy choice here (the bitmap is treated as
//! circular over the non-reserved range) rather than an inherited guarantee.

use cfs_error::{CfsError, Result};
use cfs_types::{SegGeometry, SegNo};

// ── Bit helpers ─────────────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bit_get(bits: &[u8], idx: u64) -> bool {
    let Ok(byte_idx) = usize::try_from(idx / 8) else {
        return false;
    };
    if byte_idx >= bits.len() {
        return false;
    }
    (bits[byte_idx] >> (idx % 8)) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bit_set(bits: &mut [u8], idx: u64) {
    let Ok(byte_idx) = usize::try_from(idx / 8) else {
        return;
    };
    if byte_idx < bits.len() {
        bits[byte_idx] |= 1 << (idx % 8);
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bit_clear(bits: &mut [u8], idx: u64) {
    let Ok(byte_idx) = usize::try_from(idx / 8) else {
        return;
    };
    if byte_idx < bits.len() {
        bits[byte_idx] &= !(1 << (idx % 8));
    }
}

/// Count set bits in the first `count` bits of `bits`.
#[must_use]
pub fn count_set_bits(bits: &[u8], count: u64) -> u64 {
    (0..count).filter(|&idx| bit_get(bits, idx)).count() as u64
}

/// Find the first zero bit in `[lo, total)`, scanning from `from` and
/// wrapping around to `lo`.
#[must_use]
pub fn find_zero_bit_circular(bits: &[u8], lo: u64, total: u64, from: u64) -> Option<u64> {
    let from = if (lo..total).contains(&from) { from } else { lo };
    for idx in from..total {
        if !bit_get(bits, idx) {
            return Some(idx);
        }
    }
    (lo..from).find(|&idx| !bit_get(bits, idx))
}

// ── Free segment map ────────────────────────────────────────────────────────

/// Bitmap over all segments plus a free count and the first segment number
/// eligible for allocation (leading metadata segments are never handed out).
#[derive(Debug)]
pub struct FreeSegmap {
    bits: Vec<u8>,
    free_count: u64,
    start_segno: u64,
    total_segs: u64,
}

impl FreeSegmap {
    /// Create a map with every segment provisionally marked in-use.
    ///
    /// This is the restore-time starting state; bits are cleared afterwards
    /// for segments the SIT shows to be empty.
    #[must_use]
    pub fn new_all_inuse(geo: &SegGeometry) -> Self {
        let bytes = (geo.total_segs() as usize).div_ceil(8);
        Self {
            bits: vec![0xFF; bytes],
            free_count: 0,
            start_segno: geo.reserved_segs(),
            total_segs: geo.total_segs(),
        }
    }

    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.free_count
    }

    #[must_use]
    pub fn start_segno(&self) -> SegNo {
        SegNo(self.start_segno)
    }

    #[must_use]
    pub fn is_free(&self, segno: SegNo) -> bool {
        segno.0 < self.total_segs && !bit_get(&self.bits, segno.0)
    }

    /// Find the lowest-numbered free segment at or after `hint` (circular),
    /// mark it in-use, and return it.
    ///
    /// Fails with [`CfsError::NoSpace`] when no segment is free; exhaustion
    /// is not retried here — reclamation is the caller's responsibility.
    pub fn acquire(&mut self, hint: SegNo) -> Result<SegNo> {
        if self.free_count == 0 {
            return Err(CfsError::NoSpace);
        }
        let Some(segno) =
            find_zero_bit_circular(&self.bits, self.start_segno, self.total_segs, hint.0)
        else {
            // free_count said otherwise; the bitmap and the counter disagree.
            return Err(CfsError::corruption(
                0,
                "free segment map: nonzero free count but no clear bit",
            ));
        };
        bit_set(&mut self.bits, segno);
        self.free_count -= 1;
        tracing::trace!(
            target: "cfs::segmap",
            segno,
            hint = hint.0,
            free_left = self.free_count,
            "segment acquired"
        );
        Ok(SegNo(segno))
    }

    /// Return `segno` to the candidate pool. Reclaimer-only.
    pub fn release(&mut self, segno: SegNo) -> Result<()> {
        if segno.0 < self.start_segno || segno.0 >= self.total_segs {
            return Err(CfsError::corruption(
                0,
                format!("release of out-of-range segment {segno}"),
            ));
        }
        if !bit_get(&self.bits, segno.0) {
            return Err(CfsError::corruption(
                0,
                format!("double release of segment {segno}"),
            ));
        }
        bit_clear(&mut self.bits, segno.0);
        self.free_count += 1;
        Ok(())
    }

    /// Clear the bit for a segment known to hold no valid blocks.
    ///
    /// Restore-time only; segments below the eligible range stay marked.
    pub(crate) fn set_free(&mut self, segno: SegNo) {
        if segno.0 < self.start_segno || segno.0 >= self.total_segs {
            return;
        }
        if bit_get(&self.bits, segno.0) {
            bit_clear(&mut self.bits, segno.0);
            self.free_count += 1;
        }
    }

    /// Mark a segment in-use regardless of its current state, returning
    /// whether the bit was newly set.
    pub(crate) fn mark_inuse(&mut self, segno: SegNo) -> bool {
        if segno.0 >= self.total_segs {
            return false;
        }
        if bit_get(&self.bits, segno.0) {
            return false;
        }
        bit_set(&mut self.bits, segno.0);
        self.free_count -= 1;
        true
    }
}
