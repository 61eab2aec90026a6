#![forbid(unsafe_code)]
//! Core identifier types and on-media geometry for CinderFS.
//!
//! Every physical quantity gets a unit-carrying newtype so segment numbers,
//! page offsets, and byte addresses cannot be mixed silently. The
//! [`SegGeometry`] value captures the power-of-two layout constants recorded
//! in the super block at format time; this crate validates them once and the
//! rest of the system consumes them read-only.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Segment number within the main area, `[0, total_segs)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegNo(pub u64);

impl SegNo {
    /// Sentinel for "no segment".
    pub const NULL: Self = Self(u64::MAX);
}

/// Physical byte address within the persistent-memory region.
///
/// Allocated block addresses are always page-aligned; the SSA region is
/// addressed at byte granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockAddr(pub u64);

impl BlockAddr {
    /// Null address: an internal tree slot holding 0 has no child.
    pub const NULL: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }
}

/// Identity of the logical owner of an allocated page (a node or data
/// identity assigned by the inode/node layer; opaque to the allocator).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OwnerId(pub u64);

impl fmt::Display for SegNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors produced while validating layout constants or decoding packed
/// on-media records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

/// Bytes of a packed summary entry: owner (8) + offset-in-owner (2).
pub const SUMMARY_ENTRY_BYTES: usize = 10;

/// Bytes of the crc32c footer on a persisted summary block.
pub const SUMMARY_CRC_BYTES: usize = 4;

/// On-media layout constants, fixed at format-creation time.
///
/// All values are recorded in the super block and consumed read-only by the
/// segment manager. Construction validates the power-of-two constraints and
/// that the SIT tree shape can address every segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegGeometry {
    /// Page size in bytes; the unit of allocation inside a segment.
    page_size: u32,
    /// Pages per segment (`P`); the unit of free-space accounting.
    pages_per_seg: u32,
    /// Number of segments in the main area.
    total_segs: u64,
    /// Leading segments reserved for metadata, never handed out.
    reserved_segs: u64,
    /// Byte address where the main area begins.
    main_start: u64,
    /// Byte address where the segment summary area begins.
    ssa_start: u64,
    /// Internal levels of the persistent SIT tree (0 = root is a leaf).
    sit_height: u8,
}

impl SegGeometry {
    /// Validate and construct a geometry from super-block fields.
    #[allow(clippy::similar_names)]
    pub fn new(
        page_size: u32,
        pages_per_seg: u32,
        total_segs: u64,
        reserved_segs: u64,
        main_start: u64,
        ssa_start: u64,
        sit_height: u8,
    ) -> Result<Self, LayoutError> {
        if !page_size.is_power_of_two() || !(128..=65536).contains(&page_size) {
            return Err(LayoutError::InvalidField {
                field: "page_size",
                reason: "must be a power of two in 128..=65536",
            });
        }
        if !pages_per_seg.is_power_of_two() || !(2..=8192).contains(&pages_per_seg) {
            return Err(LayoutError::InvalidField {
                field: "pages_per_seg",
                reason: "must be a power of two in 2..=8192",
            });
        }
        if total_segs == 0 {
            return Err(LayoutError::InvalidField {
                field: "total_segs",
                reason: "must be nonzero",
            });
        }
        if reserved_segs >= total_segs {
            return Err(LayoutError::InvalidField {
                field: "reserved_segs",
                reason: "must be less than total_segs",
            });
        }
        if main_start % u64::from(page_size) != 0 {
            return Err(LayoutError::InvalidField {
                field: "main_start",
                reason: "must be page-aligned",
            });
        }
        if sit_height > 8 {
            return Err(LayoutError::InvalidField {
                field: "sit_height",
                reason: "must be at most 8",
            });
        }

        let geo = Self {
            page_size,
            pages_per_seg,
            total_segs,
            reserved_segs,
            main_start,
            ssa_start,
            sit_height,
        };

        if geo.sit_record_bytes() > page_size as usize {
            return Err(LayoutError::InvalidField {
                field: "page_size",
                reason: "too small to hold one packed SIT record",
            });
        }
        if total_segs > geo.tree_capacity() {
            return Err(LayoutError::InvalidField {
                field: "sit_height",
                reason: "SIT tree too shallow to address every segment",
            });
        }

        // The main area and the SSA must not overlap.
        let main_end = main_start
            .checked_add(
                total_segs
                    .checked_mul(geo.seg_bytes())
                    .ok_or(LayoutError::IntegerConversion { field: "main_end" })?,
            )
            .ok_or(LayoutError::IntegerConversion { field: "main_end" })?;
        let ssa_end = ssa_start
            .checked_add(
                total_segs
                    .checked_mul(geo.summary_block_bytes())
                    .ok_or(LayoutError::IntegerConversion { field: "ssa_end" })?,
            )
            .ok_or(LayoutError::IntegerConversion { field: "ssa_end" })?;
        let disjoint = main_end <= ssa_start || ssa_end <= main_start;
        if !disjoint {
            return Err(LayoutError::InvalidField {
                field: "ssa_start",
                reason: "SSA overlaps the main area",
            });
        }

        Ok(geo)
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    #[must_use]
    pub fn pages_per_seg(&self) -> u32 {
        self.pages_per_seg
    }

    #[must_use]
    pub fn total_segs(&self) -> u64 {
        self.total_segs
    }

    #[must_use]
    pub fn reserved_segs(&self) -> u64 {
        self.reserved_segs
    }

    #[must_use]
    pub fn main_start(&self) -> BlockAddr {
        BlockAddr(self.main_start)
    }

    #[must_use]
    pub fn ssa_start(&self) -> BlockAddr {
        BlockAddr(self.ssa_start)
    }

    #[must_use]
    pub fn sit_height(&self) -> u8 {
        self.sit_height
    }

    /// Segment size in bytes.
    #[must_use]
    pub fn seg_bytes(&self) -> u64 {
        u64::from(self.page_size) * u64::from(self.pages_per_seg)
    }

    /// Bytes of the per-segment validity bitmap.
    #[must_use]
    pub fn map_bytes(&self) -> usize {
        (self.pages_per_seg as usize).div_ceil(8)
    }

    /// Bytes of one packed SIT record: valid count (2) + mtime (8) + bitmap.
    #[must_use]
    pub fn sit_record_bytes(&self) -> usize {
        2 + 8 + self.map_bytes()
    }

    /// Packed SIT records per leaf block of the persistent tree.
    #[must_use]
    pub fn sit_entries_per_leaf(&self) -> u64 {
        (self.page_size as usize / self.sit_record_bytes()) as u64
    }

    /// Child addresses per internal node of the persistent tree.
    #[must_use]
    pub fn addrs_per_node(&self) -> u64 {
        u64::from(self.page_size) / 8
    }

    /// log2 of [`Self::addrs_per_node`]; the per-level shift of the tree walk.
    #[must_use]
    pub fn log2_addrs_per_node(&self) -> u32 {
        self.addrs_per_node().trailing_zeros()
    }

    /// Number of segments addressable by a tree of the configured height.
    #[must_use]
    pub fn tree_capacity(&self) -> u64 {
        let mut cap = self.sit_entries_per_leaf();
        for _ in 0..self.sit_height {
            cap = cap.saturating_mul(self.addrs_per_node());
        }
        cap
    }

    /// Bytes of one persisted summary block (entries + crc32c footer).
    #[must_use]
    pub fn summary_block_bytes(&self) -> u64 {
        self.pages_per_seg as u64 * SUMMARY_ENTRY_BYTES as u64 + SUMMARY_CRC_BYTES as u64
    }

    /// Byte address of segment `segno`'s slot in the SSA.
    #[must_use]
    pub fn ssa_slot_addr(&self, segno: SegNo) -> Option<BlockAddr> {
        if segno.0 >= self.total_segs {
            return None;
        }
        self.ssa_start
            .checked_add(segno.0.checked_mul(self.summary_block_bytes())?)
            .map(BlockAddr)
    }

    /// Physical address of page `blkoff` of segment `segno`.
    ///
    /// Returns `None` when the pair is outside the main area.
    #[must_use]
    pub fn addr_of(&self, segno: SegNo, blkoff: u32) -> Option<BlockAddr> {
        if segno.0 >= self.total_segs || blkoff >= self.pages_per_seg {
            return None;
        }
        let rel = segno
            .0
            .checked_mul(self.seg_bytes())?
            .checked_add(u64::from(blkoff) * u64::from(self.page_size))?;
        self.main_start.checked_add(rel).map(BlockAddr)
    }

    /// Derive `(segno, blkoff)` from a physical page address.
    ///
    /// Returns `None` when the address is outside the main area or not
    /// page-aligned.
    #[must_use]
    pub fn split_addr(&self, addr: BlockAddr) -> Option<(SegNo, u32)> {
        let rel = addr.0.checked_sub(self.main_start)?;
        if rel % u64::from(self.page_size) != 0 {
            return None;
        }
        let segno = rel / self.seg_bytes();
        if segno >= self.total_segs {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)] // bounded by pages_per_seg
        let blkoff = ((rel % self.seg_bytes()) / u64::from(self.page_size)) as u32;
        Some((SegNo(segno), blkoff))
    }
}

// ── Little-endian codec helpers ─────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], LayoutError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(LayoutError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(LayoutError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, LayoutError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, LayoutError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), LayoutError> {
    ensure_slice(data, offset, 2)?;
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), LayoutError> {
    ensure_slice(data, offset, 8)?;
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, LayoutError> {
    usize::try_from(value).map_err(|_| LayoutError::IntegerConversion { field })
}
