//! Per-segment summary blocks: which logical owner holds each allocated
//! page. Consumed by reclamation, written through on allocation, persisted
//! to the SSA region when a cursor leaves its segment and at checkpoint time.
//!
//! Persisted blocks carry a crc32c footer. A zero-filled SSA slot is a
//! segment that was never written and decodes as an empty block.

use cfs_error::{CfsError, Result};
use cfs_pmem::PmemDevice;
use cfs_types::{
    BlockAddr, OwnerId, SUMMARY_CRC_BYTES, SUMMARY_ENTRY_BYTES, SegGeometry, SegNo, read_le_u16,
    read_le_u64, u64_to_usize,
};
use serde::{Deserialize, Serialize};

/// Owner record for one allocated page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEntry {
    /// Logical owner (node or data identity) of the page.
    pub owner: OwnerId,
    /// Offset of the page within its owner.
    pub ofs_in_owner: u16,
}

/// In-memory summary block for one segment: one entry per page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryBlock {
    entries: Vec<SummaryEntry>,
}

impl SummaryBlock {
    #[must_use]
    pub fn new_empty(pages_per_seg: u32) -> Self {
        Self {
            entries: vec![SummaryEntry::default(); pages_per_seg as usize],
        }
    }

    pub fn set(&mut self, blkoff: u32, entry: SummaryEntry) -> Result<()> {
        let slot = self
            .entries
            .get_mut(blkoff as usize)
            .ok_or_else(|| CfsError::corruption(0, format!("summary offset {blkoff} out of range")))?;
        *slot = entry;
        Ok(())
    }

    pub fn get(&self, blkoff: u32) -> Result<SummaryEntry> {
        self.entries
            .get(blkoff as usize)
            .copied()
            .ok_or_else(|| CfsError::corruption(0, format!("summary offset {blkoff} out of range")))
    }

    /// Pack entries followed by a crc32c footer over the entry bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let body_len = self.entries.len() * SUMMARY_ENTRY_BYTES;
        let mut buf = vec![0u8; body_len + SUMMARY_CRC_BYTES];
        for (i, entry) in self.entries.iter().enumerate() {
            let off = i * SUMMARY_ENTRY_BYTES;
            buf[off..off + 8].copy_from_slice(&entry.owner.0.to_le_bytes());
            buf[off + 8..off + 10].copy_from_slice(&entry.ofs_in_owner.to_le_bytes());
        }
        let crc = crc32c::crc32c(&buf[..body_len]);
        buf[body_len..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Unpack a persisted summary block, verifying the footer.
    pub fn decode(data: &[u8], pages_per_seg: u32) -> Result<Self> {
        let body_len = pages_per_seg as usize * SUMMARY_ENTRY_BYTES;
        if data.len() != body_len + SUMMARY_CRC_BYTES {
            return Err(CfsError::Format(format!(
                "summary block length {} does not match geometry ({})",
                data.len(),
                body_len + SUMMARY_CRC_BYTES
            )));
        }

        // A slot the filesystem never wrote reads back as all zeroes.
        if data.iter().all(|&b| b == 0) {
            return Ok(Self::new_empty(pages_per_seg));
        }

        let stored = u32::from_le_bytes([
            data[body_len],
            data[body_len + 1],
            data[body_len + 2],
            data[body_len + 3],
        ]);
        let computed = crc32c::crc32c(&data[..body_len]);
        if stored != computed {
            return Err(CfsError::corruption(
                0,
                format!("summary block checksum mismatch: stored {stored:#x}, computed {computed:#x}"),
            ));
        }

        let mut entries = Vec::with_capacity(pages_per_seg as usize);
        for i in 0..pages_per_seg as usize {
            let off = i * SUMMARY_ENTRY_BYTES;
            let owner = read_le_u64(data, off)
                .map_err(|e| CfsError::Format(format!("summary entry {i}: {e}")))?;
            let ofs = read_le_u16(data, off + 8)
                .map_err(|e| CfsError::Format(format!("summary entry {i}: {e}")))?;
            entries.push(SummaryEntry {
                owner: OwnerId(owner),
                ofs_in_owner: ofs,
            });
        }
        Ok(Self { entries })
    }
}

/// Load the persisted summary block of `segno` from the SSA.
pub fn load_summary_block(
    dev: &dyn PmemDevice,
    geo: &SegGeometry,
    segno: SegNo,
) -> Result<SummaryBlock> {
    let slot = ssa_slot(geo, segno)?;
    let len = u64_to_usize(geo.summary_block_bytes(), "summary_block_bytes")
        .map_err(|e| CfsError::InvalidGeometry(e.to_string()))?;
    let mut buf = vec![0u8; len];
    dev.read_exact_at(slot, &mut buf)?;
    SummaryBlock::decode(&buf, geo.pages_per_seg())
}

/// Persist `block` into `segno`'s SSA slot.
pub fn store_summary_block(
    dev: &dyn PmemDevice,
    geo: &SegGeometry,
    segno: SegNo,
    block: &SummaryBlock,
) -> Result<()> {
    let slot = ssa_slot(geo, segno)?;
    dev.write_all_at(slot, &block.encode())
}

fn ssa_slot(geo: &SegGeometry, segno: SegNo) -> Result<BlockAddr> {
    geo.ssa_slot_addr(segno)
        .ok_or_else(|| CfsError::corruption(0, format!("no SSA slot for segment {segno}")))
}
