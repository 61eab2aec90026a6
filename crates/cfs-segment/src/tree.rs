//! Persistent SIT tree: a multi-level, copy-on-write indexed tree that
//! durably records per-segment entries.
//!
//! Internal nodes are fixed arrays of little-endian child addresses
//! (`addresses_per_block = page_size / 8`); a zero address is an absent
//! subtree. Leaves hold `sit_entries_per_block` packed [`SitRecord`]s. A
//! node is immutable once any checkpoint root can reach it: the flush path
//! copies such nodes to freshly allocated blocks and only mutates blocks
//! that are private to the current flush epoch. The old root therefore
//! remains fully readable until the checkpoint collaborator republishes —
//! a crash mid-flush leaves the previous checkpoint's tree intact.
//!
//! "Already copied this epoch" is tracked by [`FlushEpoch`], an explicit
//! map from old node address to its private copy, rather than any pointer
//! identity trick.

use crate::sit::SitRecord;
use cfs_error::{CfsError, Result};
use cfs_pmem::PmemDevice;
use cfs_types::{BlockAddr, SegGeometry, SegNo, read_le_u64, write_le_u64};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Source of fresh node-sized blocks for the flush path.
///
/// The segment manager implements this with a raw bump off the node cursor;
/// tree blocks carry no SIT accounting because their liveness is decided by
/// root reachability, not per-page validity.
pub trait NodeBlockAllocator {
    fn alloc_node_block(&self) -> Result<BlockAddr>;
}

/// Per-flush-epoch bookkeeping: which old nodes were already copied, and
/// which block addresses are private to this epoch (safe to mutate in
/// place because no durable root can reach them).
#[derive(Debug, Default)]
pub struct FlushEpoch {
    copied: HashMap<u64, u64>,
    private: HashSet<u64>,
}

impl FlushEpoch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_private(&self, addr: BlockAddr) -> bool {
        self.private.contains(&addr.0)
    }

    #[must_use]
    pub fn copy_of(&self, old: BlockAddr) -> Option<BlockAddr> {
        self.copied.get(&old.0).copied().map(BlockAddr)
    }

    /// Number of fresh blocks this epoch has written.
    #[must_use]
    pub fn nodes_written(&self) -> usize {
        self.private.len()
    }

    fn record(&mut self, old: BlockAddr, new: BlockAddr) {
        if !old.is_null() {
            self.copied.insert(old.0, new.0);
        }
        self.private.insert(new.0);
    }
}

fn read_node(dev: &dyn PmemDevice, geo: &SegGeometry, addr: BlockAddr) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; geo.page_size() as usize];
    dev.read_exact_at(addr, &mut buf)?;
    Ok(buf)
}

fn child_at(buf: &[u8], idx: usize, node_addr: BlockAddr) -> Result<BlockAddr> {
    read_le_u64(buf, idx * 8)
        .map(BlockAddr)
        .map_err(|e| CfsError::corruption(node_addr.0, format!("tree node slot {idx}: {e}")))
}

/// Index into an internal node at `level` (1-based from the leaves) while
/// navigating towards `leaf_no`.
fn slot_index(geo: &SegGeometry, leaf_no: u64, level: u8) -> usize {
    let shift = u32::from(level - 1) * geo.log2_addrs_per_node();
    let mask = geo.addrs_per_node() - 1;
    ((leaf_no >> shift) & mask) as usize
}

/// Descend from `root` to the leaf record for `segno`.
///
/// Returns `Ok(None)` when the path runs into an absent subtree (a segment
/// no flush has ever recorded). Safe against concurrently running flushes:
/// a published root's subtree is immutable.
pub fn lookup(
    dev: &dyn PmemDevice,
    geo: &SegGeometry,
    root: BlockAddr,
    segno: SegNo,
) -> Result<Option<SitRecord>> {
    if segno.0 >= geo.total_segs() {
        return Err(CfsError::corruption(
            0,
            format!("SIT lookup for out-of-range segment {segno}"),
        ));
    }
    let leaf_no = segno.0 / geo.sit_entries_per_leaf();
    let slot = (segno.0 % geo.sit_entries_per_leaf()) as usize;

    let mut addr = root;
    let mut level = geo.sit_height();
    while level > 0 {
        if addr.is_null() {
            return Ok(None);
        }
        let node = read_node(dev, geo, addr)?;
        addr = child_at(&node, slot_index(geo, leaf_no, level), addr)?;
        level -= 1;
    }
    if addr.is_null() {
        return Ok(None);
    }

    let leaf = read_node(dev, geo, addr)?;
    let rec_len = geo.sit_record_bytes();
    let off = slot * rec_len;
    let rec = SitRecord::decode(&leaf[off..off + rec_len], geo.map_bytes())
        .map_err(|e| CfsError::corruption(addr.0 + off as u64, format!("SIT leaf record: {e}")))?;
    Ok(Some(rec))
}

/// Write `dirty` entries into a copy-on-write update of the tree at
/// `old_root`, returning the new root.
///
/// Nothing reachable from `old_root` is mutated. An empty `dirty` set
/// returns `old_root` unchanged without allocating. The epoch may span
/// several calls (the flush path batches its gang lookups); pass the same
/// [`FlushEpoch`] so nodes copied by an earlier batch are mutated in place
/// instead of re-copied.
pub fn flush(
    dev: &dyn PmemDevice,
    geo: &SegGeometry,
    epoch: &mut FlushEpoch,
    old_root: BlockAddr,
    dirty: &[(SegNo, SitRecord)],
    alloc: &dyn NodeBlockAllocator,
) -> Result<BlockAddr> {
    if dirty.is_empty() {
        return Ok(old_root);
    }

    // Group records by leaf so each touched leaf is written once.
    let epl = geo.sit_entries_per_leaf();
    let mut groups: BTreeMap<u64, Vec<(usize, &SitRecord)>> = BTreeMap::new();
    for (segno, rec) in dirty {
        if segno.0 >= geo.total_segs() {
            return Err(CfsError::corruption(
                0,
                format!("SIT flush for out-of-range segment {segno}"),
            ));
        }
        groups
            .entry(segno.0 / epl)
            .or_default()
            .push(((segno.0 % epl) as usize, rec));
    }

    let mut root = old_root;
    for (leaf_no, recs) in &groups {
        root = cow_update(dev, geo, epoch, alloc, root, geo.sit_height(), *leaf_no, recs)?;
    }

    tracing::debug!(
        target: "cfs::tree",
        entries = dirty.len(),
        leaves = groups.len(),
        nodes_written = epoch.nodes_written(),
        old_root = old_root.0,
        new_root = root.0,
        "sit tree flush"
    );
    Ok(root)
}

#[allow(clippy::too_many_arguments)]
fn cow_update(
    dev: &dyn PmemDevice,
    geo: &SegGeometry,
    epoch: &mut FlushEpoch,
    alloc: &dyn NodeBlockAllocator,
    node: BlockAddr,
    level: u8,
    leaf_no: u64,
    recs: &[(usize, &SitRecord)],
) -> Result<BlockAddr> {
    // A node copied earlier in this epoch is reached through its copy.
    if let Some(copy) = epoch.copy_of(node) {
        return cow_update(dev, geo, epoch, alloc, copy, level, leaf_no, recs);
    }

    if level == 0 {
        return cow_leaf(dev, geo, epoch, alloc, node, recs);
    }

    let idx = slot_index(geo, leaf_no, level);
    if epoch.is_private(node) {
        // Already ours: patch the one child pointer in place.
        let mut buf = read_node(dev, geo, node)?;
        let child = child_at(&buf, idx, node)?;
        let new_child = cow_update(dev, geo, epoch, alloc, child, level - 1, leaf_no, recs)?;
        if new_child != child {
            write_le_u64(&mut buf, idx * 8, new_child.0)
                .map_err(|e| CfsError::Format(format!("tree node slot {idx}: {e}")))?;
            dev.write_all_at(node, &buf)?;
        }
        return Ok(node);
    }

    // First touch this epoch: copy, then rewrite the one changed slot.
    let new = alloc.alloc_node_block()?;
    let mut buf = if node.is_null() {
        vec![0u8; geo.page_size() as usize]
    } else {
        read_node(dev, geo, node)?
    };
    let child = child_at(&buf, idx, node)?;
    let new_child = cow_update(dev, geo, epoch, alloc, child, level - 1, leaf_no, recs)?;
    write_le_u64(&mut buf, idx * 8, new_child.0)
        .map_err(|e| CfsError::Format(format!("tree node slot {idx}: {e}")))?;
    dev.write_all_at(new, &buf)?;
    epoch.record(node, new);
    Ok(new)
}

fn cow_leaf(
    dev: &dyn PmemDevice,
    geo: &SegGeometry,
    epoch: &mut FlushEpoch,
    alloc: &dyn NodeBlockAllocator,
    leaf: BlockAddr,
    recs: &[(usize, &SitRecord)],
) -> Result<BlockAddr> {
    let rec_len = geo.sit_record_bytes();

    if epoch.is_private(leaf) {
        let mut buf = read_node(dev, geo, leaf)?;
        apply_records(&mut buf, rec_len, recs)?;
        dev.write_all_at(leaf, &buf)?;
        return Ok(leaf);
    }

    let new = alloc.alloc_node_block()?;
    let mut buf = if leaf.is_null() {
        vec![0u8; geo.page_size() as usize]
    } else {
        read_node(dev, geo, leaf)?
    };
    apply_records(&mut buf, rec_len, recs)?;
    dev.write_all_at(new, &buf)?;
    epoch.record(leaf, new);
    Ok(new)
}

fn apply_records(buf: &mut [u8], rec_len: usize, recs: &[(usize, &SitRecord)]) -> Result<()> {
    for (slot, rec) in recs {
        let off = slot * rec_len;
        rec.encode_into(&mut buf[off..off + rec_len])
            .map_err(|e| CfsError::Format(format!("SIT leaf slot {slot}: {e}")))?;
    }
    Ok(())
}
