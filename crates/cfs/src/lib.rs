#![forbid(unsafe_code)]
//! CinderFS public API facade.
//!
//! Re-exports the segment manager through a stable external interface.
//! This is the crate the checkpoint orchestrator and reclaimer depend on.

pub use cfs_error::{CfsError, Result};
pub use cfs_pmem::{FilePmem, PmemDevice, RamPmem};
pub use cfs_segment::*;
pub use cfs_types::{BlockAddr, LayoutError, OwnerId, SegGeometry, SegNo};
