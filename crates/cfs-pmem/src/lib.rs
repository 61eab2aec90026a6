#![forbid(unsafe_code)]
//! Persistent-memory region abstraction.
//!
//! The segment manager addresses the persistent medium by byte offset:
//! allocated pages land at page-aligned addresses, while the segment summary
//! area is packed at byte granularity. [`PmemDevice`] captures exactly that
//! surface. Two backends are provided: [`RamPmem`] (heap-backed, used by
//! tests and DRAM emulation) and [`FilePmem`] (file-backed via positional
//! `pread`/`pwrite` I/O).

use cfs_error::{CfsError, Result};
use cfs_types::BlockAddr;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed persistent region with positional I/O semantics.
pub trait PmemDevice: Send + Sync {
    /// Total length of the region in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes starting at `addr`.
    fn read_exact_at(&self, addr: BlockAddr, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes of `data` starting at `addr`.
    fn write_all_at(&self, addr: BlockAddr, data: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(addr: BlockAddr, len: usize, total: u64) -> Result<()> {
    let len64 =
        u64::try_from(len).map_err(|_| CfsError::Format("I/O length overflows u64".to_owned()))?;
    let end = addr
        .checked_add(len64)
        .ok_or_else(|| CfsError::Format("I/O range overflows u64".to_owned()))?;
    if end.0 > total {
        return Err(CfsError::Format(format!(
            "I/O out of bounds: addr={addr} len={len} region_len={total}"
        )));
    }
    Ok(())
}

/// Heap-backed region.
///
/// Reads and writes go through an `RwLock` so concurrent readers do not
/// serialize against each other; the segment manager's own locks already
/// serialize conflicting writers.
#[derive(Debug)]
pub struct RamPmem {
    bytes: RwLock<Vec<u8>>,
    len: u64,
}

impl RamPmem {
    /// Create a zero-filled region of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0u8; len]),
            len: len as u64,
        }
    }
}

impl PmemDevice for RamPmem {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, addr: BlockAddr, buf: &mut [u8]) -> Result<()> {
        check_range(addr, buf.len(), self.len)?;
        let bytes = self.bytes.read();
        let start = usize::try_from(addr.0)
            .map_err(|_| CfsError::Format("address overflows usize".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, addr: BlockAddr, data: &[u8]) -> Result<()> {
        check_range(addr, data.len(), self.len)?;
        let mut bytes = self.bytes.write();
        let start = usize::try_from(addr.0)
            .map_err(|_| CfsError::Format("address overflows usize".to_owned()))?;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed region using `pread`/`pwrite` style positional I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and needs no shared seek
/// position, so the handle can be cloned freely across threads.
#[derive(Debug, Clone)]
pub struct FilePmem {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FilePmem {
    /// Open a backing file, falling back to read-only when the file is not
    /// writable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl PmemDevice for FilePmem {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, addr: BlockAddr, buf: &mut [u8]) -> Result<()> {
        check_range(addr, buf.len(), self.len)?;
        self.file.read_exact_at(buf, addr.0)?;
        Ok(())
    }

    fn write_all_at(&self, addr: BlockAddr, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(CfsError::ReadOnly);
        }
        check_range(addr, data.len(), self.len)?;
        self.file.write_all_at(data, addr.0)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
