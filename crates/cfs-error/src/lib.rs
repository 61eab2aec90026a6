#![forbid(unsafe_code)]
//! Error types for CinderFS.
//!
//! # Error Taxonomy
//!
//! The segment manager distinguishes three failure classes (they carry
//! different recovery policies, so they must not be collapsed):
//!
//! | Class | Variant | Policy |
//! |-------|---------|--------|
//! | Consistency violation | `Corruption` | Fatal to the operation chain; the mount/checkpoint layer decides abort vs. read-only degradation. Never clamped, never retried. |
//! | Resource exhaustion | `NoSpace` | Reported to the caller; retry (e.g. after reclamation) is the caller's policy, never this layer's. |
//! | Format/restore inconsistency | `Format` / `InvalidGeometry` | Mount-time validation failures; a recoverable count mismatch is corrected and logged instead of raised. |
//!
//! Consistency violations deliberately surface as error values rather than
//! panics: a library must hand the abort-or-degrade decision to the layer
//! that owns the mount, not take the process down itself.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`CfsError::to_errno`]
//! for the kernel-facing boundary. The match is exhaustive, so adding a
//! variant without assigning its errno is a compile error.

use thiserror::Error;

/// Unified error type for all CinderFS segment-manager operations.
#[derive(Debug, Error)]
pub enum CfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-media or in-memory metadata corruption at a known address.
    ///
    /// Raised for double allocate/free, valid-count excursions outside
    /// `[0, P]`, popcount/bitmap disagreement, and unreadable persisted
    /// records. `addr` is the byte address nearest the damage (0 when the
    /// violation is purely in-memory).
    #[error("corrupt metadata at {addr:#x}: {detail}")]
    Corruption { addr: u64, detail: String },

    /// Structurally invalid on-media format (bad packing, impossible field).
    #[error("invalid on-media format: {0}")]
    Format(String),

    /// Layout constants out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// No free segment available at acquisition time.
    ///
    /// This layer performs no retry or reclamation; the caller owns that
    /// policy.
    #[error("no space left on device")]
    NoSpace,

    /// The persistent region is opened read-only and a write was attempted.
    #[error("read-only persistent region")]
    ReadOnly,
}

impl CfsError {
    /// Convert this error into a POSIX errno suitable for the VFS boundary.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Shorthand for a corruption error at a known address.
    #[must_use]
    pub fn corruption(addr: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            addr,
            detail: detail.into(),
        }
    }
}

/// Result alias using `CfsError`.
pub type Result<T> = std::result::Result<T, CfsError>;
