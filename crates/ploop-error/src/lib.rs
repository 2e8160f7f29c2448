#![forbid(unsafe_code)]
//! Error types for ploop.
//!
//! Defines `PloopError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for block-shell consumers and the
//! retriability split the engine's completion accounting relies on.

use ploop_types::{DeltaId, ParseError};
use thiserror::Error;

/// Unified error type for all ploop operations.
#[derive(Debug, Error)]
pub enum PloopError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request not sector-aligned: offset={offset_bytes} len={len_bytes}")]
    InvalidAlignment { offset_bytes: u64, len_bytes: u64 },

    #[error("request beyond virtual size: sector {sector}, virtual size {virtual_sectors} sectors")]
    OutOfRange { sector: u64, virtual_sectors: u64 },

    #[error("no space left in delta {delta}")]
    OutOfSpace { delta: DeltaId },

    #[error("metadata pipeline backlogged, retry later")]
    MetadataBackpressure,

    #[error("backing I/O failed on delta {delta}: {source}")]
    BackingIo {
        delta: DeltaId,
        #[source]
        source: std::io::Error,
    },

    #[error("delta stack busy with a control operation")]
    StackBusy,

    #[error("corrupt delta header: {0}")]
    CorruptHeader(ParseError),

    #[error("unsupported format version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("delta cluster shift {found} incompatible with stack cluster shift {expected}")]
    IncompatibleClusterSize { found: u32, expected: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    Format(String),
}

impl PloopError {
    /// Whether the caller should retry after yielding.
    ///
    /// Transient conditions per the taxonomy: pipeline backlog and a stack
    /// mid-mutation. Everything else is permanent for the request.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::MetadataBackpressure | Self::StackBusy)
    }

    /// Convert this error into a POSIX errno suitable for a block-device
    /// shell's completion status.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::BackingIo { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidAlignment { .. } | Self::Format(_) => libc::EINVAL,
            Self::OutOfRange { .. } => libc::ERANGE,
            Self::OutOfSpace { .. } => libc::ENOSPC,
            Self::MetadataBackpressure | Self::StackBusy => libc::EAGAIN,
            Self::CorruptHeader(_) => libc::EUCLEAN,
            Self::UnsupportedVersion { .. } | Self::IncompatibleClusterSize { .. } => {
                libc::ENOTSUP
            }
            Self::Cancelled => libc::ECANCELED,
        }
    }
}

impl From<ParseError> for PloopError {
    fn from(err: ParseError) -> Self {
        Self::CorruptHeader(err)
    }
}

/// Result alias using `PloopError`.
pub type Result<T> = std::result::Result<T, PloopError>;
