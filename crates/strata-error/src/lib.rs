#![forbid(unsafe_code)]
//! Error types for the strata engine.
//!
//! Defines `StrataError` and a `Result<T>` alias used throughout the
//! workspace, plus the errno mapping surfaced on volume completions.

use thiserror::Error;

/// Unified error type for all strata operations.
#[derive(Debug, Error)]
pub enum StrataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O failure on device {dev}: {detail}")]
    IoFailure { dev: u16, detail: String },

    #[error("no space left on device")]
    OutOfSpace,

    #[error("run of {requested} blocks exceeds allocator maximum of {max}")]
    RunTooLong { requested: u32, max: u32 },

    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("invalid device: {0}")]
    InvalidDevice(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unaligned access: offset {offset} not aligned to {align}")]
    UnalignedAccess { offset: u64, align: u32 },

    #[error("corrupt metadata on device {dev}: {detail}")]
    CorruptMetadata { dev: u16, detail: String },

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

impl StrataError {
    /// POSIX errno reported on volume request completions.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::IoFailure { .. } | Self::ChecksumMismatch { .. } | Self::CorruptMetadata { .. } => {
                libc::EIO
            }
            Self::OutOfSpace => libc::ENOSPC,
            Self::RunTooLong { .. } | Self::UnalignedAccess { .. } => libc::EINVAL,
            Self::InvalidDevice(_) => libc::ENODEV,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::NotFound(_) => libc::ENOENT,
            Self::ShutdownInProgress => libc::ESHUTDOWN,
        }
    }

    /// Whether retrying the same operation could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::IoFailure { .. })
    }
}

/// Result alias using `StrataError`.
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(StrataError::OutOfSpace.to_errno(), libc::ENOSPC);
        assert_eq!(
            StrataError::NotFound("vol".to_owned()).to_errno(),
            libc::ENOENT
        );
        assert_eq!(StrataError::ShutdownInProgress.to_errno(), libc::ESHUTDOWN);
        assert_eq!(
            StrataError::UnalignedAccess {
                offset: 1,
                align: 8192
            }
            .to_errno(),
            libc::EINVAL
        );
    }

    #[test]
    fn io_error_converts() {
        let err: StrataError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, StrataError::Io(_)));
        assert!(err.is_transient());
        assert!(!StrataError::OutOfSpace.is_transient());
    }
}
