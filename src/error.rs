use thiserror::Error;

use crate::ntfs::record::MftReference;

/// Errors surfaced by the NTFS engine.
///
/// Nothing is swallowed internally: every failure reaches the caller as one
/// of these variants.
#[derive(Error, Debug)]
pub enum NtfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("volume corrupted: {0}")]
    Corrupt(String),

    #[error("stale MFT reference {reference}: record sequence is now {actual}")]
    StaleReference { reference: MftReference, actual: u16 },

    #[error("device error: {0}")]
    Device(#[from] std::io::Error),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("volume is read-only")]
    ReadOnly,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("volume has been unmounted")]
    DeviceGone,

    #[error("volume busy: {0} handle(s) still open")]
    Busy(usize),
}

impl NtfsError {
    /// True for errors a caller should treat as "no such entry".
    ///
    /// A stale reference points at a record that has been reused, so from the
    /// caller's point of view the original file is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            NtfsError::NotFound(_) | NtfsError::StaleReference { .. }
        )
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, NtfsError::Corrupt(_))
    }
}

/// Shorthand for building a [`NtfsError::Corrupt`].
pub(crate) fn corrupt(msg: impl Into<String>) -> NtfsError {
    NtfsError::Corrupt(msg.into())
}

pub type Result<T> = std::result::Result<T, NtfsError>;
