//! Error kinds surfaced by the filesystem core.

use std::io;
use thiserror::Error;

/// Result alias used across the crate.
pub type FsResult<T> = Result<T, FsError>;

/// An error returned by a filesystem operation.
#[derive(Debug, Error)]
pub enum FsError {
    /// The inode is not a directory.
    #[error("not a directory")]
    NotADirectory,
    /// The named entry does not exist.
    #[error("no such file or directory")]
    NotFound,
    /// The named entry already exists.
    #[error("file exists")]
    AlreadyExists,
    /// The extended attribute does not exist.
    #[error("no data available")]
    NoData,
    /// An offset or index is out of the addressable range.
    #[error("out of range")]
    OutOfRange,
    /// The allocator is exhausted, or the object cannot grow further.
    #[error("no space left on device")]
    NoSpace,
    /// The logical block is past the maximum addressable file size.
    #[error("file too large")]
    FileTooBig,
    /// An argument is invalid (algorithm id out of range, password too
    /// long, ...).
    #[error("invalid argument")]
    InvalidArgument,
    /// Access to an encrypted extent while the volume is locked.
    #[error("permission denied")]
    PermissionDenied,
    /// A KDF or authentication failure. Never silently substituted.
    #[error("cryptographic operation failed")]
    CryptoFailure,
    /// The requested algorithm is not available in this build.
    #[error("operation not supported")]
    Unsupported,
    /// A structural validation failure (bad magic, bad version, layout
    /// arithmetic) found at mount time or by `fsck`.
    #[error("corrupted filesystem: {0}")]
    Corrupted(&'static str),
    /// A backing device failure, or a length mismatch in the pipeline.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
