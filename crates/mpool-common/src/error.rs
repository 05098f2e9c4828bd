//! Error types for mpool
//!
//! This module defines the common error type used throughout the system.

use crate::types::ObjectId;
use thiserror::Error;

/// Common result type for mpool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for mpool
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied argument violated a precondition. The message
    /// names the constraint that failed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Lookup of an object identity the directory does not recognize as
    /// live. Expected during normal probing after a restart.
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// Write or abort attempted on a committed mblock.
    #[error("mblock {0} is already committed")]
    AlreadyCommitted(ObjectId),

    /// Read attempted on an mblock that has not been committed yet.
    #[error("mblock {0} is not committed")]
    NotReady(ObjectId),

    /// Commit attempted while an abort is in progress on the same object.
    #[error("commit of {0} raced an in-progress abort")]
    Busy(ObjectId),

    /// The allocator could not reserve the requested capacity.
    #[error("insufficient space: required {required}, available {available}")]
    InsufficientSpace { required: u64, available: u64 },

    /// The backing drive's I/O or flush call failed. Propagated verbatim,
    /// never retried internally.
    #[error("drive I/O error: {0}")]
    DeviceIo(#[from] std::io::Error),

    /// On-media metadata failed validation (bad magic, version, checksum,
    /// or geometry).
    #[error("on-media corruption: {0}")]
    Corrupt(String),

    /// An invariant the core relies on was violated. A defect, not a
    /// recoverable condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is an invalid argument error
    #[must_use]
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}
