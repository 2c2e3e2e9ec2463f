//! Error types for vfsync operations.

use thiserror::Error;

use crate::fs::FsError;

/// Errors that can occur during vfsync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A required argument was missing or unusable. Raised before any I/O.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Filesystem failure other than an absorbed "not found".
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    /// A sync message field carried a value outside its enum.
    #[error("Invalid sync message {field}: {value:?}")]
    InvalidMessage {
        /// Which envelope field was rejected (`type` or `name`).
        field: &'static str,
        /// The rejected value.
        value: String,
    },

    /// A message arrived out of sequence or with an unusable payload.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A patch could not be reconciled against the current content.
    #[error("Conflict at {path}: {reason}")]
    Conflict {
        /// Path that could not be reconciled.
        path: String,
        /// Human readable cause.
        reason: String,
    },

    /// A diff segment referenced a block the base content does not have.
    #[error("Invalid block index: {index} (base has {block_count} blocks)")]
    InvalidBlockIndex {
        /// Referenced block index
        index: u32,
        /// Number of blocks in the base content
        block_count: usize,
    },

    /// Reconstructed content does not hash to the expected digest.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest carried by the diff
        expected: String,
        /// Digest of the reconstructed bytes
        actual: String,
    },

    /// The round was reset or preempted before its patch could be applied.
    #[error("Sync round abandoned: {0}")]
    RoundAbandoned(String),

    /// Bounded rename retry loop gave up.
    #[error("Rename of {from} to {to} failed after {attempts} attempts")]
    RenameRetriesExhausted {
        /// Source path
        from: String,
        /// Destination path
        to: String,
        /// Attempts made
        attempts: u32,
    },

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed.
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Raw I/O error outside the filesystem contract (config files, frames).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// True for errors that mean "stale base, recover by conflicted copy".
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::InvalidBlockIndex { .. } | Self::DigestMismatch { .. }
        )
    }

    /// True for malformed or out-of-sequence protocol traffic.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::InvalidMessage { .. } | Self::ProtocolViolation(_))
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }
}

/// Result type for vfsync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
