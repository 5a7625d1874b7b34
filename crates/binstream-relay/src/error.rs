//! Error types for the relay
//!
//! Mirrors the failure taxonomy of the relay loop: retryable transport
//! errors (the reader is reopened from the last saved position),
//! non-retryable upstream errors (surfaced to the operator), and local
//! metadata / file I/O failures.

use thiserror::Error;

use crate::position::BinlogPosition;

/// Relay-specific errors
#[derive(Error, Debug)]
pub enum RelayError {
    /// I/O error on relay files or metadata
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization error
    #[error("meta serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed or inconsistent relay metadata
    #[error("invalid relay meta: {0}")]
    InvalidMeta(String),

    /// GTID set parsing error
    #[error("parse GTID set {text:?} for flavor {flavor}: {reason}")]
    GtidParse {
        flavor: &'static str,
        text: String,
        reason: String,
    },

    /// Two GTID sets of different flavors were combined
    #[error("GTID flavor mismatch: {0} vs {1}")]
    GtidFlavorMismatch(&'static str, &'static str),

    /// Malformed binlog event frame
    #[error("invalid binlog event: {0}")]
    InvalidEvent(String),

    /// Binlog filename does not follow the `prefix.NNNNNN` convention
    #[error("invalid binlog filename {0:?}")]
    InvalidBinlogFilename(String),

    /// Upstream connection or read failure, retryable
    #[error("upstream connection error: {0}")]
    Connection(String),

    /// Event checksum mismatch reported by the reader, retryable
    #[error("binlog checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// Reader asked to be re-synced from the last position, retryable
    #[error("binlog reader needs sync again: {0}")]
    NeedSyncAgain(String),

    /// Upstream query timed out
    #[error("upstream query timeout: {0}")]
    Timeout(String),

    /// The requested binlog was purged on the upstream server
    #[error("requested binlog purged on upstream (last position {last_pos}): {message}")]
    BinlogPurged {
        last_pos: BinlogPosition,
        message: String,
    },

    /// A fake rotate event arrived from a different upstream server
    #[error("rotate event from a new server, upstream master may have switched")]
    RotateWithDifferentServerId,

    /// Recovery found metadata pointing past the end of the relay file
    #[error("latest transaction boundary {latest_pos} is beyond relay file size {size}")]
    LatestPosGtFileSize { latest_pos: u64, size: u64 },

    /// Event bytes conflict with bytes already written at the same offset
    #[error("event at end position {log_pos} conflicts with existing bytes in {filename}")]
    EventConflict { filename: String, log_pos: u64 },

    /// Writer used before `init`
    #[error("relay writer is not initialized")]
    WriterNotInitialized,

    /// Relay was asked to operate after close
    #[error("relay unit is closed")]
    Closed,
}

impl RelayError {
    /// Whether the relay loop may recover by reopening the reader from the
    /// last saved position.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Connection(_)
                | RelayError::ChecksumMismatch(_)
                | RelayError::NeedSyncAgain(_)
                | RelayError::Timeout(_)
        )
    }
}

/// Result alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
