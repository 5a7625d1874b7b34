//! Error types for the changefeed engine
//!
//! Errors are classified two ways: *ignorable* sink errors are treated as
//! success (DDL replay onto an existing table), and *fast-fail* errors put
//! the feed into the failed state without retrying (GC safepoint already
//! past the checkpoint).

use thiserror::Error;

/// Changefeed-specific errors
#[derive(Error, Debug)]
pub enum CdcError {
    /// Actor mailbox is full; the caller should retry on a later tick
    #[error("mailbox is full")]
    MailboxFull,

    /// Message sent to a pipeline that already stopped
    #[error("pipeline is closed")]
    SendToClosedPipeline,

    /// The GC safepoint moved past the checkpoint; data needed by the
    /// changefeed may already be collected
    #[error("GC TTL exceeded: checkpoint {checkpoint_ts} is before safepoint {safepoint}")]
    GcTtlExceeded { checkpoint_ts: u64, safepoint: u64 },

    /// The start-ts is already before the current GC safepoint
    #[error("start ts {start_ts} is before GC safepoint {safepoint}")]
    StartTsBeforeGc { start_ts: u64, safepoint: u64 },

    /// Downstream rejected a DDL in a way that means it was already
    /// applied (e.g. table exists); treated as success
    #[error("DDL event ignored by downstream: {0}")]
    DdlEventIgnored(String),

    /// Downstream failed to execute a DDL
    #[error("execute DDL failed: {0}")]
    ExecDdlFailed(String),

    /// Downstream sink failure
    #[error("sink error: {0}")]
    Sink(String),

    /// Region stream / puller failure
    #[error("puller error: {0}")]
    Puller(String),

    /// Schema snapshot cannot apply a DDL job
    #[error("schema error: {0}")]
    Schema(String),

    /// State store patch conflict or malformed state
    #[error("state error: {0}")]
    State(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl CdcError {
    /// Errors that mean the intended effect is already in place.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, CdcError::DdlEventIgnored(_))
    }

    /// Errors that must fail the changefeed without retry.
    pub fn is_fast_fail(&self) -> bool {
        matches!(
            self,
            CdcError::GcTtlExceeded { .. } | CdcError::StartTsBeforeGc { .. }
        )
    }
}

/// Result alias for changefeed operations
pub type Result<T> = std::result::Result<T, CdcError>;
