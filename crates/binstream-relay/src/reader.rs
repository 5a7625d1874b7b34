//! Upstream binlog reader abstraction
//!
//! The wire protocol lives in an event-reading library behind
//! [`BinlogReader`]; the relay only consumes decoded events. A fresh
//! reader is created through [`ReaderFactory`] on every (re)connect with a
//! newly allocated random server id, starting from the last saved
//! position or GTID set.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{RelayError, Result};
use crate::event::BinlogEvent;
use crate::gtid::GtidSet;
use crate::position::BinlogPosition;

/// Streaming source of binlog events.
#[async_trait]
pub trait BinlogReader: Send {
    /// Next event from the upstream stream. The first event after a
    /// (re)connect is the server's fake rotate announcing the current file.
    async fn get_event(&mut self) -> Result<BinlogEvent>;

    /// Tear down the stream.
    async fn close(&mut self) -> Result<()>;
}

/// Start point handed to a fresh reader.
#[derive(Debug, Clone)]
pub struct ReaderStart {
    /// Replica server id registered upstream; must not collide with any
    /// other replica, so it is re-randomized per connect.
    pub server_id: u32,
    pub pos: BinlogPosition,
    /// Set when position tracking is GTID-based.
    pub gtid_set: Option<GtidSet>,
    /// Raw mode skips body parsing of query/XID events (non-GTID mode).
    pub raw_mode: bool,
    /// Extra dump flags; MariaDB needs BINLOG_SEND_ANNOTATE_ROWS_EVENT.
    pub dump_flags: u16,
}

/// MariaDB dump flag asking the master to send annotate-rows events.
pub const DUMP_FLAG_SEND_ANNOTATE_ROWS_EVENT: u16 = 0x02;

/// Creates connected readers.
#[async_trait]
pub trait ReaderFactory: Send + Sync {
    async fn connect(&self, start: ReaderStart) -> Result<Box<dyn BinlogReader>>;
}

/// Retry policy for the relay read loop.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReaderRetryConfig {
    /// Attempts before giving up; the counter resets after a successful
    /// stretch longer than `backoff_rollback`.
    pub max_retries: u32,
    /// First backoff interval.
    pub backoff_base: Duration,
    /// Backoff cap.
    pub backoff_max: Duration,
    /// A stretch of this length without errors rolls the attempt count back.
    pub backoff_rollback: Duration,
}

impl Default for ReaderRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(30),
            backoff_rollback: Duration::from_secs(300),
        }
    }
}

/// Exponential backoff with rollback, driving reader reconnects.
pub struct ReaderRetry {
    cfg: ReaderRetryConfig,
    attempt: u32,
    last_retry: Option<std::time::Instant>,
}

impl ReaderRetry {
    pub fn new(cfg: ReaderRetryConfig) -> Self {
        Self {
            cfg,
            attempt: 0,
            last_retry: None,
        }
    }

    /// Decide whether `err` warrants another reconnect, and if so, how
    /// long to wait first.
    pub fn check(&mut self, err: &RelayError) -> Option<Duration> {
        if !err.is_retryable() {
            return None;
        }
        if let Some(last) = self.last_retry {
            if last.elapsed() >= self.cfg.backoff_rollback {
                self.attempt = 0;
            }
        }
        if self.attempt >= self.cfg.max_retries {
            return None;
        }
        let backoff = self
            .cfg
            .backoff_base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cfg.backoff_max);
        self.attempt += 1;
        self.last_retry = Some(std::time::Instant::now());
        Some(backoff)
    }
}
