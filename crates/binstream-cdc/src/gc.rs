//! GC safepoint coordination
//!
//! The changefeed must keep its checkpoint ahead of the storage GC
//! safepoint, or the history it still needs gets collected underneath
//! it. The owner registers a service safepoint when a feed initializes
//! and verifies staleness on every tick; a violated safepoint is
//! terminal for the feed.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::{CdcError, Result};
use crate::model::{ChangefeedId, Ts};

/// Safepoint authority, backed by the cluster's time oracle.
#[async_trait]
pub trait GcManager: Send + Sync {
    /// Register a service safepoint covering `checkpoint_ts` with the
    /// given TTL, failing when the start point already fell behind GC.
    async fn ensure_changefeed_start_ts_safety(
        &self,
        id: &ChangefeedId,
        ttl_secs: u64,
        checkpoint_ts: Ts,
    ) -> Result<()>;

    /// Fail with `GcTtlExceeded` when the checkpoint fell behind the
    /// current safepoint.
    async fn check_stale_checkpoint_ts(&self, id: &ChangefeedId, checkpoint_ts: Ts) -> Result<()>;
}

/// GC manager over a locally tracked safepoint; the external cluster
/// integration updates it through `advance_safepoint`.
#[derive(Debug, Default)]
pub struct LocalGcManager {
    safepoint: AtomicU64,
}

impl LocalGcManager {
    pub fn new(safepoint: Ts) -> Self {
        Self {
            safepoint: AtomicU64::new(safepoint),
        }
    }

    pub fn advance_safepoint(&self, safepoint: Ts) {
        self.safepoint.fetch_max(safepoint, Ordering::AcqRel);
    }

    pub fn safepoint(&self) -> Ts {
        self.safepoint.load(Ordering::Acquire)
    }
}

#[async_trait]
impl GcManager for LocalGcManager {
    async fn ensure_changefeed_start_ts_safety(
        &self,
        _id: &ChangefeedId,
        _ttl_secs: u64,
        checkpoint_ts: Ts,
    ) -> Result<()> {
        let safepoint = self.safepoint();
        if checkpoint_ts < safepoint {
            return Err(CdcError::StartTsBeforeGc {
                start_ts: checkpoint_ts,
                safepoint,
            });
        }
        Ok(())
    }

    async fn check_stale_checkpoint_ts(
        &self,
        _id: &ChangefeedId,
        checkpoint_ts: Ts,
    ) -> Result<()> {
        let safepoint = self.safepoint();
        if checkpoint_ts < safepoint {
            return Err(CdcError::GcTtlExceeded {
                checkpoint_ts,
                safepoint,
            });
        }
        Ok(())
    }
}
