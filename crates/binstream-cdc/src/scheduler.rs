//! Scheduler interface
//!
//! The scheduler decides which capture replicates which table and
//! derives the new global watermarks from per-capture progress. Its
//! implementation (rebalancing policy, move-table protocol) lives
//! outside this crate; the owner only needs the tick contract.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{CaptureId, CaptureInfo, TableId, Ts};
use crate::state::ChangefeedState;

/// Sentinel: not every table is replicating normally, so the global
/// watermarks must not advance this tick.
pub const CHECKPOINT_CANNOT_PROCEED: Ts = 0;

/// Table-to-capture scheduling and watermark derivation.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Reconcile table assignments and return the new
    /// `(checkpoint_ts, resolved_ts)`, or `CHECKPOINT_CANNOT_PROCEED`
    /// when advancement is not safe yet.
    async fn tick(
        &mut self,
        state: &mut ChangefeedState,
        current_tables: &[TableId],
        captures: &HashMap<CaptureId, CaptureInfo>,
    ) -> Result<(Ts, Ts)>;

    async fn close(&mut self);
}

/// Minimal scheduler deriving watermarks as the minimum over reported
/// task positions; table movement is left to the external scheduler in
/// production deployments.
#[derive(Debug, Default)]
pub struct MinPositionScheduler;

#[async_trait]
impl Scheduler for MinPositionScheduler {
    async fn tick(
        &mut self,
        state: &mut ChangefeedState,
        _current_tables: &[TableId],
        _captures: &HashMap<CaptureId, CaptureInfo>,
    ) -> Result<(Ts, Ts)> {
        if state.task_positions.is_empty() {
            return Ok((CHECKPOINT_CANNOT_PROCEED, CHECKPOINT_CANNOT_PROCEED));
        }
        let checkpoint = state
            .task_positions
            .values()
            .map(|p| p.checkpoint_ts)
            .min()
            .unwrap_or(CHECKPOINT_CANNOT_PROCEED);
        let resolved = state
            .task_positions
            .values()
            .map(|p| p.resolved_ts)
            .min()
            .unwrap_or(CHECKPOINT_CANNOT_PROCEED);
        Ok((checkpoint, resolved))
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeFeedInfo, TaskPosition};

    #[tokio::test]
    async fn test_min_position_scheduler() {
        let mut state = ChangefeedState::new("cf-1", ChangeFeedInfo::new("blackhole://", 10));
        let mut scheduler = MinPositionScheduler;
        let captures = HashMap::new();

        let (cp, rts) = scheduler.tick(&mut state, &[], &captures).await.unwrap();
        assert_eq!(cp, CHECKPOINT_CANNOT_PROCEED);
        assert_eq!(rts, CHECKPOINT_CANNOT_PROCEED);

        state.task_positions.insert(
            "a".into(),
            TaskPosition {
                checkpoint_ts: 100,
                resolved_ts: 120,
                error: None,
            },
        );
        state.task_positions.insert(
            "b".into(),
            TaskPosition {
                checkpoint_ts: 90,
                resolved_ts: 130,
                error: None,
            },
        );
        let (cp, rts) = scheduler.tick(&mut state, &[], &captures).await.unwrap();
        assert_eq!(cp, 90);
        assert_eq!(rts, 120);
    }
}
