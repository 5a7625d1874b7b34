//! Sink node
//!
//! The tail of a table pipeline. Buffers mounted rows, and on each
//! watermark flushes everything at or below `min(resolved, barrier,
//! target)` downstream. The checkpoint never advances past the barrier
//! the owner set, which is how DDL and sync points hold row progress
//! back until their side effect is durable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::model::{PolymorphicEvent, RowChangedEvent, TableId, Ts};
use crate::pipeline::flow_control::TableFlowController;
use crate::sink::Sink;

/// Externally visible state of a table pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TableStatus {
    Initializing = 0,
    Running = 1,
    Stopped = 2,
}

impl TableStatus {
    fn from_u64(v: u64) -> Self {
        match v {
            1 => TableStatus::Running,
            2 => TableStatus::Stopped,
            _ => TableStatus::Initializing,
        }
    }
}

/// Watermarks and status of one table pipeline, shared with the
/// thread-safe pipeline handle.
#[derive(Debug)]
pub struct TableState {
    checkpoint_ts: AtomicU64,
    resolved_ts: AtomicU64,
    barrier_ts: AtomicU64,
    status: AtomicU64,
}

impl TableState {
    pub fn new(start_ts: Ts) -> Self {
        Self {
            checkpoint_ts: AtomicU64::new(start_ts),
            resolved_ts: AtomicU64::new(start_ts),
            barrier_ts: AtomicU64::new(start_ts),
            status: AtomicU64::new(TableStatus::Initializing as u64),
        }
    }

    pub fn checkpoint_ts(&self) -> Ts {
        self.checkpoint_ts.load(Ordering::Acquire)
    }

    pub fn resolved_ts(&self) -> Ts {
        self.resolved_ts.load(Ordering::Acquire)
    }

    pub fn barrier_ts(&self) -> Ts {
        self.barrier_ts.load(Ordering::Acquire)
    }

    pub fn status(&self) -> TableStatus {
        TableStatus::from_u64(self.status.load(Ordering::Acquire))
    }
}

/// The sink node of one table pipeline.
pub struct SinkNode {
    table_id: TableId,
    sink: Arc<dyn Sink>,
    state: Arc<TableState>,
    target_ts: Ts,
    flow: Arc<TableFlowController>,
    /// Rows awaiting the next flush, in arrival (commit-ts) order.
    buffer: Vec<RowChangedEvent>,
}

impl SinkNode {
    pub fn new(
        table_id: TableId,
        sink: Arc<dyn Sink>,
        start_ts: Ts,
        target_ts: Ts,
        flow: Arc<TableFlowController>,
    ) -> Self {
        Self {
            table_id,
            sink,
            state: Arc::new(TableState::new(start_ts)),
            target_ts,
            flow,
            buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> Arc<TableState> {
        self.state.clone()
    }

    /// Accept one event from upstream. A data event that has not been
    /// mounted yet is handed back; the actor retries next tick.
    pub async fn handle_message(
        &mut self,
        event: PolymorphicEvent,
    ) -> Result<Option<PolymorphicEvent>> {
        if !event.is_resolved() && !event.is_prepared() {
            return Ok(Some(event));
        }
        if self.state.status() == TableStatus::Initializing {
            self.state
                .status
                .store(TableStatus::Running as u64, Ordering::Release);
            info!(table_id = self.table_id, "sink node running");
        }

        if event.is_resolved() {
            let resolved = event.crts.min(self.target_ts);
            self.state.resolved_ts.store(resolved, Ordering::Release);
            self.flush_sink().await?;
            return Ok(None);
        }

        if let Some(row) = event.row {
            self.buffer.push(row);
        }
        Ok(None)
    }

    /// New barrier from the owner; monotone non-decreasing. A raised
    /// barrier may unblock buffered rows, so flush eagerly.
    pub async fn handle_barrier(&mut self, barrier_ts: Ts) -> Result<()> {
        let current = self.state.barrier_ts();
        if barrier_ts > current {
            self.state.barrier_ts.store(barrier_ts, Ordering::Release);
            self.flush_sink().await?;
        }
        Ok(())
    }

    /// Flush rows up to `min(resolved, barrier, target)` and advance the
    /// checkpoint to what the sink reports durable.
    async fn flush_sink(&mut self) -> Result<()> {
        let target = self
            .state
            .resolved_ts()
            .min(self.state.barrier_ts())
            .min(self.target_ts);
        if target <= self.state.checkpoint_ts() {
            return Ok(());
        }

        let ready: Vec<RowChangedEvent> = {
            let mut still_buffered = Vec::new();
            let mut ready = Vec::new();
            for row in self.buffer.drain(..) {
                if row.commit_ts <= target {
                    ready.push(row);
                } else {
                    still_buffered.push(row);
                }
            }
            self.buffer = still_buffered;
            ready
        };
        if !ready.is_empty() {
            self.sink.emit_row_changed_events(ready).await?;
        }

        let flushed = self
            .sink
            .flush_row_changed_events(self.table_id, target)
            .await?
            .min(target);
        if flushed > self.state.checkpoint_ts() {
            self.state.checkpoint_ts.store(flushed, Ordering::Release);
            self.flow.release(flushed);
            debug!(
                table_id = self.table_id,
                checkpoint_ts = flushed,
                "sink checkpoint advanced"
            );
        }

        if self.state.checkpoint_ts() >= self.target_ts {
            self.state
                .status
                .store(TableStatus::Stopped as u64, Ordering::Release);
            info!(
                table_id = self.table_id,
                target_ts = self.target_ts,
                "table reached target ts"
            );
        }
        Ok(())
    }

    /// Final flush on stop.
    pub async fn stop(&mut self) -> Result<()> {
        self.flush_sink().await?;
        self.state
            .status
            .store(TableStatus::Stopped as u64, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OpType, RawKvEntry, RowChangedEvent, TableName};
    use crate::sink::BlackHoleSink;
    use bytes::Bytes;

    fn prepared_event(crts: Ts) -> PolymorphicEvent {
        let mut ev = PolymorphicEvent::from_raw(RawKvEntry {
            op_type: OpType::Put,
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"v"),
            old_value: None,
            start_ts: crts - 1,
            crts,
            region_id: 1,
        });
        ev.mark_prepared(RowChangedEvent {
            start_ts: crts - 1,
            commit_ts: crts,
            table: TableName::new("shop", "orders"),
            table_id: 1,
            columns: vec![],
            pre_columns: vec![],
            replica_id: 0,
        });
        ev
    }

    fn node(start_ts: Ts, target_ts: Ts) -> (SinkNode, Arc<BlackHoleSink>) {
        let sink = Arc::new(BlackHoleSink::new());
        let flow = Arc::new(TableFlowController::new(u64::MAX));
        (
            SinkNode::new(1, sink.clone(), start_ts, target_ts, flow),
            sink,
        )
    }

    #[tokio::test]
    async fn test_unprepared_event_retried() {
        let (mut node, _sink) = node(0, u64::MAX);
        let raw = PolymorphicEvent::from_raw(RawKvEntry {
            op_type: OpType::Put,
            key: Bytes::from_static(b"k"),
            value: Bytes::new(),
            old_value: None,
            start_ts: 1,
            crts: 2,
            region_id: 1,
        });
        assert!(node.handle_message(raw).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_held_by_barrier() {
        let (mut node, sink) = node(0, u64::MAX);
        node.handle_barrier(5).await.unwrap();

        assert!(node
            .handle_message(prepared_event(10))
            .await
            .unwrap()
            .is_none());
        assert!(node
            .handle_message(PolymorphicEvent::resolved(10))
            .await
            .unwrap()
            .is_none());

        let state = node.state();
        assert_eq!(state.resolved_ts(), 10);
        // barrier at 5 caps the checkpoint
        assert_eq!(state.checkpoint_ts(), 5);
        // the row at ts 10 is still buffered, not emitted
        assert_eq!(sink.accepted(), 0);

        node.handle_barrier(20).await.unwrap();
        assert_eq!(state.checkpoint_ts(), 10);
        assert_eq!(sink.accepted(), 1);
    }

    #[tokio::test]
    async fn test_target_ts_stops_table() {
        let (mut node, _sink) = node(0, 15);
        assert!(node
            .handle_message(prepared_event(10))
            .await
            .unwrap()
            .is_none());
        node.handle_barrier(100).await.unwrap();
        assert!(node
            .handle_message(PolymorphicEvent::resolved(30))
            .await
            .unwrap()
            .is_none());

        let state = node.state();
        // resolved and checkpoint are clamped to the target
        assert_eq!(state.resolved_ts(), 15);
        assert_eq!(state.checkpoint_ts(), 15);
        assert_eq!(state.status(), TableStatus::Stopped);
    }

    #[tokio::test]
    async fn test_watermark_ordering_invariant() {
        let (mut node, sink) = node(0, u64::MAX);
        node.handle_barrier(u64::MAX).await.unwrap();

        node.handle_message(prepared_event(5)).await.unwrap();
        node.handle_message(prepared_event(8)).await.unwrap();
        node.handle_message(PolymorphicEvent::resolved(8))
            .await
            .unwrap();
        assert_eq!(node.state().checkpoint_ts(), 8);
        assert_eq!(sink.accepted(), 2);
    }
}
