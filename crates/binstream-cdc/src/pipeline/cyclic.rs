//! Cyclic mark node
//!
//! In bi-directional replication every committed transaction writes one
//! row into a per-source mark table recording which replicator produced
//! it. This node buffers each transaction until its watermark, reads the
//! mark row, and drops the whole transaction when it originated from this
//! changefeed — otherwise replicated rows would bounce between the two
//! sides forever.
//!
//! Transactions are forwarded atomically through a bounded queue; a full
//! queue pushes back on the actor like every other node.

use std::collections::{BTreeMap, HashMap};
use std::collections::VecDeque;

use tracing::debug;

use crate::model::{PolymorphicEvent, TableId, Ts};
use crate::pipeline::mailbox::DEFAULT_OUTPUT_CHANNEL_SIZE;

/// The cyclic mark node of one table pipeline.
pub struct CyclicMarkNode {
    mark_table_id: TableId,
    local_replica_id: u64,
    /// Buffered events per commit ts, waiting for their watermark.
    pending: BTreeMap<Ts, Vec<PolymorphicEvent>>,
    /// Origin replica per commit ts, learned from mark-table rows.
    origins: HashMap<Ts, u64>,
    queue: VecDeque<PolymorphicEvent>,
    queue_cap: usize,
}

impl CyclicMarkNode {
    pub fn new(mark_table_id: TableId, local_replica_id: u64) -> Self {
        Self {
            mark_table_id,
            local_replica_id,
            pending: BTreeMap::new(),
            origins: HashMap::new(),
            queue: VecDeque::new(),
            queue_cap: DEFAULT_OUTPUT_CHANNEL_SIZE,
        }
    }

    /// Accept one event from the sorter. When the output queue is full
    /// the event is handed back; the actor stashes it and retries.
    pub fn handle_message(&mut self, event: PolymorphicEvent) -> Option<PolymorphicEvent> {
        if self.queue.len() >= self.queue_cap {
            return Some(event);
        }

        if event.is_resolved() {
            self.flush_up_to(event.crts);
            self.queue.push_back(event);
            return None;
        }

        let commit_ts = event.crts;
        if let Some(row) = &event.row {
            if row.table_id == self.mark_table_id {
                // the mark row itself is bookkeeping, never forwarded
                self.origins.insert(commit_ts, row.replica_id);
                return None;
            }
        }
        self.pending.entry(commit_ts).or_default().push(event);
        None
    }

    /// Next filtered event, if one is ready.
    pub fn fetch_output(&mut self) -> Option<PolymorphicEvent> {
        self.queue.pop_front()
    }

    fn flush_up_to(&mut self, resolved: Ts) {
        let ready: Vec<Ts> = self
            .pending
            .range(..=resolved)
            .map(|(ts, _)| *ts)
            .collect();
        for ts in ready {
            let events = self.pending.remove(&ts).unwrap_or_default();
            let origin = self.origins.remove(&ts);
            if origin == Some(self.local_replica_id) {
                debug!(
                    commit_ts = ts,
                    events = events.len(),
                    "dropped local-origin transaction"
                );
                continue;
            }
            for mut event in events {
                if let (Some(row), Some(origin)) = (event.row.as_mut(), origin) {
                    row.replica_id = origin;
                }
                self.queue.push_back(event);
            }
        }
        // origins for transactions with no data rows below the watermark
        // are stale now
        self.origins.retain(|ts, _| *ts > resolved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OpType, RawKvEntry, RowChangedEvent, TableName};
    use bytes::Bytes;

    const MARK_TABLE: TableId = 99;
    const LOCAL: u64 = 1;
    const REMOTE: u64 = 2;

    fn row_event(table_id: TableId, crts: Ts, replica_id: u64) -> PolymorphicEvent {
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
            table_id,
            columns: vec![],
            pre_columns: vec![],
            replica_id,
        });
        ev
    }

    #[test]
    fn test_local_transaction_dropped() {
        let mut node = CyclicMarkNode::new(MARK_TABLE, LOCAL);
        assert!(node.handle_message(row_event(1, 10, 0)).is_none());
        assert!(node.handle_message(row_event(MARK_TABLE, 10, LOCAL)).is_none());
        assert!(node.handle_message(PolymorphicEvent::resolved(10)).is_none());

        // the whole transaction vanished; only the watermark comes out
        let out: Vec<_> = std::iter::from_fn(|| node.fetch_output()).collect();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_resolved());
    }

    #[test]
    fn test_remote_transaction_forwarded_with_origin() {
        let mut node = CyclicMarkNode::new(MARK_TABLE, LOCAL);
        assert!(node.handle_message(row_event(1, 10, 0)).is_none());
        assert!(node.handle_message(row_event(MARK_TABLE, 10, REMOTE)).is_none());
        assert!(node.handle_message(PolymorphicEvent::resolved(10)).is_none());

        let out: Vec<_> = std::iter::from_fn(|| node.fetch_output()).collect();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].row.as_ref().unwrap().replica_id, REMOTE);
        assert!(out[1].is_resolved());
    }

    #[test]
    fn test_unmarked_transaction_forwarded() {
        let mut node = CyclicMarkNode::new(MARK_TABLE, LOCAL);
        assert!(node.handle_message(row_event(1, 10, 0)).is_none());
        assert!(node.handle_message(PolymorphicEvent::resolved(10)).is_none());

        let out: Vec<_> = std::iter::from_fn(|| node.fetch_output()).collect();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_transactions_held_until_watermark() {
        let mut node = CyclicMarkNode::new(MARK_TABLE, LOCAL);
        assert!(node.handle_message(row_event(1, 20, 0)).is_none());
        assert!(node.handle_message(PolymorphicEvent::resolved(10)).is_none());

        let out: Vec<_> = std::iter::from_fn(|| node.fetch_output()).collect();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_resolved());

        assert!(node.handle_message(PolymorphicEvent::resolved(20)).is_none());
        let out: Vec<_> = std::iter::from_fn(|| node.fetch_output()).collect();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].crts, 20);
    }

    #[test]
    fn test_full_queue_pushes_back() {
        let mut node = CyclicMarkNode::new(MARK_TABLE, LOCAL);
        node.queue_cap = 1;
        assert!(node.handle_message(PolymorphicEvent::resolved(5)).is_none());
        // queue now holds the watermark; nothing else is admitted
        assert!(node.handle_message(row_event(1, 10, 0)).is_some());
        node.fetch_output().unwrap();
        assert!(node.handle_message(row_event(1, 10, 0)).is_none());
    }
}
