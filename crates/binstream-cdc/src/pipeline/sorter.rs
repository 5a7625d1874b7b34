//! Sorter node
//!
//! Buffers out-of-order events in a commit-ts min-heap and releases them
//! once a resolved-ts watermark guarantees completeness: every event with
//! commit ts at or below the watermark is emitted in commit-ts order,
//! followed by the watermark itself. Admission is bounded by the table's
//! flow-control quota, and events are mounted (schema-resolved) on the
//! way out.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::model::{PolymorphicEvent, TableId, Ts};
use crate::pipeline::flow_control::TableFlowController;
use crate::pipeline::Mounter;

struct SortItem {
    crts: Ts,
    seq: u64,
    event: PolymorphicEvent,
}

impl PartialEq for SortItem {
    fn eq(&self, other: &Self) -> bool {
        self.crts == other.crts && self.seq == other.seq
    }
}
impl Eq for SortItem {}
impl PartialOrd for SortItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SortItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.crts, self.seq).cmp(&(other.crts, other.seq))
    }
}

/// The sorter node of one table pipeline.
pub struct SorterNode {
    table_id: TableId,
    heap: BinaryHeap<Reverse<SortItem>>,
    seq: u64,
    out: VecDeque<PolymorphicEvent>,
    flow: Arc<TableFlowController>,
    mounter: Arc<dyn Mounter>,
    max_resolved_ts: Ts,
}

impl SorterNode {
    pub fn new(
        table_id: TableId,
        start_ts: Ts,
        flow: Arc<TableFlowController>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            table_id,
            heap: BinaryHeap::new(),
            seq: 0,
            out: VecDeque::new(),
            flow,
            mounter,
            max_resolved_ts: start_ts,
        }
    }

    /// Admit one event. When the memory quota is exhausted the event is
    /// handed back; the caller stashes it and retries on the next tick.
    pub fn try_add_entry(
        &mut self,
        event: PolymorphicEvent,
    ) -> Result<Option<PolymorphicEvent>> {
        if event.is_resolved() {
            let resolved = event.crts;
            if resolved < self.max_resolved_ts {
                warn!(
                    table_id = self.table_id,
                    resolved,
                    max_resolved = self.max_resolved_ts,
                    "regressed resolved ts dropped"
                );
                return Ok(None);
            }
            self.max_resolved_ts = resolved;
            self.drain_up_to(resolved)?;
            self.out.push_back(event);
            return Ok(None);
        }

        if !self
            .flow
            .try_consume(event.crts, event.approximate_size())
        {
            return Ok(Some(event));
        }
        self.seq += 1;
        self.heap.push(Reverse(SortItem {
            crts: event.crts,
            seq: self.seq,
            event,
        }));
        Ok(None)
    }

    /// Next sorted event, if one is ready.
    pub fn fetch_output(&mut self) -> Option<PolymorphicEvent> {
        self.out.pop_front()
    }

    fn drain_up_to(&mut self, resolved: Ts) -> Result<()> {
        while let Some(Reverse(item)) = self.heap.peek() {
            if item.crts > resolved {
                break;
            }
            let Reverse(item) = self.heap.pop().expect("peeked item");
            let mut event = item.event;
            if !event.is_prepared() {
                let raw = event.raw.clone().expect("raw event in sorter heap");
                match self.mounter.mount(&raw)? {
                    Some(row) => event.mark_prepared(row),
                    // filtered out by the mounter's rules; its quota is
                    // reclaimed when the watermark is released
                    None => continue,
                }
            }
            self.out.push_back(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OpType, RawKvEntry, RowChangedEvent, TableName};
    use bytes::Bytes;

    struct PassthroughMounter;

    impl Mounter for PassthroughMounter {
        fn mount(&self, raw: &RawKvEntry) -> Result<Option<RowChangedEvent>> {
            Ok(Some(RowChangedEvent {
                start_ts: raw.start_ts,
                commit_ts: raw.crts,
                table: TableName::new("shop", "orders"),
                table_id: 1,
                columns: vec![],
                pre_columns: vec![],
                replica_id: 0,
            }))
        }
    }

    fn put(crts: u64, bytes: usize) -> PolymorphicEvent {
        PolymorphicEvent::from_raw(RawKvEntry {
            op_type: OpType::Put,
            key: Bytes::from(vec![0u8; bytes]),
            value: Bytes::new(),
            old_value: None,
            start_ts: crts.saturating_sub(1),
            crts,
            region_id: 1,
        })
    }

    fn sorter(quota: u64) -> (SorterNode, Arc<TableFlowController>) {
        let flow = Arc::new(TableFlowController::new(quota));
        let node = SorterNode::new(1, 0, flow.clone(), Arc::new(PassthroughMounter));
        (node, flow)
    }

    #[test]
    fn test_emits_in_commit_ts_order_per_watermark() {
        let (mut s, _flow) = sorter(u64::MAX);
        assert!(s.try_add_entry(put(30, 1)).unwrap().is_none());
        assert!(s.try_add_entry(put(10, 1)).unwrap().is_none());
        assert!(s.try_add_entry(put(20, 1)).unwrap().is_none());
        assert!(s.fetch_output().is_none());

        assert!(s.try_add_entry(PolymorphicEvent::resolved(20)).unwrap().is_none());
        let emitted: Vec<_> = std::iter::from_fn(|| s.fetch_output()).collect();
        assert_eq!(emitted.len(), 3);
        assert_eq!(emitted[0].crts, 10);
        assert!(emitted[0].is_prepared());
        assert_eq!(emitted[1].crts, 20);
        assert!(emitted[2].is_resolved());
        assert_eq!(emitted[2].crts, 20);

        // the event above the watermark stays buffered
        assert!(s.try_add_entry(PolymorphicEvent::resolved(30)).unwrap().is_none());
        let emitted: Vec<_> = std::iter::from_fn(|| s.fetch_output()).collect();
        assert_eq!(emitted[0].crts, 30);
        assert!(emitted[1].is_resolved());
    }

    #[test]
    fn test_quota_backpressure() {
        let (mut s, flow) = sorter(100);
        assert!(s.try_add_entry(put(10, 60)).unwrap().is_none());
        // would exceed quota: handed back, caller retries later
        assert!(s.try_add_entry(put(11, 60)).unwrap().is_some());

        assert!(s.try_add_entry(PolymorphicEvent::resolved(10)).unwrap().is_none());
        while s.fetch_output().is_some() {}
        // sink releases after flush
        flow.release(10);
        assert!(s.try_add_entry(put(11, 60)).unwrap().is_none());
    }

    #[test]
    fn test_regressed_watermark_dropped() {
        let (mut s, _flow) = sorter(u64::MAX);
        assert!(s.try_add_entry(PolymorphicEvent::resolved(50)).unwrap().is_none());
        while s.fetch_output().is_some() {}
        assert!(s.try_add_entry(PolymorphicEvent::resolved(40)).unwrap().is_none());
        assert!(s.fetch_output().is_none());
    }
}
