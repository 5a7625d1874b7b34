//! End-to-end backpressure through a table pipeline.
//!
//! The sorter's flow-control quota is sized so that a burst of row events
//! exhausts it. The puller→sorter edge must then stash and retry rather
//! than drop, and once the sink flushes a watermark the released quota
//! lets the stalled event through. Every event must reach the sink
//! exactly in commit-ts order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use binstream_cdc::model::{OpType, RawKvEntry, RowChangedEvent, TableReplicaInfo};
use binstream_cdc::pipeline::{Mounter, RegionStream, TableActorConfig, TableActorSystem};
use binstream_cdc::sink::Sink;
use binstream_cdc::{CdcError, DdlEvent, Result, TableId, TableName, Ts};

struct ScriptedStream {
    entries: VecDeque<Result<RawKvEntry>>,
}

#[async_trait]
impl RegionStream for ScriptedStream {
    async fn next(&mut self) -> Result<RawKvEntry> {
        match self.entries.pop_front() {
            Some(entry) => entry,
            None => std::future::pending().await,
        }
    }
}

struct PlainMounter;

impl Mounter for PlainMounter {
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

/// Records the commit ts of every row it accepts.
#[derive(Default)]
struct RecordingSink {
    rows: Mutex<Vec<Ts>>,
}

#[async_trait]
impl Sink for RecordingSink {
    async fn init(&self, _tables: Vec<TableName>) -> Result<()> {
        Ok(())
    }

    async fn emit_row_changed_events(&self, events: Vec<RowChangedEvent>) -> Result<()> {
        self.rows.lock().extend(events.iter().map(|e| e.commit_ts));
        Ok(())
    }

    async fn emit_ddl_event(&self, _ddl: &DdlEvent) -> Result<()> {
        Ok(())
    }

    async fn emit_checkpoint_ts(&self, _ts: Ts, _tables: &[TableName]) -> Result<()> {
        Ok(())
    }

    async fn flush_row_changed_events(&self, _table_id: TableId, resolved_ts: Ts) -> Result<Ts> {
        Ok(resolved_ts)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A row event of roughly 100 bytes.
fn put(crts: Ts) -> Result<RawKvEntry> {
    Ok(RawKvEntry {
        op_type: OpType::Put,
        key: Bytes::from_static(b"k"),
        value: Bytes::from(vec![0u8; 59]),
        old_value: None,
        start_ts: crts - 1,
        crts,
        region_id: 1,
    })
}

fn resolved(crts: Ts) -> Result<RawKvEntry> {
    Ok(RawKvEntry {
        op_type: OpType::Resolved,
        key: Bytes::new(),
        value: Bytes::new(),
        old_value: None,
        start_ts: 0,
        crts,
        region_id: 1,
    })
}

#[tokio::test]
async fn test_quota_stall_recovers_without_event_loss() {
    let system = TableActorSystem::new();
    let sink = Arc::new(RecordingSink::default());
    let (throw_tx, mut throw_rx) = mpsc::unbounded_channel::<CdcError>();

    // two ~100-byte events fit the 250-byte quota, the third stalls until
    // the first watermark's flush releases its bytes
    let stream = ScriptedStream {
        entries: VecDeque::from([
            put(10),
            put(20),
            resolved(20),
            put(30),
            resolved(30),
        ]),
    };
    let pipeline = system.spawn(
        TableActorConfig {
            table_id: 1,
            table_name: "`shop`.`orders`".into(),
            replica_info: TableReplicaInfo {
                start_ts: 0,
                mark_table_id: 0,
            },
            target_ts: u64::MAX,
            memory_quota: 250,
            cyclic: None,
        },
        Box::new(stream),
        Arc::new(PlainMounter),
        sink.clone(),
        throw_tx,
    );
    pipeline.update_barrier_ts(u64::MAX);

    for _ in 0..500 {
        if pipeline.checkpoint_ts() == 30 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pipeline.checkpoint_ts(), 30, "pipeline stalled");
    assert_eq!(pipeline.resolved_ts(), 30);

    // no loss, no reordering
    assert_eq!(*sink.rows.lock(), vec![10, 20, 30]);
    assert!(throw_rx.try_recv().is_err());

    assert!(pipeline.async_stop());
    pipeline.wait().await;
}
