//! Changefeed data model
//!
//! Shared types flowing through the pipeline and owner: raw key-value
//! change records with resolved-ts heartbeats, mounted row events, DDL
//! jobs and events, and the changefeed / task records kept in the
//! metadata store.

mod row_change;

pub use row_change::{ColumnInfo, IndexInfo, RowChange, RowChangeType, TableInfo};

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::ReplicaConfig;

/// Commit-oracle-derived timestamp.
pub type Ts = u64;
/// Physical table id.
pub type TableId = i64;
/// Capture (worker process) id.
pub type CaptureId = String;
/// Changefeed id.
pub type ChangefeedId = String;

/// Kind of a raw change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Put,
    Delete,
    /// Watermark: no payload, only the promise that nothing older follows.
    Resolved,
}

/// Raw key-value change record emitted by the region stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawKvEntry {
    pub op_type: OpType,
    pub key: Bytes,
    pub value: Bytes,
    pub old_value: Option<Bytes>,
    pub start_ts: Ts,
    /// Commit ts, or the resolved ts for `OpType::Resolved`.
    pub crts: Ts,
    pub region_id: u64,
}

impl RawKvEntry {
    /// Memory accounting for flow control.
    pub fn approximate_size(&self) -> u64 {
        (self.key.len()
            + self.value.len()
            + self.old_value.as_ref().map_or(0, |v| v.len())
            + 40) as u64
    }
}

/// A change event moving through a table pipeline. It starts as a raw
/// record and is *prepared* once the mounter resolves it against the
/// schema into a row event.
#[derive(Debug, Clone)]
pub struct PolymorphicEvent {
    pub start_ts: Ts,
    pub crts: Ts,
    pub raw: Option<RawKvEntry>,
    pub row: Option<RowChangedEvent>,
    prepared: bool,
}

impl PolymorphicEvent {
    pub fn from_raw(raw: RawKvEntry) -> Self {
        let prepared = raw.op_type == OpType::Resolved;
        Self {
            start_ts: raw.start_ts,
            crts: raw.crts,
            raw: Some(raw),
            row: None,
            prepared,
        }
    }

    /// A pure watermark event.
    pub fn resolved(ts: Ts) -> Self {
        Self {
            start_ts: 0,
            crts: ts,
            raw: Some(RawKvEntry {
                op_type: OpType::Resolved,
                key: Bytes::new(),
                value: Bytes::new(),
                old_value: None,
                start_ts: 0,
                crts: ts,
                region_id: 0,
            }),
            row: None,
            prepared: true,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.raw
            .as_ref()
            .is_some_and(|raw| raw.op_type == OpType::Resolved)
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Attach the mounted row event.
    pub fn mark_prepared(&mut self, row: RowChangedEvent) {
        self.row = Some(row);
        self.prepared = true;
    }

    pub fn approximate_size(&self) -> u64 {
        self.raw.as_ref().map_or(40, |raw| raw.approximate_size())
    }
}

/// Qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "`{}`.`{}`", self.schema, self.table)
    }
}

/// One column of a row event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value: serde_json::Value,
}

/// A mounted row change ready for the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChangedEvent {
    pub start_ts: Ts,
    pub commit_ts: Ts,
    pub table: TableName,
    pub table_id: TableId,
    pub columns: Vec<Column>,
    pub pre_columns: Vec<Column>,
    /// Origin replica for cyclic replication; zero when not tracked.
    pub replica_id: u64,
}

/// DDL statement kinds the schema snapshot understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DdlType {
    CreateSchema,
    DropSchema,
    CreateTable,
    DropTable,
    TruncateTable,
    RenameTable,
    AddColumn,
    DropColumn,
    Other,
}

/// A DDL job pulled from the upstream DDL stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlJob {
    pub id: u64,
    pub tp: DdlType,
    pub schema_name: String,
    pub table_name: String,
    pub table_id: TableId,
    pub query: String,
    /// Commit ts the job finished at upstream.
    pub finished_ts: Ts,
}

/// A DDL event ready for downstream emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlEvent {
    pub commit_ts: Ts,
    pub table: TableName,
    pub tp: DdlType,
    pub query: String,
}

/// Lifecycle state of a changefeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedState {
    Normal,
    Error,
    Failed,
    Stopped,
    Finished,
    Removed,
}

/// Admin operation requested on a changefeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdminJobType {
    #[default]
    None,
    Pause,
    Resume,
    Remove,
    Finish,
}

/// A reportable error attached to feed / task state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningError {
    pub addr: String,
    pub code: String,
    pub message: String,
}

/// Static changefeed definition.
#[derive(Debug, Clone)]
pub struct ChangeFeedInfo {
    pub sink_uri: String,
    pub start_ts: Ts,
    /// Zero means replicate forever.
    pub target_ts: Ts,
    pub state: FeedState,
    pub error: Option<RunningError>,
    pub config: ReplicaConfig,
}

impl ChangeFeedInfo {
    pub fn new(sink_uri: impl Into<String>, start_ts: Ts) -> Self {
        Self {
            sink_uri: sink_uri.into(),
            start_ts,
            target_ts: 0,
            state: FeedState::Normal,
            error: None,
            config: ReplicaConfig::default(),
        }
    }

    /// Effective checkpoint: the status value once one exists, otherwise
    /// the configured start ts.
    pub fn get_checkpoint_ts(&self, status: Option<&ChangeFeedStatus>) -> Ts {
        status.map_or(self.start_ts, |s| s.checkpoint_ts)
    }

    pub fn get_target_ts(&self) -> Ts {
        if self.target_ts > 0 {
            self.target_ts
        } else {
            u64::MAX
        }
    }
}

/// Mutable changefeed progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFeedStatus {
    pub checkpoint_ts: Ts,
    pub resolved_ts: Ts,
    pub admin_job_type: AdminJobType,
}

/// Per-table replication start info inside a task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReplicaInfo {
    pub start_ts: Ts,
    pub mark_table_id: TableId,
}

/// Tables assigned to one capture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub tables: HashMap<TableId, TableReplicaInfo>,
}

/// Progress reported by one capture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPosition {
    pub checkpoint_ts: Ts,
    pub resolved_ts: Ts,
    pub error: Option<RunningError>,
}

/// Relative load of one table on a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub workload: u64,
}

/// Per-capture table workloads.
pub type TaskWorkload = HashMap<TableId, WorkloadInfo>;

/// A live capture process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureInfo {
    pub id: CaptureId,
    pub advertise_addr: String,
}
