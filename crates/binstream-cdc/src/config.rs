//! Changefeed configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::TableId;

/// Redo-log consistency policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistentLevel {
    #[default]
    None,
    Eventual,
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConsistentConfig {
    pub level: ConsistentLevel,
}

/// Loop-prevention settings for bi-directional replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CyclicConfig {
    pub enabled: bool,
    /// Identity this changefeed writes into mark tables.
    pub replica_id: u64,
    /// Whether DDL is replicated in cyclic mode.
    pub sync_ddl: bool,
}

impl CyclicConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Per-changefeed replication configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Sorter flow-control budget per table, in bytes.
    pub per_table_memory_quota: u64,
    /// Verify the GC safepoint before running.
    pub check_gc_safe_point: bool,
    pub sync_point_enabled: bool,
    pub sync_point_interval: Duration,
    pub consistent: ConsistentConfig,
    pub cyclic: Option<CyclicConfig>,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            per_table_memory_quota: 10 * 1024 * 1024,
            check_gc_safe_point: true,
            sync_point_enabled: false,
            sync_point_interval: Duration::from_secs(600),
            consistent: ConsistentConfig::default(),
            cyclic: None,
        }
    }
}

impl ReplicaConfig {
    pub fn cyclic_enabled(&self) -> bool {
        self.cyclic.as_ref().is_some_and(|c| c.is_enabled())
    }

    /// Mark-table id for a replica table in cyclic mode; zero disables the
    /// cyclic node for the table.
    pub fn cyclic_mark_table_id(&self, mark_table_id: TableId) -> TableId {
        if self.cyclic_enabled() {
            mark_table_id
        } else {
            0
        }
    }
}
