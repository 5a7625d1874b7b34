//! Schema snapshot
//!
//! The owner's in-memory view of the replicated tables, advanced by
//! applying DDL jobs in commit order. It also builds the downstream DDL
//! event for each job, remembering the pre-DDL table list so checkpoint
//! broadcasts stay consistent while a DDL is in flight.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::{CdcError, Result};
use crate::model::{DdlEvent, DdlJob, DdlType, TableId, TableName};

/// One table in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaTable {
    pub id: TableId,
    pub name: TableName,
}

/// Snapshot of the upstream schema at some ts.
#[derive(Debug, Default)]
pub struct SchemaSnapshot {
    tables: HashMap<TableId, SchemaTable>,
    /// Tables without a usable unique key; their DDL is skipped and their
    /// rows are not replicated.
    ineligible: HashSet<TableId>,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables(tables: impl IntoIterator<Item = SchemaTable>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.id, t)).collect(),
            ineligible: HashSet::new(),
        }
    }

    pub fn all_table_names(&self) -> Vec<TableName> {
        let mut names: Vec<TableName> = self.tables.values().map(|t| t.name.clone()).collect();
        names.sort_by(|a, b| (&a.schema, &a.table).cmp(&(&b.schema, &b.table)));
        names
    }

    pub fn all_physical_tables(&self) -> Vec<TableId> {
        let mut ids: Vec<TableId> = self
            .tables
            .keys()
            .copied()
            .filter(|id| !self.ineligible.contains(id))
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_ineligible_table(&self, id: TableId) -> bool {
        self.ineligible.contains(&id)
    }

    pub fn mark_ineligible(&mut self, id: TableId) {
        self.ineligible.insert(id);
    }

    /// Build the downstream event for a job without applying it.
    pub fn build_ddl_event(&self, job: &DdlJob) -> Result<DdlEvent> {
        if job.query.is_empty() {
            return Err(CdcError::Schema(format!("DDL job {} has no query", job.id)));
        }
        Ok(DdlEvent {
            commit_ts: job.finished_ts,
            table: TableName::new(job.schema_name.clone(), job.table_name.clone()),
            tp: job.tp,
            query: job.query.clone(),
        })
    }

    /// Apply a job to the snapshot.
    pub fn handle_ddl(&mut self, job: &DdlJob) -> Result<()> {
        debug!(job_id = job.id, tp = ?job.tp, query = %job.query, "apply DDL to schema snapshot");
        match job.tp {
            DdlType::CreateTable => {
                self.tables.insert(
                    job.table_id,
                    SchemaTable {
                        id: job.table_id,
                        name: TableName::new(job.schema_name.clone(), job.table_name.clone()),
                    },
                );
            }
            DdlType::DropTable => {
                if self.tables.remove(&job.table_id).is_none() {
                    warn!(job_id = job.id, table_id = job.table_id, "drop of unknown table");
                }
                self.ineligible.remove(&job.table_id);
            }
            DdlType::TruncateTable => {
                // the table keeps its identity here; the upstream id swap
                // is resolved by the puller's span subscription
                if !self.tables.contains_key(&job.table_id) {
                    warn!(job_id = job.id, table_id = job.table_id, "truncate of unknown table");
                }
            }
            DdlType::RenameTable => {
                match self.tables.get_mut(&job.table_id) {
                    Some(table) => {
                        table.name =
                            TableName::new(job.schema_name.clone(), job.table_name.clone());
                    }
                    None => {
                        return Err(CdcError::Schema(format!(
                            "rename of unknown table {}",
                            job.table_id
                        )))
                    }
                }
            }
            DdlType::DropSchema => {
                self.tables.retain(|_, t| t.name.schema != job.schema_name);
            }
            DdlType::CreateSchema
            | DdlType::AddColumn
            | DdlType::DropColumn
            | DdlType::Other => {}
        }
        Ok(())
    }
}
