//! Downstream sink abstraction
//!
//! Concrete kafka / mysql writers live behind this trait; the engine only
//! relies on the contract that emitted rows are applied idempotently (at
//! least once, primary-key dedup downstream) and that
//! `flush_row_changed_events` reports the durably applied checkpoint.
//!
//! Errors with the *ignorable* classification (see
//! [`CdcError::is_ignorable`]) mean the intended effect is already in
//! place, e.g. replaying a `CREATE TABLE` onto an existing table.

use async_trait::async_trait;

use crate::error::{CdcError, Result};
use crate::model::{DdlEvent, RowChangedEvent, TableId, TableName, Ts};

/// A downstream sink.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Prepare the sink for the given tables.
    async fn init(&self, tables: Vec<TableName>) -> Result<()>;

    /// Buffer row events for asynchronous application. Durability is only
    /// promised after a flush.
    async fn emit_row_changed_events(&self, events: Vec<RowChangedEvent>) -> Result<()>;

    /// Apply a DDL downstream. May fail ignorably when the DDL was
    /// already applied.
    async fn emit_ddl_event(&self, ddl: &DdlEvent) -> Result<()>;

    /// Broadcast a checkpoint ts along with the tables it covers.
    async fn emit_checkpoint_ts(&self, ts: Ts, tables: &[TableName]) -> Result<()>;

    /// Flush everything buffered for `table_id` with commit ts up to
    /// `resolved_ts`; returns the checkpoint actually reached.
    async fn flush_row_changed_events(&self, table_id: TableId, resolved_ts: Ts) -> Result<Ts>;

    /// Release the sink. Must not hang when called with work in flight.
    async fn close(&self) -> Result<()>;
}

/// A sink that drops everything, for wiring and tests.
#[derive(Debug, Default)]
pub struct BlackHoleSink {
    accepted: std::sync::atomic::AtomicU64,
}

impl BlackHoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for BlackHoleSink {
    async fn init(&self, _tables: Vec<TableName>) -> Result<()> {
        Ok(())
    }

    async fn emit_row_changed_events(&self, events: Vec<RowChangedEvent>) -> Result<()> {
        self.accepted
            .fetch_add(events.len() as u64, std::sync::atomic::Ordering::Relaxed);
        tracing::debug!(count = events.len(), "black hole sink accepted rows");
        Ok(())
    }

    async fn emit_ddl_event(&self, ddl: &DdlEvent) -> Result<()> {
        tracing::debug!(query = %ddl.query, commit_ts = ddl.commit_ts, "black hole sink accepted DDL");
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

/// Convenience constructor for sink failures.
pub fn sink_error(message: impl Into<String>) -> CdcError {
    CdcError::Sink(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TableName;

    #[tokio::test]
    async fn test_black_hole_counts_rows() {
        let sink = BlackHoleSink::new();
        sink.init(vec![TableName::new("shop", "orders")])
            .await
            .unwrap();
        sink.emit_row_changed_events(vec![]).await.unwrap();
        assert_eq!(sink.accepted(), 0);
        assert_eq!(
            sink.flush_row_changed_events(1, 42).await.unwrap(),
            42
        );
    }
}
