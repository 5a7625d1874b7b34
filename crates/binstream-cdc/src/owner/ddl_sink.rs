//! DDL sink
//!
//! Serializes DDL emission for the owner and periodically broadcasts the
//! checkpoint ts downstream. DDL application is asynchronous: the owner
//! keeps calling [`DdlSink::emit_ddl_event`] until it returns `true`,
//! which only happens once the downstream application is durable
//! (`ddl_finished_ts` advanced past the DDL's commit ts). When
//! sync points are enabled, the owner also records one per interval
//! through the sync-point store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{CdcError, Result};
use crate::model::{ChangefeedId, DdlEvent, TableName, Ts};
use crate::sink::Sink;

/// How often the recorded checkpoint is pushed downstream.
const CHECKPOINT_EMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the owner error channel.
pub const DEFAULT_ERR_CH_SIZE: usize = 1024;

/// Downstream store recording sync points (a mapping between upstream
/// and downstream read views).
#[async_trait]
pub trait SyncPointStore: Send + Sync {
    async fn create_sync_table(&self) -> Result<()>;
    async fn sink_sync_point(&self, id: &ChangefeedId, checkpoint_ts: Ts) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct CheckpointRecord {
    checkpoint_ts: Ts,
    table_names: Vec<TableName>,
}

/// The owner's DDL sink.
pub struct DdlSink {
    id: ChangefeedId,
    sink: Arc<dyn Sink>,
    sync_point_store: Option<Arc<dyn SyncPointStore>>,
    last_sync_point: Mutex<Ts>,

    record: Arc<Mutex<CheckpointRecord>>,
    ddl_finished_ts: Arc<AtomicU64>,
    ddl_sent_ts: AtomicU64,

    ddl_tx: mpsc::Sender<DdlEvent>,
    ddl_rx: Mutex<Option<mpsc::Receiver<DdlEvent>>>,

    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DdlSink {
    pub fn new(
        id: ChangefeedId,
        sink: Arc<dyn Sink>,
        sync_point_store: Option<Arc<dyn SyncPointStore>>,
    ) -> Self {
        // capacity 1: at most one DDL is in flight, the owner retries the
        // rest on later ticks
        let (ddl_tx, ddl_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            sink,
            sync_point_store,
            last_sync_point: Mutex::new(0),
            record: Arc::new(Mutex::new(CheckpointRecord::default())),
            ddl_finished_ts: Arc::new(AtomicU64::new(0)),
            ddl_sent_ts: AtomicU64::new(0),
            ddl_tx,
            ddl_rx: Mutex::new(Some(ddl_rx)),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Start the background loop; errors are thrown to the owner.
    pub async fn run(&self, throw: mpsc::Sender<CdcError>) -> Result<()> {
        if let Some(store) = &self.sync_point_store {
            store.create_sync_table().await?;
        }
        let mut ddl_rx = self
            .ddl_rx
            .lock()
            .take()
            .ok_or_else(|| CdcError::Internal("ddl sink started twice".into()))?;

        let id = self.id.clone();
        let sink = self.sink.clone();
        let record = self.record.clone();
        let ddl_finished_ts = self.ddl_finished_ts.clone();
        let mut shutdown = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + CHECKPOINT_EMIT_INTERVAL,
                CHECKPOINT_EMIT_INTERVAL,
            );
            let mut last_checkpoint_ts: Ts = 0;
            info!(changefeed = %id, "ddl sink initialized, start processing");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {
                        let (checkpoint_ts, tables) = {
                            let record = record.lock();
                            (record.checkpoint_ts, record.table_names.clone())
                        };
                        if checkpoint_ts == 0 || checkpoint_ts <= last_checkpoint_ts {
                            continue;
                        }
                        last_checkpoint_ts = checkpoint_ts;
                        if let Err(e) = sink.emit_checkpoint_ts(checkpoint_ts, &tables).await {
                            let _ = throw.try_send(e);
                            return;
                        }
                    }
                    ddl = ddl_rx.recv() => {
                        let Some(ddl) = ddl else { return };
                        info!(changefeed = %id, query = %ddl.query,
                              commit_ts = ddl.commit_ts, "begin emit ddl event");
                        match sink.emit_ddl_event(&ddl).await {
                            Ok(()) => {
                                info!(changefeed = %id, commit_ts = ddl.commit_ts,
                                      "execute DDL succeeded");
                                ddl_finished_ts.fetch_max(ddl.commit_ts, Ordering::AcqRel);
                            }
                            Err(e) if e.is_ignorable() => {
                                info!(changefeed = %id, commit_ts = ddl.commit_ts,
                                      error = %e, "execute DDL ignored, treated as success");
                                ddl_finished_ts.fetch_max(ddl.commit_ts, Ordering::AcqRel);
                            }
                            Err(e) => {
                                error!(changefeed = %id, commit_ts = ddl.commit_ts,
                                       error = %e, "execute DDL failed");
                                let _ = throw.try_send(e);
                                return;
                            }
                        }
                    }
                }
            }
        });
        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Record the checkpoint to broadcast; returns immediately, the
    /// background loop pushes it downstream once per second.
    pub fn emit_checkpoint_ts(&self, ts: Ts, table_names: Vec<TableName>) {
        let mut record = self.record.lock();
        record.checkpoint_ts = ts;
        record.table_names = table_names;
    }

    /// Hand a DDL to the background loop. Returns `true` once the DDL has
    /// been durably applied downstream; the owner calls this repeatedly
    /// with the same event until then.
    pub fn emit_ddl_event(&self, ddl: &DdlEvent) -> Result<bool> {
        let finished = self.ddl_finished_ts.load(Ordering::Acquire);
        if ddl.commit_ts <= finished {
            info!(changefeed = %self.id, commit_ts = ddl.commit_ts,
                  ddl_finished_ts = finished, "ddl already executed");
            return Ok(true);
        }
        if ddl.commit_ts <= self.ddl_sent_ts.load(Ordering::Acquire) {
            debug!(changefeed = %self.id, commit_ts = ddl.commit_ts,
                   "ddl is not finished yet");
            return Ok(false);
        }
        match self.ddl_tx.try_send(ddl.clone()) {
            Ok(()) => {
                self.ddl_sent_ts.store(ddl.commit_ts, Ordering::Release);
                info!(changefeed = %self.id, commit_ts = ddl.commit_ts, "ddl is sent");
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(changefeed = %self.id, commit_ts = ddl.commit_ts,
                      "ddl chan full, send it the next round");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(CdcError::SendToClosedPipeline);
            }
        }
        Ok(false)
    }

    /// Record a sync point at `checkpoint_ts`, once per distinct ts.
    pub async fn emit_sync_point(&self, checkpoint_ts: Ts) -> Result<()> {
        {
            let mut last = self.last_sync_point.lock();
            if checkpoint_ts == *last {
                return Ok(());
            }
            *last = checkpoint_ts;
        }
        match &self.sync_point_store {
            Some(store) => store.sink_sync_point(&self.id, checkpoint_ts).await,
            None => Err(CdcError::Config("sync point store not configured".into())),
        }
    }

    pub fn ddl_finished_ts(&self) -> Ts {
        self.ddl_finished_ts.load(Ordering::Acquire)
    }

    /// Stop the background loop without waiting for in-flight downstream
    /// work (close must never hang on a dead network), then release the
    /// sink.
    pub async fn close(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        if let Some(store) = &self.sync_point_store {
            store.close().await?;
        }
        self.sink.close().await
    }
}
