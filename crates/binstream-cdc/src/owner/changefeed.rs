//! Changefeed owner
//!
//! Drives one changefeed's lifecycle from ticks against the metadata
//! store: preflight reconciliation of task records, lazy initialization
//! of the DDL puller / DDL sink / scheduler / redo manager, barrier
//! handling (DDL, sync point, finish), watermark advancement clamped to
//! the minimum barrier, and teardown on stop or removal.
//!
//! Every background task throws into one bounded error channel; the
//! owner converts thrown errors into feed state transitions so external
//! observers see the failure in the metadata store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{CdcError, Result};
use crate::gc::GcManager;
use crate::model::{
    AdminJobType, CaptureId, CaptureInfo, ChangeFeedStatus, ChangefeedId, DdlEvent, DdlJob,
    TableName, TaskStatus, Ts,
};
use crate::owner::barriers::{BarrierType, Barriers};
use crate::owner::ddl_puller::{ChannelDdlPuller, DdlPuller, DdlStream};
use crate::owner::ddl_sink::{DdlSink, SyncPointStore, DEFAULT_ERR_CH_SIZE};
use crate::owner::feed_state::FeedStateManager;
use crate::owner::schema::SchemaSnapshot;
use crate::redo::RedoManager;
use crate::scheduler::{Scheduler, CHECKPOINT_CANNOT_PROCEED};
use crate::sink::Sink;
use crate::state::ChangefeedState;

/// TTL for the service GC safepoint taken at initialization.
const GC_ENSURE_TTL_SECS: u64 = 600;

/// Ts values carry milliseconds in their upper bits, TSO style.
const TS_PHYSICAL_SHIFT: u32 = 18;

/// The ts one `interval` after `ts`.
fn sync_point_advance(ts: Ts, interval: Duration) -> Ts {
    let physical = (ts >> TS_PHYSICAL_SHIFT) + interval.as_millis() as u64;
    physical << TS_PHYSICAL_SHIFT
}

/// Component factories, injectable for tests.
pub struct ChangefeedFactories {
    /// DDL stream starting from the given ts (exclusive).
    pub ddl_stream: Box<dyn Fn(Ts) -> Box<dyn DdlStream> + Send + Sync>,
    /// Schema snapshot as of the given ts.
    pub schema: Box<dyn Fn(Ts) -> Result<SchemaSnapshot> + Send + Sync>,
    /// Downstream sink for DDL and checkpoint broadcasting.
    pub sink: Box<dyn Fn() -> Arc<dyn Sink> + Send + Sync>,
    /// Scheduler starting from the given checkpoint.
    pub scheduler: Box<dyn Fn(Ts) -> Box<dyn Scheduler> + Send + Sync>,
    /// Sync point store; required when sync points are enabled.
    pub sync_point_store: Option<Arc<dyn SyncPointStore>>,
}

/// The owner-side state machine of one changefeed.
pub struct Changefeed {
    id: ChangefeedId,
    /// This capture's address, recorded in error reports.
    addr: String,
    gc_manager: Arc<dyn GcManager>,
    factories: ChangefeedFactories,

    barriers: Barriers,
    feed_state: FeedStateManager,
    scheduler: Option<Box<dyn Scheduler>>,
    schema: Option<SchemaSnapshot>,
    sink: Option<Arc<DdlSink>>,
    ddl_puller: Option<Arc<ChannelDdlPuller>>,
    redo_manager: Option<Arc<RedoManager>>,

    initialized: bool,
    is_removed: bool,
    /// The DDL event being applied; cleared once the sink reports done.
    ddl_event_cache: Option<DdlEvent>,
    /// Table list frozen while a DDL is in flight, so checkpoint
    /// broadcasts never name tables the DDL has not created downstream.
    current_table_names: Option<Vec<TableName>>,

    err_tx: mpsc::Sender<CdcError>,
    err_rx: mpsc::Receiver<CdcError>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Changefeed {
    pub fn new(
        id: impl Into<ChangefeedId>,
        addr: impl Into<String>,
        gc_manager: Arc<dyn GcManager>,
        factories: ChangefeedFactories,
    ) -> Self {
        let (err_tx, err_rx) = mpsc::channel(DEFAULT_ERR_CH_SIZE);
        Self {
            id: id.into(),
            addr: addr.into(),
            gc_manager,
            factories,
            barriers: Barriers::new(),
            feed_state: FeedStateManager::new(),
            scheduler: None,
            schema: None,
            sink: None,
            ddl_puller: None,
            redo_manager: None,
            initialized: false,
            is_removed: false,
            ddl_event_cache: None,
            current_table_names: None,
            err_tx,
            err_rx,
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    /// Channel that table pipelines and other per-feed tasks throw into.
    pub fn error_sender(&self) -> mpsc::Sender<CdcError> {
        self.err_tx.clone()
    }

    /// Queue an admin request (pause / resume / remove).
    pub fn push_admin_job(&mut self, job: AdminJobType) {
        self.feed_state.push_admin_job(job);
    }

    pub fn is_removed(&self) -> bool {
        self.is_removed
    }

    /// One owner tick. Errors never escape: they become feed state
    /// transitions plus a resource release.
    pub async fn tick(
        &mut self,
        state: &mut ChangefeedState,
        captures: &HashMap<CaptureId, CaptureInfo>,
    ) {
        if let Err(err) = self.tick_inner(state, captures).await {
            error!(changefeed = %state.id, error = %err, "an error occurred in owner");
            let addr = self.addr.clone();
            self.feed_state.handle_error(state, &err, &addr);
            self.release_resources(state).await;
        }
    }

    async fn tick_inner(
        &mut self,
        state: &mut ChangefeedState,
        captures: &HashMap<CaptureId, CaptureInfo>,
    ) -> Result<()> {
        self.feed_state.tick(state);

        let checkpoint_ts = state.info.get_checkpoint_ts(state.status.as_ref());
        // must run before should_running so a stopped or errored feed is
        // still checked against GC
        self.check_stale_checkpoint_ts(state, checkpoint_ts).await?;

        if !self.feed_state.should_running() {
            self.is_removed = self.feed_state.should_removed();
            self.release_resources(state).await;
            return Ok(());
        }

        if !self.preflight_check(state, captures) {
            return Ok(());
        }
        self.initialize(state).await?;

        if let Ok(err) = self.err_rx.try_recv() {
            return Err(err);
        }

        if self.current_table_names.is_none() {
            let names = self.schema().all_table_names();
            debug!(changefeed = %self.id, tables = names.len(), "current table names updated");
            self.current_table_names = Some(names);
        }
        if let (Some(sink), Some(names)) = (&self.sink, &self.current_table_names) {
            sink.emit_checkpoint_ts(checkpoint_ts, names.clone());
        }

        let barrier_ts = self.handle_barrier(state).await?;
        if barrier_ts < checkpoint_ts {
            // the DDL resolved ts has not reached the checkpoint yet;
            // scheduling or status updates would be premature
            debug!(
                changefeed = %self.id,
                barrier_ts,
                checkpoint_ts,
                "barrier ts below checkpoint ts, skip tick"
            );
            return Ok(());
        }

        let current_tables = self.schema().all_physical_tables();
        let scheduler = self
            .scheduler
            .as_mut()
            .ok_or_else(|| CdcError::Internal("scheduler not initialized".into()))?;
        let (mut new_checkpoint_ts, mut new_resolved_ts) =
            scheduler.tick(state, &current_tables, captures).await?;

        if new_checkpoint_ts == CHECKPOINT_CANNOT_PROCEED {
            // not all tables are replicating normally; hold the
            // global watermarks
            return Ok(());
        }
        new_resolved_ts = new_resolved_ts.min(barrier_ts);
        new_checkpoint_ts = new_checkpoint_ts.min(barrier_ts);
        self.update_status(state, new_checkpoint_ts, new_resolved_ts);
        Ok(())
    }

    async fn check_stale_checkpoint_ts(
        &self,
        state: &ChangefeedState,
        checkpoint_ts: Ts,
    ) -> Result<()> {
        use crate::model::FeedState::*;
        if !state.info.config.check_gc_safe_point {
            return Ok(());
        }
        if matches!(state.info.state, Normal | Stopped | Error) {
            self.gc_manager
                .check_stale_checkpoint_ts(&self.id, checkpoint_ts)
                .await?;
        }
        Ok(())
    }

    /// Reconstruct missing metadata and drop records of departed
    /// captures. Returns `false` when anything was patched; the tick is
    /// skipped so the next one observes a complete state.
    fn preflight_check(
        &self,
        state: &mut ChangefeedState,
        captures: &HashMap<CaptureId, CaptureInfo>,
    ) -> bool {
        let mut ok = true;
        if state.status.is_none() {
            let start_ts = state.info.start_ts;
            state.patch_status(|status| match status {
                None => (
                    Some(ChangeFeedStatus {
                        checkpoint_ts: start_ts,
                        resolved_ts: start_ts,
                        admin_job_type: AdminJobType::None,
                    }),
                    true,
                ),
                some => (some, false),
            });
            ok = false;
        }
        for capture_id in captures.keys() {
            if !state.task_statuses.contains_key(capture_id) {
                state.patch_task_status(capture_id, |status| match status {
                    None => (Some(TaskStatus::default()), true),
                    some => (some, false),
                });
                ok = false;
            }
        }
        for capture_id in state.task_statuses.keys().cloned().collect::<Vec<_>>() {
            if !captures.contains_key(&capture_id) {
                state.patch_task_status(&capture_id, |status| (None, status.is_some()));
                ok = false;
            }
        }
        for capture_id in state.task_positions.keys().cloned().collect::<Vec<_>>() {
            if !captures.contains_key(&capture_id) {
                state.patch_task_position(&capture_id, |position| (None, position.is_some()));
                ok = false;
            }
        }
        for capture_id in state.workloads.keys().cloned().collect::<Vec<_>>() {
            if !captures.contains_key(&capture_id) {
                state.patch_task_workload(&capture_id, |workload| (None, workload.is_some()));
                ok = false;
            }
        }
        ok
    }

    async fn initialize(&mut self, state: &mut ChangefeedState) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        // the instance is reused across resume; stale errors from the
        // previous run must not fail this one
        while self.err_rx.try_recv().is_ok() {}

        let checkpoint_ts = state.info.get_checkpoint_ts(state.status.as_ref());
        info!(changefeed = %state.id, checkpoint_ts, "initialize changefeed");

        if state.info.config.check_gc_safe_point {
            self.gc_manager
                .ensure_changefeed_start_ts_safety(&self.id, GC_ENSURE_TTL_SECS, checkpoint_ts)
                .await?;
        }

        if state.info.config.sync_point_enabled {
            self.barriers.update(BarrierType::SyncPoint, checkpoint_ts);
        } else {
            self.barriers.remove(BarrierType::SyncPoint);
        }
        // the DDL puller starts from (checkpoint - 1) so the DDL committed
        // exactly at the checkpoint is re-delivered and re-applied
        // idempotently; the barrier starts there too
        self.barriers.update(BarrierType::DdlJob, checkpoint_ts - 1);
        self.barriers
            .update(BarrierType::Finish, state.info.get_target_ts());

        self.schema = Some((self.factories.schema)(checkpoint_ts - 1)?);

        let sync_point_store = if state.info.config.sync_point_enabled {
            match &self.factories.sync_point_store {
                Some(store) => Some(store.clone()),
                None => {
                    return Err(CdcError::Config(
                        "sync points enabled without a sync point store".into(),
                    ))
                }
            }
        } else {
            None
        };
        let sink = Arc::new(DdlSink::new(
            self.id.clone(),
            (self.factories.sink)(),
            sync_point_store,
        ));
        sink.run(self.err_tx.clone()).await?;
        self.sink = Some(sink);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let puller = ChannelDdlPuller::new(checkpoint_ts - 1);
        let stream = (self.factories.ddl_stream)(checkpoint_ts - 1);
        let err_tx = self.err_tx.clone();
        let run = {
            let puller = puller.clone();
            async move {
                if let Err(e) = puller.run(stream, shutdown_rx).await {
                    let _ = err_tx.try_send(e);
                }
            }
        };
        self.tasks.push(tokio::spawn(run));
        self.ddl_puller = Some(puller);
        self.shutdown = Some(shutdown_tx);

        self.redo_manager = Some(Arc::new(RedoManager::new(&state.info.config.consistent)));
        self.scheduler = Some((self.factories.scheduler)(checkpoint_ts));

        self.initialized = true;
        Ok(())
    }

    async fn handle_barrier(&mut self, state: &mut ChangefeedState) -> Result<Ts> {
        let (barrier_tp, barrier_ts) = self.barriers.min();
        let status = state
            .status
            .ok_or_else(|| CdcError::State("status missing after preflight".into()))?;
        let blocked =
            barrier_ts == status.checkpoint_ts && barrier_ts == status.resolved_ts;

        match barrier_tp {
            BarrierType::DdlJob => {
                let puller = self
                    .ddl_puller
                    .as_ref()
                    .ok_or_else(|| CdcError::Internal("ddl puller not initialized".into()))?
                    .clone();
                let (ddl_resolved_ts, ddl_job) = puller.front_ddl();
                if ddl_job.is_none() || ddl_resolved_ts != barrier_ts {
                    if ddl_resolved_ts < barrier_ts {
                        return Ok(barrier_ts);
                    }
                    self.barriers.update(BarrierType::DdlJob, ddl_resolved_ts);
                    return Ok(barrier_ts);
                }
                if !blocked {
                    return Ok(barrier_ts);
                }
                let job = ddl_job.expect("checked above");
                let done = self.async_exec_ddl(state, &job).await?;
                if !done {
                    return Ok(barrier_ts);
                }
                puller.pop_front_ddl();
                let (new_ddl_resolved_ts, _) = puller.front_ddl();
                self.barriers
                    .update(BarrierType::DdlJob, new_ddl_resolved_ts);
            }
            BarrierType::SyncPoint => {
                if !blocked {
                    return Ok(barrier_ts);
                }
                let next = sync_point_advance(barrier_ts, state.info.config.sync_point_interval);
                self.sink()
                    .ok_or_else(|| CdcError::Internal("ddl sink not initialized".into()))?
                    .emit_sync_point(barrier_ts)
                    .await?;
                self.barriers.update(BarrierType::SyncPoint, next);
            }
            BarrierType::Finish => {
                if !blocked {
                    return Ok(barrier_ts);
                }
                self.feed_state.mark_finished(state);
            }
        }
        Ok(barrier_ts)
    }

    /// Drive one DDL job towards downstream application. Returns `true`
    /// once the job is durably applied (or skippable); until then the
    /// owner keeps calling with the same job on every blocked tick.
    async fn async_exec_ddl(
        &mut self,
        state: &mut ChangefeedState,
        job: &DdlJob,
    ) -> Result<bool> {
        if let Some(cyclic) = &state.info.config.cyclic {
            if cyclic.is_enabled() && !cyclic.sync_ddl {
                info!(changefeed = %self.id, job_id = job.id,
                      "ignore the DDL job, cyclic replication without sync-ddl");
                return Ok(true);
            }
        }

        if self
            .ddl_event_cache
            .as_ref()
            .map_or(true, |cached| cached.commit_ts != job.finished_ts)
        {
            let schema = self
                .schema
                .as_mut()
                .ok_or_else(|| CdcError::Internal("schema not initialized".into()))?;
            let event = schema.build_ddl_event(job)?;
            // freeze the pre-DDL table list while the DDL is in flight
            self.current_table_names = Some(schema.all_table_names());
            schema.handle_ddl(job)?;
            if let Some(redo) = &self.redo_manager {
                if redo.enabled() {
                    redo.emit_ddl_event(&event)?;
                }
            }
            self.ddl_event_cache = Some(event);
        }

        if self.schema().is_ineligible_table(job.table_id) {
            warn!(changefeed = %self.id, job_id = job.id, table_id = job.table_id,
                  "ignore the DDL job of ineligible table");
            self.ddl_event_cache = None;
            self.current_table_names = None;
            return Ok(true);
        }

        let event = self.ddl_event_cache.clone().expect("cached above");
        let done = self
            .sink()
            .ok_or_else(|| CdcError::Internal("ddl sink not initialized".into()))?
            .emit_ddl_event(&event)?;
        if done {
            self.ddl_event_cache = None;
            // expired: broadcast the post-DDL table list from now on
            self.current_table_names = None;
        }
        Ok(done)
    }

    fn update_status(&self, state: &mut ChangefeedState, checkpoint_ts: Ts, resolved_ts: Ts) {
        state.patch_status(|status| match status {
            Some(mut status) => {
                let mut changed = false;
                if status.resolved_ts != resolved_ts {
                    status.resolved_ts = resolved_ts;
                    changed = true;
                }
                if status.checkpoint_ts != checkpoint_ts {
                    status.checkpoint_ts = checkpoint_ts;
                    changed = true;
                }
                (Some(status), changed)
            }
            None => (None, false),
        });
    }

    /// Tear everything down; idempotent.
    pub async fn release_resources(&mut self, state: &ChangefeedState) {
        if !self.initialized {
            self.cleanup_redo(state);
            return;
        }
        info!(changefeed = %state.id, is_removed = self.is_removed, "close changefeed");
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.ddl_puller = None;
        self.schema = None;
        self.cleanup_redo(state);
        if let Some(sink) = self.sink.take() {
            // the sink close must not block on a dead downstream
            if let Err(e) = sink.close().await {
                warn!(changefeed = %state.id, error = %e, "closing sink failed in owner");
            }
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.close().await;
        }
        self.ddl_event_cache = None;
        self.current_table_names = None;
        self.initialized = false;
    }

    fn cleanup_redo(&mut self, state: &ChangefeedState) {
        if !self.is_removed {
            return;
        }
        // removing a paused feed: the manager may not exist yet
        let redo = self
            .redo_manager
            .get_or_insert_with(|| Arc::new(RedoManager::new(&state.info.config.consistent)));
        if redo.enabled() {
            if let Err(e) = redo.cleanup() {
                error!(changefeed = %state.id, error = %e, "cleanup redo logs failed");
            }
        }
    }

    fn schema(&self) -> &SchemaSnapshot {
        self.schema.as_ref().expect("schema initialized")
    }

    fn sink(&self) -> Option<Arc<DdlSink>> {
        self.sink.clone()
    }

    #[cfg(test)]
    pub(crate) fn barriers(&self) -> &Barriers {
        &self.barriers
    }

    #[cfg(test)]
    pub(crate) fn initialized(&self) -> bool {
        self.initialized
    }
}
