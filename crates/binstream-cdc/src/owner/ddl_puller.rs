//! DDL puller
//!
//! Streams DDL jobs from upstream with their own resolved-ts watermark,
//! queueing them in finished-ts order for the owner. The owner starts it
//! from `checkpoint - 1` so a DDL committed exactly at the checkpoint is
//! re-delivered and re-applied idempotently after a restart.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::Result;
use crate::model::{DdlJob, Ts};

/// One element of the upstream DDL stream.
#[derive(Debug, Clone)]
pub enum DdlEntry {
    Job(DdlJob),
    Resolved(Ts),
}

/// Upstream source of DDL jobs and watermarks.
#[async_trait]
pub trait DdlStream: Send {
    async fn next(&mut self) -> Result<DdlEntry>;
}

/// Owner-facing view of the DDL queue.
pub trait DdlPuller: Send + Sync {
    /// The front job's finished ts and the job itself, or the stream's
    /// resolved ts when the queue is empty.
    fn front_ddl(&self) -> (Ts, Option<DdlJob>);

    fn pop_front_ddl(&self);
}

/// DDL puller fed from a [`DdlStream`].
pub struct ChannelDdlPuller {
    start_ts: Ts,
    resolved_ts: AtomicU64,
    queue: Mutex<VecDeque<DdlJob>>,
    last_job_id: AtomicU64,
}

impl ChannelDdlPuller {
    pub fn new(start_ts: Ts) -> Arc<Self> {
        Arc::new(Self {
            start_ts,
            resolved_ts: AtomicU64::new(start_ts),
            queue: Mutex::new(VecDeque::new()),
            last_job_id: AtomicU64::new(0),
        })
    }

    /// Consume the stream until it ends or `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        mut stream: Box<dyn DdlStream>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(start_ts = self.start_ts, "DDL puller started");
        loop {
            let entry = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                entry = stream.next() => entry?,
            };
            match entry {
                DdlEntry::Job(job) => self.push_job(job),
                DdlEntry::Resolved(ts) => {
                    self.resolved_ts.fetch_max(ts, Ordering::AcqRel);
                }
            }
        }
    }

    fn push_job(&self, job: DdlJob) {
        if job.finished_ts <= self.start_ts {
            debug!(job_id = job.id, finished_ts = job.finished_ts, "skip stale DDL job");
            return;
        }
        // the stream may re-deliver after reconnect
        if self.last_job_id.swap(job.id, Ordering::AcqRel) == job.id {
            debug!(job_id = job.id, "skip duplicated DDL job");
            return;
        }
        debug!(job_id = job.id, query = %job.query, "received DDL job");
        self.queue.lock().push_back(job);
    }
}

impl DdlPuller for ChannelDdlPuller {
    fn front_ddl(&self) -> (Ts, Option<DdlJob>) {
        let queue = self.queue.lock();
        match queue.front() {
            Some(job) => (job.finished_ts, Some(job.clone())),
            None => (self.resolved_ts.load(Ordering::Acquire), None),
        }
    }

    fn pop_front_ddl(&self) {
        if let Some(job) = self.queue.lock().pop_front() {
            debug!(job_id = job.id, "popped DDL job");
        }
    }
}
