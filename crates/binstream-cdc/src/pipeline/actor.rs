//! Table actor
//!
//! The single-consumer coordinator of one table pipeline. Exactly one
//! task dequeues the mailbox and is the sole mutator of the node graph;
//! producers only ever touch the mailbox and the puller output channel.
//!
//! Message movement is a fixed set of edges, each an explicit
//! fetcher/sender pair: events are fetched from the puller channel or a
//! node's output queue and pushed into the next node. A node that cannot
//! accept hands the event back; the edge stashes it and the actor yields
//! until the next tick.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CdcError;
use crate::model::{PolymorphicEvent, TableId, TableReplicaInfo, Ts, WorkloadInfo};
use crate::pipeline::cyclic::CyclicMarkNode;
use crate::pipeline::flow_control::TableFlowController;
use crate::pipeline::mailbox::{
    mailbox, ActorMessage, Mailbox, MailboxReceiver, DEFAULT_OUTPUT_CHANNEL_SIZE,
};
use crate::pipeline::puller::{PullerNode, RegionStream};
use crate::pipeline::sink::{SinkNode, TableState, TableStatus};
use crate::pipeline::sorter::SorterNode;
use crate::pipeline::Mounter;
use crate::sink::Sink;

/// Where an edge fetches events from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fetcher {
    /// The puller's bounded output channel.
    PullerChannel,
    /// The sorter's sorted output queue.
    SorterQueue,
    /// The cyclic node's filtered output queue.
    CyclicQueue,
}

/// Where an edge sends events to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SenderKind {
    Sorter,
    Cyclic,
    Sink,
}

struct NodeEdge {
    fetcher: Fetcher,
    sender: SenderKind,
    stash: Option<PolymorphicEvent>,
}

enum SendOutcome {
    Consumed,
    Retry(PolymorphicEvent),
    Failed(CdcError),
}

struct TableActor {
    table_id: TableId,
    puller: PullerNode,
    puller_rx: mpsc::Receiver<PolymorphicEvent>,
    sorter: SorterNode,
    cyclic: Option<CyclicMarkNode>,
    sink: SinkNode,
    edges: Vec<NodeEdge>,
    stopped: bool,
    err: Option<CdcError>,
    throw: mpsc::UnboundedSender<CdcError>,
}

impl TableActor {
    /// Handle one batch of mailbox messages. Returns `false` once the
    /// actor stopped.
    async fn poll(&mut self, msgs: Vec<ActorMessage>) -> bool {
        for msg in msgs {
            if self.stopped {
                break;
            }
            match msg {
                ActorMessage::Stop => {
                    self.stop(None);
                    break;
                }
                ActorMessage::Tick => {}
                ActorMessage::Barrier(ts) => {
                    if let Err(e) = self.sink.handle_barrier(ts).await {
                        self.stop(Some(e));
                        break;
                    }
                }
            }
            for idx in 0..self.edges.len() {
                if self.stopped {
                    break;
                }
                self.try_run_edge(idx).await;
            }
        }
        self.check_error();
        !self.stopped
    }

    /// Move events along one edge until its source runs dry or its sink
    /// pushes back.
    async fn try_run_edge(&mut self, idx: usize) {
        loop {
            let event = match self.edges[idx].stash.take() {
                Some(ev) => ev,
                None => match self.fetch(idx) {
                    Some(ev) => ev,
                    None => return,
                },
            };
            match self.send(idx, event).await {
                SendOutcome::Consumed => {}
                SendOutcome::Retry(ev) => {
                    self.edges[idx].stash = Some(ev);
                    return;
                }
                SendOutcome::Failed(e) => {
                    self.stop(Some(e));
                    return;
                }
            }
        }
    }

    fn fetch(&mut self, idx: usize) -> Option<PolymorphicEvent> {
        match self.edges[idx].fetcher {
            Fetcher::PullerChannel => self.puller_rx.try_recv().ok(),
            Fetcher::SorterQueue => self.sorter.fetch_output(),
            Fetcher::CyclicQueue => self
                .cyclic
                .as_mut()
                .expect("cyclic edge without cyclic node")
                .fetch_output(),
        }
    }

    async fn send(&mut self, idx: usize, event: PolymorphicEvent) -> SendOutcome {
        match self.edges[idx].sender {
            SenderKind::Sorter => match self.sorter.try_add_entry(event) {
                Ok(None) => SendOutcome::Consumed,
                Ok(Some(ev)) => SendOutcome::Retry(ev),
                Err(e) => SendOutcome::Failed(e),
            },
            SenderKind::Cyclic => {
                let node = self
                    .cyclic
                    .as_mut()
                    .expect("cyclic sender without cyclic node");
                match node.handle_message(event) {
                    None => SendOutcome::Consumed,
                    Some(ev) => SendOutcome::Retry(ev),
                }
            }
            SenderKind::Sink => match self.sink.handle_message(event).await {
                Ok(None) => SendOutcome::Consumed,
                Ok(Some(ev)) => SendOutcome::Retry(ev),
                Err(e) => SendOutcome::Failed(e),
            },
        }
    }

    fn stop(&mut self, err: Option<CdcError>) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.err = err;
        info!(table_id = self.table_id, "table actor will be stopped");
    }

    fn check_error(&mut self) {
        if let Some(err) = self.err.take() {
            if self.throw.send(err).is_err() {
                warn!(table_id = self.table_id, "error receiver dropped");
            }
        }
    }
}

/// Cyclic replication settings for one pipeline.
#[derive(Debug, Clone, Copy)]
pub struct CyclicSettings {
    pub local_replica_id: u64,
}

/// Everything needed to spawn one table pipeline.
pub struct TableActorConfig {
    pub table_id: TableId,
    /// Quoted schema and table, for logs.
    pub table_name: String,
    pub replica_info: TableReplicaInfo,
    pub target_ts: Ts,
    /// Sorter flow-control budget in bytes.
    pub memory_quota: u64,
    /// Enables the cyclic mark node; requires `replica_info.mark_table_id`.
    pub cyclic: Option<CyclicSettings>,
}

/// The process-wide actor runtime for table pipelines. An explicit value
/// (not a hidden singleton) so tests can run isolated systems side by
/// side; created at startup and dropped on shutdown.
#[derive(Debug, Default)]
pub struct TableActorSystem {
    _private: (),
}

impl TableActorSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the actor task for one table and return its thread-safe
    /// handle.
    pub fn spawn(
        &self,
        cfg: TableActorConfig,
        stream: Box<dyn RegionStream>,
        mounter: Arc<dyn Mounter>,
        sink: Arc<dyn Sink>,
        throw: mpsc::UnboundedSender<CdcError>,
    ) -> TablePipeline {
        let (mb, mut mb_rx) = mailbox(DEFAULT_OUTPUT_CHANNEL_SIZE);
        let start_ts = cfg.replica_info.start_ts;

        let mut puller =
            PullerNode::start(cfg.table_id, &cfg.table_name, stream, mb.clone());
        let puller_rx = puller.take_output();

        let flow = Arc::new(TableFlowController::new(cfg.memory_quota));
        let sorter = SorterNode::new(cfg.table_id, start_ts, flow.clone(), mounter);
        let cyclic = cfg.cyclic.map(|settings| {
            CyclicMarkNode::new(cfg.replica_info.mark_table_id, settings.local_replica_id)
        });
        let sink_node = SinkNode::new(cfg.table_id, sink, start_ts, cfg.target_ts, flow);
        let state = sink_node.state();

        let mut edges = vec![NodeEdge {
            fetcher: Fetcher::PullerChannel,
            sender: SenderKind::Sorter,
            stash: None,
        }];
        if cyclic.is_some() {
            edges.push(NodeEdge {
                fetcher: Fetcher::SorterQueue,
                sender: SenderKind::Cyclic,
                stash: None,
            });
            edges.push(NodeEdge {
                fetcher: Fetcher::CyclicQueue,
                sender: SenderKind::Sink,
                stash: None,
            });
        } else {
            edges.push(NodeEdge {
                fetcher: Fetcher::SorterQueue,
                sender: SenderKind::Sink,
                stash: None,
            });
        }

        let mut actor = TableActor {
            table_id: cfg.table_id,
            puller,
            puller_rx,
            sorter,
            cyclic,
            sink: sink_node,
            edges,
            stopped: false,
            err: None,
            throw,
        };

        info!(table_id = cfg.table_id, table = %cfg.table_name, "spawn and start table actor");
        let join = tokio::spawn(async move {
            while let Some(msgs) = mb_rx.recv_batch(DEFAULT_OUTPUT_CHANNEL_SIZE).await {
                if !actor.poll(msgs).await {
                    break;
                }
            }
            actor.puller.destroy().await;
            if let Err(e) = actor.sink.stop().await {
                debug!(table_id = actor.table_id, error = %e, "sink stop");
            }
            info!(table_id = actor.table_id, "table actor stopped");
        });

        TablePipeline {
            table_id: cfg.table_id,
            mark_table_id: cfg.replica_info.mark_table_id,
            table_name: cfg.table_name,
            mailbox: mb,
            state,
            join: Mutex::new(Some(join)),
        }
    }
}

/// Thread-safe handle to a running table pipeline.
pub struct TablePipeline {
    table_id: TableId,
    mark_table_id: TableId,
    table_name: String,
    mailbox: Mailbox,
    state: Arc<TableState>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TablePipeline {
    pub fn resolved_ts(&self) -> Ts {
        self.state.resolved_ts()
    }

    pub fn checkpoint_ts(&self) -> Ts {
        self.state.checkpoint_ts()
    }

    pub fn status(&self) -> TableStatus {
        self.state.status()
    }

    /// Source table and mark table ids.
    pub fn ids(&self) -> (TableId, TableId) {
        (self.table_id, self.mark_table_id)
    }

    pub fn name(&self) -> &str {
        &self.table_name
    }

    /// Constant for now; the scheduler only needs relative weights.
    pub fn workload(&self) -> WorkloadInfo {
        WorkloadInfo { workload: 1 }
    }

    /// Push a new barrier ts to the sink node.
    pub fn update_barrier_ts(&self, ts: Ts) {
        if self.state.barrier_ts() == ts {
            return;
        }
        match self.mailbox.try_send(ActorMessage::Barrier(ts)) {
            Ok(()) => {}
            Err(e) => warn!(table_id = self.table_id, error = %e, "send barrier"),
        }
    }

    /// Ask the pipeline to stop. Returns `true` when the stop is queued
    /// or the pipeline is already gone; `false` asks the caller to retry.
    pub fn async_stop(&self) -> bool {
        info!(table_id = self.table_id, "send async stop signal to table");
        match self.mailbox.try_send(ActorMessage::Stop) {
            Ok(()) => true,
            Err(CdcError::MailboxFull) => false,
            Err(_) => true,
        }
    }

    /// Blocking stop, used during shutdown.
    pub async fn cancel(&self) {
        if self.mailbox.send_b(ActorMessage::Stop).await.is_err() {
            debug!(table_id = self.table_id, "pipeline already closed");
        }
    }

    /// Wait for the actor task to finish.
    pub async fn wait(&self) {
        let join = self.join.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}
