//! Puller node
//!
//! Subscribes to the key-range region stream of one table (plus its mark
//! table in cyclic mode) and forwards raw change records and resolved-ts
//! heartbeats into a bounded output channel. Runs two tasks: one reading
//! the region stream, one forwarding into the output channel and ticking
//! the table actor. Unrecoverable stream errors stop the actor through
//! its mailbox.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::model::{PolymorphicEvent, RawKvEntry, TableId};
use crate::pipeline::mailbox::{ActorMessage, Mailbox};

/// Default capacity of the puller output channel.
pub const DEFAULT_PULLER_OUTPUT_SIZE: usize = 128;

/// A subscribed stream of raw change records for a set of key ranges.
/// Region-level reconnects are retried inside the implementation; errors
/// surfacing here are unrecoverable for the pipeline.
#[async_trait]
pub trait RegionStream: Send {
    async fn next(&mut self) -> Result<RawKvEntry>;
}

/// The puller node of one table pipeline.
pub struct PullerNode {
    table_id: TableId,
    output: Option<mpsc::Receiver<PolymorphicEvent>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PullerNode {
    /// Start the two puller tasks over `stream`.
    pub fn start(
        table_id: TableId,
        table_name: &str,
        mut stream: Box<dyn RegionStream>,
        mailbox: Mailbox,
    ) -> Self {
        let (raw_tx, mut raw_rx) = mpsc::channel::<RawKvEntry>(DEFAULT_PULLER_OUTPUT_SIZE);
        let (out_tx, out_rx) = mpsc::channel::<PolymorphicEvent>(DEFAULT_PULLER_OUTPUT_SIZE);
        let (shutdown, mut shutdown_rx1) = watch::channel(false);
        let mut shutdown_rx2 = shutdown.subscribe();

        let table = table_name.to_string();
        let stop_mailbox = mailbox.clone();
        let read_task = tokio::spawn(async move {
            loop {
                let entry = tokio::select! {
                    _ = shutdown_rx1.changed() => return,
                    entry = stream.next() => entry,
                };
                match entry {
                    Ok(entry) => {
                        tokio::select! {
                            _ = shutdown_rx1.changed() => return,
                            sent = raw_tx.send(entry) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(table = %table, error = %e, "puller stopped");
                        // surface through the actor mailbox; losing the
                        // stop would leave the pipeline dangling
                        let _ = stop_mailbox.send_b(ActorMessage::Stop).await;
                        return;
                    }
                }
            }
        });

        let forward_task = tokio::spawn(async move {
            loop {
                let entry = tokio::select! {
                    _ = shutdown_rx2.changed() => return,
                    entry = raw_rx.recv() => match entry {
                        Some(entry) => entry,
                        None => return,
                    },
                };
                let event = PolymorphicEvent::from_raw(entry);
                tokio::select! {
                    _ = shutdown_rx2.changed() => return,
                    sent = out_tx.send(event) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                // wake the actor; a full mailbox is fine, the actor is
                // already busy and will drain the channel anyway
                match mailbox.try_send(ActorMessage::Tick) {
                    Ok(()) | Err(crate::error::CdcError::MailboxFull) => {}
                    Err(_) => return,
                }
            }
        });

        info!(table_id, "puller node started");
        Self {
            table_id,
            output: Some(out_rx),
            shutdown,
            tasks: vec![read_task, forward_task],
        }
    }

    /// Hand the output channel to the actor; callable once.
    pub fn take_output(&mut self) -> mpsc::Receiver<PolymorphicEvent> {
        self.output.take().expect("puller output already taken")
    }

    /// Cancel both tasks and wait for them.
    pub async fn destroy(&mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    debug!(table_id = self.table_id, error = %e, "puller task join");
                }
            }
        }
        info!(table_id = self.table_id, "puller node destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CdcError;
    use crate::model::OpType;
    use crate::pipeline::mailbox::mailbox;
    use bytes::Bytes;
    use std::collections::VecDeque;

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

    fn put(crts: u64) -> RawKvEntry {
        RawKvEntry {
            op_type: OpType::Put,
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"v"),
            old_value: None,
            start_ts: crts - 1,
            crts,
            region_id: 1,
        }
    }

    fn resolved(crts: u64) -> RawKvEntry {
        RawKvEntry {
            op_type: OpType::Resolved,
            key: Bytes::new(),
            value: Bytes::new(),
            old_value: None,
            start_ts: 0,
            crts,
            region_id: 1,
        }
    }

    #[tokio::test]
    async fn test_puller_forwards_and_ticks() {
        let (mb, mut mb_rx) = mailbox(16);
        let stream = ScriptedStream {
            entries: VecDeque::from([Ok(put(10)), Ok(resolved(10))]),
        };
        let mut node = PullerNode::start(1, "`shop`.`orders`", Box::new(stream), mb);
        let mut out = node.take_output();

        let first = out.recv().await.unwrap();
        assert_eq!(first.crts, 10);
        assert!(!first.is_resolved());
        let second = out.recv().await.unwrap();
        assert!(second.is_resolved());

        // the forwarder ticked the actor for each event
        let batch = mb_rx.recv_batch(16).await.unwrap();
        assert!(batch.iter().all(|m| *m == ActorMessage::Tick));

        node.destroy().await;
    }

    #[tokio::test]
    async fn test_puller_error_stops_actor() {
        let (mb, mut mb_rx) = mailbox(16);
        let stream = ScriptedStream {
            entries: VecDeque::from([Err(CdcError::Puller("region gone".into()))]),
        };
        let mut node = PullerNode::start(1, "t", Box::new(stream), mb);

        let batch = mb_rx.recv_batch(16).await.unwrap();
        assert!(batch.contains(&ActorMessage::Stop));
        node.destroy().await;
    }
}
