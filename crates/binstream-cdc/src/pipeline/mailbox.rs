//! Actor mailbox
//!
//! A bounded single-consumer queue in front of each table actor.
//! Producers use the non-blocking [`Mailbox::try_send`]; the blocking
//! [`Mailbox::send_b`] exists only for shutdown, where losing the stop
//! message is worse than waiting.

use tokio::sync::mpsc;

use crate::error::{CdcError, Result};
use crate::model::Ts;

/// Default mailbox and node output queue capacity.
pub const DEFAULT_OUTPUT_CHANNEL_SIZE: usize = 1024;

/// Control messages delivered to a table actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorMessage {
    /// Terminate the pipeline.
    Stop,
    /// Wake the actor so it moves events between nodes.
    Tick,
    /// New barrier ts for the sink node.
    Barrier(Ts),
}

/// Producer handle of an actor mailbox; cheap to clone.
#[derive(Clone)]
pub struct Mailbox {
    tx: mpsc::Sender<ActorMessage>,
}

/// Consumer side, owned by exactly one actor task.
pub struct MailboxReceiver {
    rx: mpsc::Receiver<ActorMessage>,
}

/// Create a mailbox pair with the given capacity.
pub fn mailbox(capacity: usize) -> (Mailbox, MailboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (Mailbox { tx }, MailboxReceiver { rx })
}

impl Mailbox {
    /// Non-blocking send. `MailboxFull` asks the caller to retry on a
    /// later tick; `SendToClosedPipeline` means the actor is gone.
    pub fn try_send(&self, msg: ActorMessage) -> Result<()> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CdcError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => CdcError::SendToClosedPipeline,
        })
    }

    /// Blocking send, used only during shutdown.
    pub async fn send_b(&self, msg: ActorMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| CdcError::SendToClosedPipeline)
    }
}

impl MailboxReceiver {
    /// Wait for at least one message, then drain whatever else is queued,
    /// up to `max`.
    pub async fn recv_batch(&mut self, max: usize) -> Option<Vec<ActorMessage>> {
        let first = self.rx.recv().await?;
        let mut batch = vec![first];
        while batch.len() < max {
            match self.rx.try_recv() {
                Ok(msg) => batch.push(msg),
                Err(_) => break,
            }
        }
        Some(batch)
    }

    /// Drop the receiver, closing the mailbox.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_send_full() {
        let (mb, mut rx) = mailbox(2);
        mb.try_send(ActorMessage::Tick).unwrap();
        mb.try_send(ActorMessage::Tick).unwrap();
        assert!(matches!(
            mb.try_send(ActorMessage::Tick),
            Err(CdcError::MailboxFull)
        ));

        let batch = rx.recv_batch(16).await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_send_to_closed() {
        let (mb, rx) = mailbox(2);
        drop(rx);
        assert!(matches!(
            mb.try_send(ActorMessage::Stop),
            Err(CdcError::SendToClosedPipeline)
        ));
        assert!(matches!(
            mb.send_b(ActorMessage::Stop).await,
            Err(CdcError::SendToClosedPipeline)
        ));
    }

    #[tokio::test]
    async fn test_recv_batch_orders_messages() {
        let (mb, mut rx) = mailbox(8);
        mb.try_send(ActorMessage::Barrier(5)).unwrap();
        mb.try_send(ActorMessage::Tick).unwrap();
        mb.try_send(ActorMessage::Stop).unwrap();

        let batch = rx.recv_batch(8).await.unwrap();
        assert_eq!(
            batch,
            vec![
                ActorMessage::Barrier(5),
                ActorMessage::Tick,
                ActorMessage::Stop
            ]
        );
    }
}
