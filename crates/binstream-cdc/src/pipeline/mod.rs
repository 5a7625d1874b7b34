//! Table pipeline
//!
//! One pipeline per replicated table: *puller → sorter → (cyclic mark) →
//! sink*, coordinated by a single-consumer actor. Nodes never block; a
//! node that cannot accept an event hands it back, the actor stashes it,
//! and the next tick retries. That stash-and-retry is the only
//! backpressure mechanism in the pipeline.

pub mod actor;
pub mod cyclic;
pub mod flow_control;
pub mod mailbox;
pub mod puller;
pub mod sink;
pub mod sorter;

pub use actor::{CyclicSettings, TableActorConfig, TableActorSystem, TablePipeline};
pub use cyclic::CyclicMarkNode;
pub use flow_control::TableFlowController;
pub use mailbox::{mailbox, ActorMessage, Mailbox, MailboxReceiver, DEFAULT_OUTPUT_CHANNEL_SIZE};
pub use puller::{PullerNode, RegionStream, DEFAULT_PULLER_OUTPUT_SIZE};
pub use sink::{SinkNode, TableState, TableStatus};
pub use sorter::SorterNode;

use crate::error::Result;
use crate::model::{RawKvEntry, RowChangedEvent};

/// Resolves raw key-value records against the schema into row events.
/// Returning `None` filters the record out (table/row filter rules are
/// compiled into the mounter).
pub trait Mounter: Send + Sync {
    fn mount(&self, raw: &RawKvEntry) -> Result<Option<RowChangedEvent>>;
}
