//! # binstream-cdc - changefeed engine
//!
//! Streams a captured change stream to a downstream sink while
//! preserving transactional boundaries, ordering, and at-least-once
//! delivery with idempotent application.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌─────────────┐   ┌──────────┐
//! │  Puller  │──▶│  Sorter  │──▶│ Cyclic mark │──▶│   Sink   │
//! └──────────┘   └──────────┘   │ (optional)  │   └──────────┘
//!       ▲              ▲        └─────────────┘        ▲
//!       │              │               ▲               │
//!       └──────────────┴── table actor ┴───────────────┘
//!                            ▲
//!                            │ barriers, watermarks
//!                      ┌───────────┐
//!                      │   Owner   │── DDL sink ──▶ downstream
//!                      └───────────┘
//! ```
//!
//! - Each table runs one pipeline coordinated by a single-consumer actor;
//!   nodes hand events back instead of blocking, so backpressure is
//!   stash-and-retry all the way up to the puller.
//! - The owner computes the minimum barrier across DDL / sync-point /
//!   finish and clamps watermark advancement to it, so a checkpoint never
//!   overtakes an unapplied side effect.
//! - The central ordering property: once resolved ts `R` is emitted on a
//!   stream, no later event on that stream has commit ts below `R`.

pub mod config;
pub mod error;
pub mod gc;
pub mod model;
pub mod owner;
pub mod pipeline;
pub mod redo;
pub mod scheduler;
pub mod sink;
pub mod state;

pub use config::{ConsistentConfig, ConsistentLevel, CyclicConfig, ReplicaConfig};
pub use error::{CdcError, Result};
pub use model::{
    AdminJobType, CaptureInfo, ChangeFeedInfo, ChangeFeedStatus, DdlEvent, DdlJob, DdlType,
    FeedState, OpType, PolymorphicEvent, RawKvEntry, RowChange, RowChangeType, RowChangedEvent,
    TableId, TableName, TableReplicaInfo, TaskPosition, TaskStatus, Ts,
};
pub use owner::{Changefeed, ChangefeedFactories, DdlSink, SyncPointStore};
pub use pipeline::{
    Mounter, RegionStream, TableActorConfig, TableActorSystem, TableFlowController, TablePipeline,
    TableStatus,
};
pub use scheduler::{Scheduler, CHECKPOINT_CANNOT_PROCEED};
pub use sink::{BlackHoleSink, Sink};
pub use state::ChangefeedState;
