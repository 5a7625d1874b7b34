//! Changefeed owner
//!
//! The owner runs on exactly one capture and drives every changefeed's
//! state machine: initialization, DDL application through the serialized
//! DDL sink, barrier-gated watermark advancement, and teardown. Workers
//! (table pipelines) report progress through the metadata store; the
//! owner folds it back into global checkpoint / resolved watermarks.

pub mod barriers;
pub mod changefeed;
pub mod ddl_puller;
pub mod ddl_sink;
pub mod feed_state;
pub mod schema;

pub use barriers::{BarrierType, Barriers};
pub use changefeed::{Changefeed, ChangefeedFactories};
pub use ddl_puller::{ChannelDdlPuller, DdlEntry, DdlPuller, DdlStream};
pub use ddl_sink::{DdlSink, SyncPointStore, DEFAULT_ERR_CH_SIZE};
pub use feed_state::FeedStateManager;
pub use schema::{SchemaSnapshot, SchemaTable};
