//! # binstream-relay - durable binlog relay
//!
//! Tails a MySQL/MariaDB upstream as a replication client and persists its
//! binlog byte stream into local append-only relay files, organized by
//! upstream identity.
//!
//! ## Features
//!
//! - **Byte-exact relay files**: non-ignored events are written exactly as
//!   received, magic header included
//! - **Transaction-boundary metadata**: `(filename, offset)` and GTID set
//!   are saved only at XID / DDL boundaries and persisted atomically
//! - **Crash recovery**: on restart the active file is truncated back to
//!   the last complete transaction
//! - **Upstream switch handling**: a new server UUID allocates a fresh
//!   identity directory; old directories are retained until trimmed
//! - **Retry**: transient reader errors reconnect with exponential backoff
//!   from the last saved position
//!
//! ## On-disk layout
//!
//! ```text
//! <relay-dir>/
//!   server-uuid.index            identity dirs, oldest first
//!   <uuid>.000001/
//!     relay.meta                 atomic (temp + rename) metadata
//!     mysql-bin.000001           raw upstream event bytes
//!     mysql-bin.000002
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod gtid;
pub mod meta;
pub mod position;
pub mod reader;
pub mod recover;
pub mod relay;
pub mod upstream;
pub mod writer;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{RelayConfig, UpstreamConfig};
pub use error::{RelayError, Result};
pub use event::{BinlogEvent, EventData, EventHeader, EventType};
pub use gtid::{Flavor, GtidSet};
pub use meta::LocalMeta;
pub use position::BinlogPosition;
pub use reader::{BinlogReader, ReaderFactory, ReaderRetry, ReaderRetryConfig, ReaderStart};
pub use recover::{recover_relay_file, RecoverResult};
pub use relay::{Relay, RelayListener, RelayLogInfo, RelayStatus};
pub use upstream::UpstreamConn;
pub use writer::{FileWriter, WriteResult};
