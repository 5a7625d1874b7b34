//! Upstream control-plane queries
//!
//! The relay needs a handful of SQL-level facts about the upstream server
//! (its UUID, master status, a free replica server id, the purged GTID
//! range). A concrete implementation wraps a SQL connection; everything
//! here goes through [`UpstreamConn`] with a per-query timeout.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::{RelayError, Result};
use crate::gtid::GtidSet;
use crate::position::BinlogPosition;

/// Default timeout for upstream control-plane queries.
pub const DEFAULT_DB_TIMEOUT: Duration = Duration::from_secs(30);

/// Server ids below this are left to operator-managed replicas.
const MIN_RANDOM_SERVER_ID: u32 = 1_000_000;

/// A candidate replica server id. Implementations of
/// [`UpstreamConn::random_server_id`] draw candidates from here and
/// re-draw on collision with a registered replica (`SHOW SLAVE HOSTS`).
pub fn random_server_id_candidate() -> u32 {
    rand::thread_rng().gen_range(MIN_RANDOM_SERVER_ID..u32::MAX)
}

/// SQL-level view of the upstream server.
#[async_trait]
pub trait UpstreamConn: Send + Sync {
    /// `SELECT @@server_uuid` (or the MariaDB equivalent).
    async fn server_uuid(&self) -> Result<String>;

    /// `SHOW MASTER STATUS`: the server's current write position and
    /// executed GTID set.
    async fn master_status(&self) -> Result<(BinlogPosition, Option<GtidSet>)>;

    /// A random replica server id not colliding with any registered one.
    async fn random_server_id(&self) -> Result<u32>;

    /// Augment `gset` with the upstream's purged GTID set, so resuming
    /// does not request transactions the server no longer has.
    async fn add_gset_with_purged(&self, gset: &GtidSet) -> Result<GtidSet>;
}

/// Run an upstream query under [`DEFAULT_DB_TIMEOUT`].
pub async fn with_db_timeout<T, F>(what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(DEFAULT_DB_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout(what.to_string())),
    }
}
