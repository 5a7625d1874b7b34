//! Relay configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::gtid::Flavor;
use crate::reader::ReaderRetryConfig;

/// Upstream connection endpoint.
///
/// Debug redacts the password so configs can be logged safely.
#[derive(Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl UpstreamConfig {
    /// `host:port`, used in logs to name the master node.
    pub fn master_node(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Relay unit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub flavor: Flavor,
    /// Root of the relay on-disk layout.
    pub relay_dir: PathBuf,
    /// Starting binlog filename when resuming by position.
    pub binlog_name: String,
    /// Starting GTID set when `enable_gtid` is set.
    pub binlog_gtid: String,
    /// Explicit identity-dir suffix, used when (re)bound to a source;
    /// zero means allocate the next one.
    pub uuid_suffix: u32,
    /// Track position by GTID set instead of (filename, offset). Disabling
    /// it puts the reader in raw mode.
    pub enable_gtid: bool,
    pub charset: String,
    pub from: UpstreamConfig,
    pub reader_retry: ReaderRetryConfig,
    /// How many identity directories the hourly trim keeps.
    pub retain_uuid_dirs: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            flavor: Flavor::MySql,
            relay_dir: PathBuf::from("relay"),
            binlog_name: String::new(),
            binlog_gtid: String::new(),
            uuid_suffix: 0,
            enable_gtid: false,
            charset: "utf8mb4".to_string(),
            from: UpstreamConfig::default(),
            reader_retry: ReaderRetryConfig::default(),
            retain_uuid_dirs: 3,
        }
    }
}
