//! Relay engine
//!
//! Tails the upstream server as a replication client and appends every
//! event to the local relay log, preserving upstream bytes exactly.
//!
//! The engine owns one event loop plus one periodic-operations task
//! (metadata flush, master status poll, identity-dir trim). Metadata is
//! only saved at transaction boundaries, so a crash at any point recovers
//! by truncating the active file back to the last complete transaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::event::{BinlogEvent, EventData, EventType};
use crate::gtid::{Flavor, GtidSet};
use crate::meta::{parse_uuid_suffix, LocalMeta};
use crate::position::{compare_binlog_filenames, BinlogPosition};
use crate::reader::{
    BinlogReader, ReaderFactory, ReaderRetry, ReaderStart, DUMP_FLAG_SEND_ANNOTATE_ROWS_EVENT,
};
use crate::recover::recover_relay_file;
use crate::upstream::{with_db_timeout, UpstreamConn};
use crate::writer::FileWriter;

const FLUSH_META_INTERVAL: Duration = Duration::from_secs(30);
const MASTER_STATUS_INTERVAL: Duration = Duration::from_secs(30);
const TRIM_UUIDS_INTERVAL: Duration = Duration::from_secs(3600);

const IGNORE_REASON_HEARTBEAT: &str = "heartbeat event";
const IGNORE_REASON_ARTIFICIAL: &str = "artificial flag (0x0020) set";

/// Identity of the relay file currently being written, read by peers
/// tailing the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayLogInfo {
    pub uuid: String,
    pub uuid_suffix: u32,
    pub filename: String,
}

/// Gets called for every event the relay wrote successfully.
pub trait RelayListener: Send + Sync {
    fn on_event(&self, event: &BinlogEvent);
}

/// Point-in-time relay status report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RelayStatus {
    pub relay_sub_dir: String,
    pub relay_binlog: String,
    pub relay_binlog_gtid: String,
    pub master_binlog: Option<String>,
    pub master_binlog_gtid: Option<String>,
    pub relay_catch_up_master: bool,
}

#[derive(Debug, Default)]
struct PreprocessResult {
    ignore: bool,
    ignore_reason: &'static str,
    /// Event end position, or the next file's start position for rotates.
    log_pos: u64,
    /// Next binlog filename, only set for rotate events.
    next_log_name: Option<String>,
    /// GTID set snapshot from query/XID events.
    gtid_set: Option<GtidSet>,
    /// True for DDL queries, XID events and GTID bookkeeping events.
    can_save_gtid: bool,
}

/// The relay unit.
pub struct Relay {
    cfg: RwLock<RelayConfig>,
    upstream: Arc<dyn UpstreamConn>,
    reader_factory: Arc<dyn ReaderFactory>,
    meta: LocalMeta,
    writer: FileWriter,
    closed: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn RelayListener>>>,
    active_relay_log: RwLock<Option<RelayLogInfo>>,
    last_master_status: RwLock<Option<(BinlogPosition, Option<GtidSet>)>>,
}

impl Relay {
    pub fn new(
        cfg: RelayConfig,
        upstream: Arc<dyn UpstreamConn>,
        reader_factory: Arc<dyn ReaderFactory>,
    ) -> Self {
        let meta = LocalMeta::new(cfg.flavor, &cfg.relay_dir);
        let writer = FileWriter::new(&cfg.relay_dir);
        Self {
            cfg: RwLock::new(cfg),
            upstream,
            reader_factory,
            meta,
            writer,
            closed: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            active_relay_log: RwLock::new(None),
            last_master_status: RwLock::new(None),
        }
    }

    /// Run the relay until `shutdown` fires or a non-retryable error
    /// occurs. Resumable: a subsequent call picks up from the last saved
    /// transaction boundary.
    pub async fn process(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let cfg = self.cfg.read().clone();
        std::fs::create_dir_all(&cfg.relay_dir)?;
        self.meta.load()?;

        if self.is_new_server().await? {
            self.re_setup_meta().await?;
        } else {
            self.try_recover_latest_file().await?;
            self.handle_outdated_meta()?;
        }

        let (uuid, pos) = self.meta.pos();
        if !pos.name.is_empty() {
            self.writer.init(&uuid, &pos.name)?;
            info!(%uuid, filename = %pos.name, "started underlying writer");
        }

        let interval_task = tokio::spawn(self.clone().do_interval_ops(shutdown.clone()));

        let mut retry = ReaderRetry::new(cfg.reader_retry.clone());
        let mut reader = self.setup_reader().await?;
        let result = loop {
            match self.handle_events(reader.as_mut(), &mut shutdown).await {
                Ok(()) => break Ok(()),
                Err(err) => match retry.check(&err) {
                    Some(backoff) => {
                        warn!(error = %err, ?backoff, "retryable binlog reader error");
                        if let Err(e) = reader.close().await {
                            error!(error = %e, "fail to close binlog event reader");
                        }
                        tokio::time::sleep(backoff).await;
                        reader = self.setup_reader().await?;
                        info!("retrying to read binlog");
                    }
                    None => {
                        if let RelayError::BinlogPurged { last_pos, .. } = &err {
                            warn!(%last_pos, "requested binlog purged on the upstream server");
                            if let Ok((pos, gs)) =
                                with_db_timeout("master status", self.upstream.master_status())
                                    .await
                            {
                                info!(master_pos = %pos,
                                      master_gtid = gs.map(|g| g.to_string()).unwrap_or_default(),
                                      "current master status");
                            }
                        }
                        break Err(err);
                    }
                },
            }
        };

        if let Err(e) = reader.close().await {
            error!(error = %e, "fail to close binlog event reader");
        }
        interval_task.abort();
        result
    }

    /// Whether the upstream's reported server UUID differs from the
    /// identity the metadata currently tracks.
    async fn is_new_server(&self) -> Result<bool> {
        let uuid_with_suffix = self.meta.uuid();
        if uuid_with_suffix.is_empty() {
            return Ok(true);
        }
        let upstream_uuid =
            with_db_timeout("server uuid", self.upstream.server_uuid()).await?;
        let (current, _) = parse_uuid_suffix(&uuid_with_suffix)?;
        Ok(current != upstream_uuid)
    }

    /// Re-setup metadata when connecting to a new upstream master.
    async fn re_setup_meta(&self) -> Result<()> {
        let uuid = with_db_timeout("server uuid", self.upstream.server_uuid()).await?;

        let (explicit_suffix, binlog_name, binlog_gtid, enable_gtid, flavor) = {
            let mut cfg = self.cfg.write();
            let suffix = cfg.uuid_suffix;
            // an explicit suffix is consumed once
            cfg.uuid_suffix = 0;
            (
                suffix,
                cfg.binlog_name.clone(),
                cfg.binlog_gtid.clone(),
                cfg.enable_gtid,
                cfg.flavor,
            )
        };

        let mut new_pos = None;
        let mut new_gset = None;
        if explicit_suffix > 0 {
            // bound or rebound to a source: clear all relay log and meta
            self.purge_relay_dir()?;
            self.meta.reset();
            if !binlog_name.is_empty() {
                new_pos = Some(BinlogPosition::new(binlog_name.clone(), crate::position::MIN_BINLOG_POS));
            }
            if !binlog_gtid.is_empty() {
                new_gset = Some(GtidSet::parse(flavor, &binlog_gtid)?);
            }
        }
        self.meta.add_dir(&uuid, new_pos, new_gset, explicit_suffix)?;
        self.meta.flush()?;
        self.meta.load()?;

        let (mut latest_name, mut latest_gtid) = (String::new(), String::new());
        if (enable_gtid && binlog_gtid.is_empty()) || (!enable_gtid && binlog_name.is_empty()) {
            let (pos, gs) =
                with_db_timeout("master status", self.upstream.master_status()).await?;
            latest_name = pos.name;
            latest_gtid = gs.map(|g| g.to_string()).unwrap_or_default();
        }

        self.meta.adjust_with_start_pos(
            &binlog_name,
            &binlog_gtid,
            enable_gtid,
            &latest_name,
            &latest_gtid,
        )?;

        let (_, pos) = self.meta.pos();
        let (_, mut gs) = self.meta.gtid();
        if enable_gtid {
            // pulling from the beginning of a file needs the purged range
            // folded in, or the master rejects the requested set
            gs = with_db_timeout("purged gtid", self.upstream.add_gset_with_purged(&gs)).await?;
            self.meta.save(pos.clone(), gs.clone())?;
        }
        self.meta.flush()?;

        info!(start_pos = %pos, gtid = %gs, "adjusted meta to start pos");
        Ok(())
    }

    /// Recover the latest relay file to a transaction boundary after an
    /// unclean shutdown.
    async fn try_recover_latest_file(&self) -> Result<()> {
        let (_, latest_pos) = self.meta.pos();
        let (_, latest_gtid) = self.meta.gtid();
        if latest_pos.compare(&BinlogPosition::min_position()).is_le() {
            warn!(position = %latest_pos, "no relay log file need to recover");
            return Ok(());
        }

        let (flavor, enable_gtid) = {
            let cfg = self.cfg.read();
            (cfg.flavor, cfg.enable_gtid)
        };
        let dir = self.meta.dir();
        info!(binlog_dir = %dir.display(), filename = %latest_pos.name, "started recover");

        let Some(result) =
            recover_relay_file(&dir, &latest_pos.name, flavor, Some(latest_gtid.clone()))?
        else {
            return Ok(());
        };

        let relay_log_has_more = result.latest_pos.compare(&latest_pos).is_gt();
        if !result.truncated && !relay_log_has_more {
            return Ok(());
        }
        warn!(
            from = %latest_pos,
            to = %result.latest_pos,
            truncated = result.truncated,
            "relay log file recovered"
        );

        let mut gtids = result.latest_gtids.unwrap_or(latest_gtid);
        if enable_gtid {
            gtids =
                with_db_timeout("purged gtid", self.upstream.add_gset_with_purged(&gtids)).await?;
        }
        self.meta.save(result.latest_pos, gtids)?;
        self.meta.flush()?;
        Ok(())
    }

    /// When the position the task needs is newer than the saved metadata
    /// (the source was synced further elsewhere while this relay was
    /// down), the stale relay log is purged and the identity re-added with
    /// the same suffix.
    fn handle_outdated_meta(&self) -> Result<()> {
        let cfg = self.cfg.read().clone();
        let outdated = if cfg.enable_gtid {
            if cfg.binlog_gtid.is_empty() {
                false
            } else {
                let needed = GtidSet::parse(cfg.flavor, &cfg.binlog_gtid)?;
                let (_, meta_gset) = self.meta.gtid();
                needed.contain(&meta_gset) && needed != meta_gset
            }
        } else {
            compare_binlog_filenames(&cfg.binlog_name, &self.meta.pos().1.name).is_gt()
        };
        if !outdated {
            return Ok(());
        }

        // a reader tailing the purged directory would silently lose data
        if !self.listeners.lock().is_empty() {
            return Err(RelayError::InvalidMeta(
                "refusing to purge outdated relay dir while listeners are attached".into(),
            ));
        }

        let uuid_with_suffix = self.meta.uuid();
        let (uuid, suffix) = parse_uuid_suffix(&uuid_with_suffix)?;
        info!(%uuid_with_suffix, "relay meta is outdated, purging relay dir");
        self.purge_relay_dir()?;
        self.meta.reset();

        let pos = (!cfg.binlog_name.is_empty())
            .then(|| BinlogPosition::new(cfg.binlog_name.clone(), crate::position::MIN_BINLOG_POS));
        let gset = (!cfg.binlog_gtid.is_empty())
            .then(|| GtidSet::parse(cfg.flavor, &cfg.binlog_gtid))
            .transpose()?;
        self.meta.add_dir(&uuid, pos, gset, suffix)?;
        self.meta.flush()?;
        self.meta.load()?;
        Ok(())
    }

    /// Allocate a fresh random server id and open a reader at the last
    /// saved position.
    async fn setup_reader(&self) -> Result<Box<dyn BinlogReader>> {
        let server_id =
            with_db_timeout("random server id", self.upstream.random_server_id()).await?;
        let (uuid, pos) = self.meta.pos();
        let (_, gs) = self.meta.gtid();
        let start = {
            let cfg = self.cfg.read();
            let mut dump_flags = 0;
            if cfg.flavor == Flavor::MariaDb {
                dump_flags |= DUMP_FLAG_SEND_ANNOTATE_ROWS_EVENT;
            }
            ReaderStart {
                server_id,
                pos,
                gtid_set: cfg.enable_gtid.then_some(gs),
                raw_mode: !cfg.enable_gtid,
                dump_flags,
            }
        };
        let reader = self.reader_factory.connect(start).await?;
        info!(%uuid, server_id, "started underlying reader");
        Ok(reader)
    }

    /// The event loop: read, preprocess, write, save metadata.
    async fn handle_events(
        &self,
        reader: &mut dyn BinlogReader,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (_, mut last_pos) = self.meta.pos();
        let (_, mut last_gtid) = self.meta.gtid();
        let enable_gtid = self.cfg.read().enable_gtid;
        let mut first_event = true;

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                event = reader.get_event() => event?,
            };
            debug!(header = ?event.header, "receive binlog event");

            let result = self.preprocess_event(&event);
            if let Some(next) = &result.next_log_name {
                if compare_binlog_filenames(next, &last_pos.name).is_gt() {
                    last_pos = BinlogPosition::new(next.clone(), result.log_pos);
                    info!(position = %last_pos, "rotate event");
                }
            }
            if result.ignore {
                info!(
                    header = ?event.header,
                    reason = result.ignore_reason,
                    "ignore event by transformer"
                );
                continue;
            }

            if event.is_fake_rotate() && self.is_new_server().await? {
                // upstream database switched; report and let the outer
                // logic re-initialize from a transaction boundary
                return Err(RelayError::RotateWithDifferentServerId);
            }

            if first_event {
                // the first event must be a fake rotate; persist meta now
                // so the meta file exists before any binlog file does
                first_event = false;
                self.save_and_flush_meta(&last_pos, &last_gtid)?;
            }

            if !self.writer_initialized() && !last_pos.name.is_empty() {
                self.writer.init(&self.meta.uuid(), &last_pos.name)?;
            }

            let write_result = self.writer.write_event(&event)?;
            if write_result.ignore {
                info!(
                    header = ?event.header,
                    reason = write_result.ignore_reason,
                    "ignore event by writer"
                );
                self.try_update_active_relay_log(&event, &last_pos.name);
                continue;
            }

            self.notify(&event);
            self.try_update_active_relay_log(&event, &last_pos.name);

            let mut need_save = result.can_save_gtid;
            last_pos.pos = result.log_pos;
            if let Some(gs) = &result.gtid_set {
                last_gtid.set(gs)?;
            }
            if !enable_gtid {
                // raw mode leaves query/XID bodies unparsed, so position is
                // advanced and saved for every event
                if event.header.event_type != EventType::RotateEvent {
                    last_pos.pos = u64::from(event.header.log_pos);
                }
                need_save = true;
            }

            if need_save {
                self.meta.save(last_pos.clone(), last_gtid.clone())?;
            }
            if let Some(next) = &result.next_log_name {
                // a real rotate: flush so the next filename is durable
                last_pos.name = next.clone();
                self.save_and_flush_meta(&last_pos, &last_gtid)?;
            }
        }
    }

    fn preprocess_event(&self, event: &BinlogEvent) -> PreprocessResult {
        let mut result = PreprocessResult {
            log_pos: u64::from(event.header.log_pos),
            ..Default::default()
        };
        match &event.data {
            EventData::PreviousGtids | EventData::MariadbGtidList => {
                result.can_save_gtid = true;
            }
            EventData::Rotate {
                position,
                next_log_name,
            } => {
                // the rotate carries the next event's position, and for a
                // fake rotate the first filename of the stream
                result.log_pos = *position;
                result.next_log_name = Some(next_log_name.clone());
            }
            EventData::Query { query, .. } => {
                if crate::event::is_ddl_query(query) {
                    // only DDL updates the saved GTID; BEGIN and friends
                    // do not mark a transaction boundary
                    result.gtid_set = event.gtid_set.clone();
                    result.can_save_gtid = true;
                }
            }
            EventData::Xid { .. } => {
                result.gtid_set = event.gtid_set.clone();
                result.can_save_gtid = true;
            }
            EventData::Heartbeat => {
                result.ignore = true;
                result.ignore_reason = IGNORE_REASON_HEARTBEAT;
            }
            _ => {
                if event.header.is_artificial()
                    && event.header.event_type != EventType::RotateEvent
                {
                    result.ignore = true;
                    result.ignore_reason = IGNORE_REASON_ARTIFICIAL;
                }
            }
        }
        result
    }

    fn save_and_flush_meta(&self, pos: &BinlogPosition, gset: &GtidSet) -> Result<()> {
        self.meta.save(pos.clone(), gset.clone())?;
        self.meta.flush()
    }

    fn writer_initialized(&self) -> bool {
        self.writer.active_position().is_some()
    }

    /// The format description event marks the switch to a new relay file.
    fn try_update_active_relay_log(&self, event: &BinlogEvent, filename: &str) {
        if event.header.event_type != EventType::FormatDescriptionEvent {
            return;
        }
        let uuid_with_suffix = self.meta.uuid();
        let Ok((uuid, suffix)) = parse_uuid_suffix(&uuid_with_suffix) else {
            return;
        };
        let info = RelayLogInfo {
            uuid,
            uuid_suffix: suffix,
            filename: filename.to_string(),
        };
        *self.active_relay_log.write() = Some(info);
        info!(filename, "change the active relay log file");
    }

    /// Periodic background work: meta flush, master status poll, identity
    /// dir trim.
    async fn do_interval_ops(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let start = tokio::time::Instant::now();
        let mut flush_ticker =
            tokio::time::interval_at(start + FLUSH_META_INTERVAL, FLUSH_META_INTERVAL);
        let mut master_ticker =
            tokio::time::interval_at(start + MASTER_STATUS_INTERVAL, MASTER_STATUS_INTERVAL);
        let mut trim_ticker =
            tokio::time::interval_at(start + TRIM_UUIDS_INTERVAL, TRIM_UUIDS_INTERVAL);

        loop {
            if self.is_closed() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = flush_ticker.tick() => {
                    if self.meta.dirty() {
                        match self.meta.flush() {
                            Ok(()) => debug!("flush meta finished"),
                            Err(e) => error!(error = %e, "flush meta"),
                        }
                    }
                }
                _ = master_ticker.tick() => {
                    match with_db_timeout("master status", self.upstream.master_status()).await {
                        Ok((pos, gs)) => {
                            debug!(master_pos = %pos, "polled master status");
                            *self.last_master_status.write() = Some((pos, gs));
                        }
                        Err(e) => warn!(error = %e, "get master status"),
                    }
                }
                _ = trim_ticker.tick() => {
                    let retain = self.cfg.read().retain_uuid_dirs;
                    match self.meta.trim_uuids(retain) {
                        Ok(trimmed) if !trimmed.is_empty() => {
                            info!(uuids = trimmed.join(";"), "trim UUIDs");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "trim UUIDs"),
                    }
                }
            }
        }
    }

    fn notify(&self, event: &BinlogEvent) {
        for listener in self.listeners.lock().iter() {
            listener.on_event(event);
        }
    }

    /// Remove everything under the relay directory.
    pub fn purge_relay_dir(&self) -> Result<()> {
        let dir = self.cfg.read().relay_dir.clone();
        info!(relay_dir = %dir.display(), "purging relay dir for new relay log");
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        info!(relay_dir = %dir.display(), "relay dir purged");
        Ok(())
    }

    /// Save metadata (in memory; flushed periodically or at boundaries).
    pub fn save_meta(&self, pos: BinlogPosition, gset: GtidSet) -> Result<()> {
        self.meta.save(pos, gset)
    }

    /// Flush metadata to disk now.
    pub fn flush_meta(&self) -> Result<()> {
        self.meta.flush()
    }

    /// Reset in-memory metadata to fresh state.
    pub fn reset_meta(&self) {
        self.meta.reset();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flush metadata and stop; idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("relay unit is closing");
        if let Err(e) = self.meta.flush() {
            warn!(error = %e, "flush meta on close");
        }
        if let Err(e) = self.writer.close() {
            warn!(error = %e, "close relay writer");
        }
        info!("relay unit closed");
    }

    /// Flush metadata so a paused relay can resume from a clean point.
    pub fn pause(&self) {
        if self.is_closed() {
            warn!("try to pause, but already closed");
            return;
        }
        if let Err(e) = self.meta.flush() {
            error!(error = %e, "flush checkpoint on pause");
        }
    }

    /// Update the upstream connection config; only `from` and `charset`
    /// are reconfigurable at runtime.
    pub fn reload(&self, new_cfg: &RelayConfig) {
        let mut cfg = self.cfg.write();
        cfg.from = new_cfg.from.clone();
        cfg.charset = new_cfg.charset.clone();
        info!("relay unit is updated");
    }

    pub fn register_listener(&self, listener: Arc<dyn RelayListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn unregister_listener(&self, listener: &Arc<dyn RelayListener>) {
        self.listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Whether `uuid/filename` is the file being written, and the current
    /// end offset if so.
    pub fn is_active(&self, uuid: &str, filename: &str) -> (bool, u64) {
        self.writer.is_active(uuid, filename)
    }

    pub fn active_relay_log(&self) -> Option<RelayLogInfo> {
        self.active_relay_log.read().clone()
    }

    /// Status report comparing the relay position against the last polled
    /// master status.
    pub fn status(&self) -> RelayStatus {
        let (uuid, pos) = self.meta.pos();
        let (_, gs) = self.meta.gtid();
        let enable_gtid = self.cfg.read().enable_gtid;
        let master = self.last_master_status.read().clone();

        let (master_binlog, master_binlog_gtid) = match &master {
            Some((mpos, mgs)) => (
                Some(mpos.to_string()),
                mgs.as_ref().map(|g| g.to_string()),
            ),
            None => (None, None),
        };
        let relay_catch_up_master = match &master {
            Some((mpos, mgs)) => {
                if enable_gtid {
                    mgs.as_ref().map(|g| g.to_string()) == Some(gs.to_string())
                } else {
                    mpos.compare(&pos).is_eq()
                }
            }
            None => false,
        };
        RelayStatus {
            relay_sub_dir: uuid,
            relay_binlog: pos.to_string(),
            relay_binlog_gtid: gs.to_string(),
            master_binlog,
            master_binlog_gtid,
            relay_catch_up_master,
        }
    }

    #[cfg(test)]
    pub(crate) fn meta(&self) -> &LocalMeta {
        &self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use crate::testutil::{with_gtid_set, EventBuilder};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    const UUID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const NEW_UUID: &str = "7acd1d35-9b21-4f6c-a6ce-d3458b8552ae";

    struct MockUpstream {
        uuids: Mutex<VecDeque<String>>,
        master_pos: BinlogPosition,
        master_gtid: Option<GtidSet>,
    }

    impl MockUpstream {
        fn new(uuid: &str) -> Self {
            Self {
                uuids: Mutex::new(VecDeque::from([uuid.to_string()])),
                master_pos: BinlogPosition::new("mysql-bin.000001", 4),
                master_gtid: Some(
                    GtidSet::parse(Flavor::MySql, &format!("{UUID}:1-100")).unwrap(),
                ),
            }
        }

        /// Subsequent `server_uuid` calls return `uuid`.
        fn switch_to(self, uuid: &str) -> Self {
            self.uuids.lock().push_back(uuid.to_string());
            self
        }
    }

    #[async_trait]
    impl UpstreamConn for MockUpstream {
        async fn server_uuid(&self) -> Result<String> {
            let mut uuids = self.uuids.lock();
            if uuids.len() > 1 {
                Ok(uuids.pop_front().unwrap())
            } else {
                Ok(uuids.front().cloned().unwrap())
            }
        }

        async fn master_status(&self) -> Result<(BinlogPosition, Option<GtidSet>)> {
            Ok((self.master_pos.clone(), self.master_gtid.clone()))
        }

        async fn random_server_id(&self) -> Result<u32> {
            Ok(429496)
        }

        async fn add_gset_with_purged(&self, gset: &GtidSet) -> Result<GtidSet> {
            Ok(gset.clone())
        }
    }

    struct ScriptedReader {
        events: VecDeque<BinlogEvent>,
    }

    #[async_trait]
    impl BinlogReader for ScriptedReader {
        async fn get_event(&mut self) -> Result<BinlogEvent> {
            match self.events.pop_front() {
                Some(ev) => Ok(ev),
                // park forever; the test ends the loop through shutdown
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct ScriptedFactory {
        scripts: Mutex<VecDeque<Vec<BinlogEvent>>>,
    }

    #[async_trait]
    impl ReaderFactory for ScriptedFactory {
        async fn connect(&self, _start: ReaderStart) -> Result<Box<dyn BinlogReader>> {
            let events = self.scripts.lock().pop_front().unwrap_or_default();
            Ok(Box::new(ScriptedReader {
                events: events.into(),
            }))
        }
    }

    fn relay_with_script(
        cfg: RelayConfig,
        upstream: MockUpstream,
        script: Vec<BinlogEvent>,
    ) -> Arc<Relay> {
        let factory = ScriptedFactory {
            scripts: Mutex::new(VecDeque::from([script])),
        };
        Arc::new(Relay::new(cfg, Arc::new(upstream), Arc::new(factory)))
    }

    fn gtid_cfg(dir: &TempDir) -> RelayConfig {
        RelayConfig {
            relay_dir: dir.path().to_path_buf(),
            enable_gtid: true,
            from: UpstreamConfig {
                host: "db1".into(),
                port: 3306,
                user: "repl".into(),
                password: None,
            },
            ..Default::default()
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    /// Fresh start, MySQL flavor, GTID enabled, empty start GTID: the
    /// relay adopts the upstream's current GTID set, creates the first
    /// identity dir, and ends up with meta exactly at the XID boundary.
    #[tokio::test]
    async fn test_fresh_start_gtid_stream() {
        let tmp = TempDir::new().unwrap();
        let b = EventBuilder::new(1);

        let gset_through =
            |n: u64| GtidSet::parse(Flavor::MySql, &format!("{UUID}:1-{n}")).unwrap();

        let mut pos = 4u64;
        let fmt = b.format_description(pos);
        pos += fmt.raw.len() as u64;
        let gtid = b.gtid(pos, UUID, 101);
        pos += gtid.raw.len() as u64;
        let begin = b.begin(pos);
        pos += begin.raw.len() as u64;
        // pad the row so the XID ends exactly at offset 512
        let row = b.row(pos, (512 - 27 - pos as usize) - 19);
        pos += row.raw.len() as u64;
        let xid = with_gtid_set(b.xid(pos, 1), gset_through(101));
        pos += xid.raw.len() as u64;
        assert_eq!(pos, 512);

        let script = vec![
            b.fake_rotate("mysql-bin.000001", 4),
            fmt,
            gtid,
            begin,
            row,
            xid,
        ];
        let relay = relay_with_script(gtid_cfg(&tmp), MockUpstream::new(UUID), script);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.process(shutdown_rx).await })
        };

        wait_until(|| relay.meta().pos().1.pos == 512).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        let dirname = format!("{UUID}.000001");
        assert_eq!(relay.meta().uuid(), dirname);
        assert_eq!(
            relay.meta().pos().1,
            BinlogPosition::new("mysql-bin.000001", 512)
        );
        assert_eq!(relay.meta().gtid().1, gset_through(101));

        let file = tmp.path().join(&dirname).join("mysql-bin.000001");
        assert_eq!(std::fs::metadata(&file).unwrap().len(), 512);
        // the meta file was flushed before any event bytes were written
        assert!(tmp.path().join(&dirname).join("relay.meta").exists());
    }

    /// Crash between write and save: the file holds a torn transaction
    /// past the last saved boundary; recovery truncates back to it.
    #[tokio::test]
    async fn test_crash_recovery_truncates_to_boundary() {
        let tmp = TempDir::new().unwrap();
        let b = EventBuilder::new(1);
        let dirname = format!("{UUID}.000001");

        // lay out a relay dir as a crashed relay would have left it
        let meta = LocalMeta::new(Flavor::MySql, tmp.path());
        meta.add_dir(UUID, None, None, 0).unwrap();

        let mut pos = 4u64;
        let mut file_bytes = Vec::from(crate::event::BINLOG_MAGIC);
        let g1 = b.gtid(pos, UUID, 101);
        pos += g1.raw.len() as u64;
        let x1 = b.xid(pos, 1);
        pos += x1.raw.len() as u64;
        let boundary = pos;
        let g2 = b.gtid(pos, UUID, 102);
        pos += g2.raw.len() as u64;
        let r2 = b.row(pos, 64);
        for ev in [&g1, &x1, &g2, &r2] {
            file_bytes.extend_from_slice(&ev.raw);
        }
        let dir = tmp.path().join(&dirname);
        std::fs::write(dir.join("mysql-bin.000001"), &file_bytes).unwrap();

        meta.save(
            BinlogPosition::new("mysql-bin.000001", boundary),
            GtidSet::parse(Flavor::MySql, &format!("{UUID}:1-101")).unwrap(),
        )
        .unwrap();
        meta.flush().unwrap();
        drop(meta);

        let relay = relay_with_script(gtid_cfg(&tmp), MockUpstream::new(UUID), Vec::new());
        relay.meta().load().unwrap();
        relay.try_recover_latest_file().await.unwrap();

        assert_eq!(
            std::fs::metadata(dir.join("mysql-bin.000001")).unwrap().len(),
            boundary
        );
        assert_eq!(relay.meta().pos().1.pos, boundary);
    }

    /// Upstream failover: a fake rotate arrives while the server reports a
    /// new UUID; the engine surfaces the dedicated error so the outer
    /// logic can allocate a new identity dir.
    #[tokio::test]
    async fn test_fake_rotate_from_new_server() {
        let tmp = TempDir::new().unwrap();
        let b = EventBuilder::new(1);

        let script = vec![b.fake_rotate("mysql-bin.000001", 4)];
        let upstream = MockUpstream::new(UUID).switch_to(NEW_UUID);
        let relay = relay_with_script(gtid_cfg(&tmp), upstream, script);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let err = relay.process(shutdown_rx).await.unwrap_err();
        assert!(matches!(err, RelayError::RotateWithDifferentServerId));
    }

    #[tokio::test]
    async fn test_heartbeat_and_artificial_events_ignored() {
        let tmp = TempDir::new().unwrap();
        let cfg = gtid_cfg(&tmp);
        let relay = relay_with_script(cfg, MockUpstream::new(UUID), Vec::new());
        let b = EventBuilder::new(1);

        let hb = relay.preprocess_event(&b.heartbeat());
        assert!(hb.ignore);
        assert_eq!(hb.ignore_reason, IGNORE_REASON_HEARTBEAT);

        let fake = relay.preprocess_event(&b.fake_rotate("mysql-bin.000002", 4));
        assert!(!fake.ignore);
        assert_eq!(fake.next_log_name.as_deref(), Some("mysql-bin.000002"));
        assert_eq!(fake.log_pos, 4);
    }

    #[tokio::test]
    async fn test_preprocess_ddl_and_xid_save_gtid() {
        let tmp = TempDir::new().unwrap();
        let relay = relay_with_script(gtid_cfg(&tmp), MockUpstream::new(UUID), Vec::new());
        let b = EventBuilder::new(1);
        let gs = GtidSet::parse(Flavor::MySql, &format!("{UUID}:1-5")).unwrap();

        let ddl = with_gtid_set(b.query(4, "shop", "ALTER TABLE t ADD v INT"), gs.clone());
        let result = relay.preprocess_event(&ddl);
        assert!(result.can_save_gtid);
        assert_eq!(result.gtid_set.as_ref(), Some(&gs));

        let begin = relay.preprocess_event(&b.begin(4));
        assert!(!begin.can_save_gtid);

        let xid = with_gtid_set(b.xid(4, 9), gs.clone());
        let result = relay.preprocess_event(&xid);
        assert!(result.can_save_gtid);
        assert_eq!(result.gtid_set.as_ref(), Some(&gs));
    }

    #[tokio::test]
    async fn test_outdated_meta_purge_refused_with_listeners() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = gtid_cfg(&tmp);
        cfg.enable_gtid = false;
        cfg.binlog_name = "mysql-bin.000009".to_string();
        let relay = relay_with_script(cfg, MockUpstream::new(UUID), Vec::new());

        relay.meta().add_dir(UUID, None, None, 0).unwrap();
        relay
            .meta()
            .save(
                BinlogPosition::new("mysql-bin.000002", 4),
                GtidSet::empty(Flavor::MySql),
            )
            .unwrap();

        struct Noop;
        impl RelayListener for Noop {
            fn on_event(&self, _event: &BinlogEvent) {}
        }
        let listener: Arc<dyn RelayListener> = Arc::new(Noop);
        relay.register_listener(listener.clone());
        assert!(relay.handle_outdated_meta().is_err());

        relay.unregister_listener(&listener);
        relay.handle_outdated_meta().unwrap();
        // purged and re-added under the same identity
        assert_eq!(relay.meta().uuid(), format!("{UUID}.000001"));
        assert_eq!(relay.meta().pos().1.name, "mysql-bin.000009");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let relay = relay_with_script(gtid_cfg(&tmp), MockUpstream::new(UUID), Vec::new());
        relay.meta().add_dir(UUID, None, None, 0).unwrap();

        assert!(!relay.is_closed());
        relay.close();
        assert!(relay.is_closed());
        relay.close();
        assert!(relay.is_closed());
    }
}
