//! Relay metadata
//!
//! Tracks, per upstream identity, the latest safe `(filename, offset)` and
//! GTID set. Identities are directories named `<server-uuid>.NNNNNN`; the
//! suffix disambiguates upstream switches, and `server-uuid.index` lists
//! the directories oldest first. The metadata file is written atomically
//! (temp file, then rename) so a crash never leaves a torn meta.
//!
//! The engine only saves at transaction boundaries (XID / DDL query) or on
//! rotate, so a persisted `(pos, gtid)` always corresponds to a completed
//! transaction.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::gtid::{Flavor, GtidSet};
use crate::position::{BinlogPosition, MIN_BINLOG_POS};

/// Metadata filename inside each identity directory.
pub const META_FILENAME: &str = "relay.meta";
/// Index of identity directories, oldest first.
pub const INDEX_FILENAME: &str = "server-uuid.index";

/// On-disk shape of `relay.meta`. Stable explicit keys; round-trips.
#[derive(Debug, Serialize, Deserialize)]
struct MetaFile {
    #[serde(rename = "binlog-name")]
    binlog_name: String,
    #[serde(rename = "binlog-pos")]
    binlog_pos: u64,
    #[serde(rename = "binlog-gtid")]
    binlog_gtid: String,
}

#[derive(Debug)]
struct MetaInner {
    /// `uuid.NNNNNN` of the active identity, empty when fresh.
    uuid_with_suffix: String,
    pos: BinlogPosition,
    gset: GtidSet,
    dirty: bool,
    /// All known identity directories, oldest first.
    uuids: Vec<String>,
}

/// Relay metadata store rooted at the relay directory.
pub struct LocalMeta {
    flavor: Flavor,
    relay_dir: PathBuf,
    inner: RwLock<MetaInner>,
}

impl LocalMeta {
    pub fn new(flavor: Flavor, relay_dir: impl Into<PathBuf>) -> Self {
        Self {
            flavor,
            relay_dir: relay_dir.into(),
            inner: RwLock::new(MetaInner {
                uuid_with_suffix: String::new(),
                pos: BinlogPosition::min_position(),
                gset: GtidSet::empty(flavor),
                dirty: false,
                uuids: Vec::new(),
            }),
        }
    }

    /// Read state from disk. A missing index or meta file yields fresh
    /// state rather than an error.
    pub fn load(&self) -> Result<()> {
        let uuids = self.load_index()?;
        let mut inner = self.inner.write();
        inner.uuids = uuids;
        inner.uuid_with_suffix = inner.uuids.last().cloned().unwrap_or_default();
        inner.pos = BinlogPosition::min_position();
        inner.gset = GtidSet::empty(self.flavor);
        inner.dirty = false;

        if inner.uuid_with_suffix.is_empty() {
            return Ok(());
        }
        let meta_path = self
            .relay_dir
            .join(&inner.uuid_with_suffix)
            .join(META_FILENAME);
        match fs::read_to_string(&meta_path) {
            Ok(text) => {
                let parsed: MetaFile = serde_json::from_str(&text)?;
                inner.pos = BinlogPosition::new(parsed.binlog_name, parsed.binlog_pos);
                inner.gset = GtidSet::parse(self.flavor, &parsed.binlog_gtid)?;
                debug!(uuid = %inner.uuid_with_suffix, pos = %inner.pos, "loaded relay meta");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(uuid = %inner.uuid_with_suffix, "no relay meta on disk, fresh state");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Active identity directory name, empty when fresh.
    pub fn uuid(&self) -> String {
        self.inner.read().uuid_with_suffix.clone()
    }

    /// `(identity, position)`.
    pub fn pos(&self) -> (String, BinlogPosition) {
        let inner = self.inner.read();
        (inner.uuid_with_suffix.clone(), inner.pos.clone())
    }

    /// `(identity, GTID set)`.
    pub fn gtid(&self) -> (String, GtidSet) {
        let inner = self.inner.read();
        (inner.uuid_with_suffix.clone(), inner.gset.clone())
    }

    /// Absolute path of the active identity directory.
    pub fn dir(&self) -> PathBuf {
        self.relay_dir.join(self.inner.read().uuid_with_suffix.clone())
    }

    pub fn dirty(&self) -> bool {
        self.inner.read().dirty
    }

    /// All known identity directories, oldest first.
    pub fn uuids(&self) -> Vec<String> {
        self.inner.read().uuids.clone()
    }

    /// Update the in-memory position and GTID set; the change reaches disk
    /// on the next flush.
    pub fn save(&self, pos: BinlogPosition, gset: GtidSet) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.uuid_with_suffix.is_empty() {
            return Err(RelayError::InvalidMeta("save without an active UUID".into()));
        }
        inner.pos = pos;
        inner.gset = gset;
        inner.dirty = true;
        Ok(())
    }

    /// Atomically persist the current state and clear the dirty flag.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.uuid_with_suffix.is_empty() {
            return Err(RelayError::InvalidMeta("flush without an active UUID".into()));
        }
        let dir = self.relay_dir.join(&inner.uuid_with_suffix);
        fs::create_dir_all(&dir)?;
        let meta = MetaFile {
            binlog_name: inner.pos.name.clone(),
            binlog_pos: inner.pos.pos,
            binlog_gtid: inner.gset.to_string(),
        };
        let text = serde_json::to_string_pretty(&meta)?;
        let tmp = dir.join(format!("{META_FILENAME}.tmp"));
        fs::write(&tmp, text)?;
        fs::rename(&tmp, dir.join(META_FILENAME))?;
        inner.dirty = false;
        debug!(uuid = %inner.uuid_with_suffix, pos = %inner.pos, "flushed relay meta");
        Ok(())
    }

    /// Drop all in-memory state back to fresh. Disk contents are untouched;
    /// used after purging the relay directory.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.uuid_with_suffix.clear();
        inner.pos = BinlogPosition::min_position();
        inner.gset = GtidSet::empty(self.flavor);
        inner.dirty = false;
        inner.uuids.clear();
    }

    /// Allocate a new identity directory for `uuid`. With
    /// `explicit_suffix > 0` that suffix is used verbatim; otherwise the
    /// previous suffix plus one.
    pub fn add_dir(
        &self,
        uuid: &str,
        pos: Option<BinlogPosition>,
        gset: Option<GtidSet>,
        explicit_suffix: u32,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let suffix = if explicit_suffix > 0 {
            explicit_suffix
        } else {
            match inner.uuids.last() {
                Some(last) => parse_uuid_suffix(last)?.1 + 1,
                None => 1,
            }
        };
        let dirname = format!("{uuid}.{suffix:06}");
        fs::create_dir_all(self.relay_dir.join(&dirname))?;

        inner.uuids.push(dirname.clone());
        self.write_index(&inner.uuids)?;

        inner.uuid_with_suffix = dirname;
        inner.pos = pos.unwrap_or_else(BinlogPosition::min_position);
        inner.gset = gset.unwrap_or_else(|| GtidSet::empty(self.flavor));
        inner.dirty = true;
        info!(uuid = %inner.uuid_with_suffix, pos = %inner.pos, "added relay identity dir");
        Ok(())
    }

    /// Adopt a start position when none has been recorded yet: prefer the
    /// configured position/GTID, falling back to the upstream's latest.
    /// Returns whether anything was adjusted.
    pub fn adjust_with_start_pos(
        &self,
        config_binlog_name: &str,
        config_binlog_gtid: &str,
        enable_gtid: bool,
        latest_binlog_name: &str,
        latest_gtid: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.uuid_with_suffix.is_empty() {
            return Err(RelayError::InvalidMeta(
                "adjust start pos without an active UUID".into(),
            ));
        }
        // only a fresh meta may be adjusted
        if !inner.pos.is_unset() || !inner.gset.is_empty() {
            return Ok(false);
        }

        let mut binlog_name = config_binlog_name.to_string();
        let mut binlog_gtid = config_binlog_gtid.to_string();
        if enable_gtid {
            if binlog_gtid.is_empty() {
                binlog_gtid = latest_gtid.to_string();
                binlog_name = latest_binlog_name.to_string();
            }
        } else {
            binlog_gtid.clear();
            if binlog_name.is_empty() {
                binlog_name = latest_binlog_name.to_string();
            }
        }

        inner.pos = BinlogPosition::new(binlog_name, MIN_BINLOG_POS);
        inner.gset = GtidSet::parse(self.flavor, &binlog_gtid)?;
        inner.dirty = true;
        info!(pos = %inner.pos, gtid = %inner.gset, "adjusted relay meta with start pos");
        Ok(true)
    }

    /// Remove identity directories beyond the newest `retain` (the active
    /// one is always kept), returning the removed names.
    pub fn trim_uuids(&self, retain: usize) -> Result<Vec<String>> {
        let mut inner = self.inner.write();
        let retain = retain.max(1);
        if inner.uuids.len() <= retain {
            return Ok(Vec::new());
        }
        let cut = inner.uuids.len() - retain;
        let trimmed: Vec<String> = inner.uuids.drain(..cut).collect();
        self.write_index(&inner.uuids)?;
        for name in &trimmed {
            let dir = self.relay_dir.join(name);
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %e, "failed to remove trimmed identity dir");
            }
        }
        info!(count = trimmed.len(), "trimmed relay identity dirs");
        Ok(trimmed)
    }

    fn load_index(&self) -> Result<Vec<String>> {
        let path = self.relay_dir.join(INDEX_FILENAME);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_index(&self, uuids: &[String]) -> Result<()> {
        fs::create_dir_all(&self.relay_dir)?;
        let mut text = uuids.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        let tmp = self.relay_dir.join(format!("{INDEX_FILENAME}.tmp"));
        fs::write(&tmp, text)?;
        fs::rename(&tmp, self.relay_dir.join(INDEX_FILENAME))?;
        Ok(())
    }
}

/// Split `<uuid>.NNNNNN` into the bare UUID and its numeric suffix.
pub fn parse_uuid_suffix(dirname: &str) -> Result<(String, u32)> {
    let (uuid, suffix) = dirname
        .rsplit_once('.')
        .ok_or_else(|| RelayError::InvalidMeta(format!("bad identity dir name {dirname:?}")))?;
    let suffix: u32 = suffix
        .parse()
        .map_err(|_| RelayError::InvalidMeta(format!("bad identity dir suffix {dirname:?}")))?;
    Ok((uuid.to_string(), suffix))
}
