//! GTID sets
//!
//! Flavor-dispatched GTID set value type:
//!
//! - **MySQL**: `uuid:1-100[,uuid:...]` interval sets per source UUID
//! - **MariaDB**: `domain-server-seq` triplets keyed by replication domain
//!
//! The type supports the operations the relay needs for position
//! tracking: containment, equality, truncation to a subset, merging in
//! newly observed transaction ids, and canonical rendering (sorted, so
//! two equal sets always render identically).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Upstream server flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    #[default]
    MySql,
    MariaDb,
}

impl Flavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::MySql => "mysql",
            Flavor::MariaDb => "mariadb",
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inclusive interval of transaction sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Interval {
    start: u64,
    end: u64,
}

/// A MySQL GTID set: per-source-UUID lists of disjoint, sorted intervals.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MySqlGtidSet {
    sets: BTreeMap<String, Vec<Interval>>,
}

impl MySqlGtidSet {
    /// Parse from the canonical `uuid:1-5:7,uuid2:1` form. An empty string
    /// yields the empty set.
    pub fn parse(text: &str) -> Result<Self> {
        let mut out = Self::default();
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut pieces = part.split(':');
            let uuid = pieces.next().unwrap_or_default().to_ascii_lowercase();
            if uuid::Uuid::parse_str(&uuid).is_err() || uuid.len() != 36 {
                return Err(gtid_parse_err(Flavor::MySql, text, "bad source UUID"));
            }
            let mut saw_interval = false;
            for piece in pieces {
                saw_interval = true;
                let (start, end) = match piece.split_once('-') {
                    Some((s, e)) => (parse_seq(s), parse_seq(e)),
                    None => {
                        let n = parse_seq(piece);
                        (n, n)
                    }
                };
                let (start, end) = match (start, end) {
                    (Some(s), Some(e)) if s > 0 && s <= e => (s, e),
                    _ => return Err(gtid_parse_err(Flavor::MySql, text, "bad interval")),
                };
                out.add_interval(&uuid, start, end);
            }
            if !saw_interval {
                return Err(gtid_parse_err(Flavor::MySql, text, "missing interval"));
            }
        }
        Ok(out)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Merge a single transaction id into the set.
    pub fn add_gtid(&mut self, uuid: &str, gno: u64) {
        self.add_interval(&uuid.to_ascii_lowercase(), gno, gno);
    }

    /// Union with another set.
    pub fn merge(&mut self, other: &MySqlGtidSet) {
        for (uuid, intervals) in &other.sets {
            for iv in intervals {
                self.add_interval(uuid, iv.start, iv.end);
            }
        }
    }

    /// True when every transaction id in `other` is also in `self`.
    pub fn contain(&self, other: &MySqlGtidSet) -> bool {
        other.sets.iter().all(|(uuid, intervals)| {
            let Some(ours) = self.sets.get(uuid) else {
                return intervals.is_empty();
            };
            intervals
                .iter()
                .all(|iv| ours.iter().any(|o| o.start <= iv.start && iv.end <= o.end))
        })
    }

    /// Intersect with `sub`, dropping everything outside it.
    pub fn truncate(&mut self, sub: &MySqlGtidSet) {
        let mut result: BTreeMap<String, Vec<Interval>> = BTreeMap::new();
        for (uuid, ours) in &self.sets {
            let Some(theirs) = sub.sets.get(uuid) else {
                continue;
            };
            let mut kept = Vec::new();
            for a in ours {
                for b in theirs {
                    let start = a.start.max(b.start);
                    let end = a.end.min(b.end);
                    if start <= end {
                        kept.push(Interval { start, end });
                    }
                }
            }
            if !kept.is_empty() {
                result.insert(uuid.clone(), kept);
            }
        }
        self.sets = result;
    }

    fn add_interval(&mut self, uuid: &str, start: u64, end: u64) {
        let intervals = self.sets.entry(uuid.to_string()).or_default();
        intervals.push(Interval { start, end });
        intervals.sort_by_key(|iv| iv.start);
        // coalesce adjacent and overlapping intervals
        let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
        for iv in intervals.drain(..) {
            match merged.last_mut() {
                Some(last) if iv.start <= last.end.saturating_add(1) => {
                    last.end = last.end.max(iv.end);
                }
                _ => merged.push(iv),
            }
        }
        *intervals = merged;
    }
}

impl fmt::Display for MySqlGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, intervals) in &self.sets {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            f.write_str(uuid)?;
            for iv in intervals {
                if iv.start == iv.end {
                    write!(f, ":{}", iv.start)?;
                } else {
                    write!(f, ":{}-{}", iv.start, iv.end)?;
                }
            }
        }
        Ok(())
    }
}

/// A single MariaDB GTID, `domain-server-seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MariaDbGtid {
    pub domain: u32,
    pub server_id: u32,
    pub seq: u64,
}

impl fmt::Display for MariaDbGtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain, self.server_id, self.seq)
    }
}

/// A MariaDB GTID set: the latest GTID per replication domain.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MariaDbGtidSet {
    domains: BTreeMap<u32, MariaDbGtid>,
}

impl MariaDbGtidSet {
    pub fn parse(text: &str) -> Result<Self> {
        let mut out = Self::default();
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let fields: Vec<&str> = part.split('-').collect();
            if fields.len() != 3 {
                return Err(gtid_parse_err(Flavor::MariaDb, text, "expect domain-server-seq"));
            }
            let gtid = MariaDbGtid {
                domain: fields[0]
                    .parse()
                    .map_err(|_| gtid_parse_err(Flavor::MariaDb, text, "bad domain"))?,
                server_id: fields[1]
                    .parse()
                    .map_err(|_| gtid_parse_err(Flavor::MariaDb, text, "bad server id"))?,
                seq: fields[2]
                    .parse()
                    .map_err(|_| gtid_parse_err(Flavor::MariaDb, text, "bad sequence"))?,
            };
            out.add_gtid(gtid);
        }
        Ok(out)
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Record a GTID, keeping the highest sequence per domain.
    pub fn add_gtid(&mut self, gtid: MariaDbGtid) {
        match self.domains.get_mut(&gtid.domain) {
            Some(existing) if existing.seq >= gtid.seq => {}
            Some(existing) => *existing = gtid,
            None => {
                self.domains.insert(gtid.domain, gtid);
            }
        }
    }

    pub fn merge(&mut self, other: &MariaDbGtidSet) {
        for gtid in other.domains.values() {
            self.add_gtid(*gtid);
        }
    }

    pub fn contain(&self, other: &MariaDbGtidSet) -> bool {
        other.domains.iter().all(|(domain, theirs)| {
            self.domains
                .get(domain)
                .is_some_and(|ours| ours.seq >= theirs.seq)
        })
    }

    pub fn truncate(&mut self, sub: &MariaDbGtidSet) {
        let mut result = BTreeMap::new();
        for (domain, theirs) in &sub.domains {
            if let Some(ours) = self.domains.get(domain) {
                let mut kept = *ours;
                if kept.seq > theirs.seq {
                    kept = *theirs;
                }
                result.insert(*domain, kept);
            }
        }
        self.domains = result;
    }
}

impl fmt::Display for MariaDbGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for gtid in self.domains.values() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            gtid.fmt(f)?;
        }
        Ok(())
    }
}

/// A flavor-dispatched GTID set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GtidSet {
    MySql(MySqlGtidSet),
    MariaDb(MariaDbGtidSet),
}

impl GtidSet {
    /// The empty set of the given flavor.
    pub fn empty(flavor: Flavor) -> Self {
        match flavor {
            Flavor::MySql => GtidSet::MySql(MySqlGtidSet::default()),
            Flavor::MariaDb => GtidSet::MariaDb(MariaDbGtidSet::default()),
        }
    }

    /// Parse a set in the given flavor's canonical text form.
    pub fn parse(flavor: Flavor, text: &str) -> Result<Self> {
        match flavor {
            Flavor::MySql => MySqlGtidSet::parse(text).map(GtidSet::MySql),
            Flavor::MariaDb => MariaDbGtidSet::parse(text).map(GtidSet::MariaDb),
        }
    }

    pub fn flavor(&self) -> Flavor {
        match self {
            GtidSet::MySql(_) => Flavor::MySql,
            GtidSet::MariaDb(_) => Flavor::MariaDb,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            GtidSet::MySql(s) => s.is_empty(),
            GtidSet::MariaDb(s) => s.is_empty(),
        }
    }

    /// True when every transaction id in `other` is also in `self`.
    pub fn contain(&self, other: &GtidSet) -> bool {
        match (self, other) {
            (GtidSet::MySql(a), GtidSet::MySql(b)) => a.contain(b),
            (GtidSet::MariaDb(a), GtidSet::MariaDb(b)) => a.contain(b),
            _ => false,
        }
    }

    /// Replace the contents of `self` with `other`.
    pub fn set(&mut self, other: &GtidSet) -> Result<()> {
        if self.flavor() != other.flavor() {
            return Err(RelayError::GtidFlavorMismatch(
                self.flavor().as_str(),
                other.flavor().as_str(),
            ));
        }
        *self = other.clone();
        Ok(())
    }

    /// Union `other` into `self`.
    pub fn merge(&mut self, other: &GtidSet) -> Result<()> {
        match (self, other) {
            (GtidSet::MySql(a), GtidSet::MySql(b)) => {
                a.merge(b);
                Ok(())
            }
            (GtidSet::MariaDb(a), GtidSet::MariaDb(b)) => {
                a.merge(b);
                Ok(())
            }
            (a, b) => Err(RelayError::GtidFlavorMismatch(
                a.flavor().as_str(),
                b.flavor().as_str(),
            )),
        }
    }

    /// Drop everything not contained in `sub`.
    pub fn truncate(&mut self, sub: &GtidSet) -> Result<()> {
        match (self, sub) {
            (GtidSet::MySql(a), GtidSet::MySql(b)) => {
                a.truncate(b);
                Ok(())
            }
            (GtidSet::MariaDb(a), GtidSet::MariaDb(b)) => {
                a.truncate(b);
                Ok(())
            }
            (a, b) => Err(RelayError::GtidFlavorMismatch(
                a.flavor().as_str(),
                b.flavor().as_str(),
            )),
        }
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GtidSet::MySql(s) => s.fmt(f),
            GtidSet::MariaDb(s) => s.fmt(f),
        }
    }
}

fn parse_seq(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn gtid_parse_err(flavor: Flavor, text: &str, reason: &str) -> RelayError {
    RelayError::GtidParse {
        flavor: flavor.as_str(),
        text: text.to_string(),
        reason: reason.to_string(),
    }
}
