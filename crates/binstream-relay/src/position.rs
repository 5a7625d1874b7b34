//! Binlog positions
//!
//! A position is a `(filename, offset)` pair. Filenames follow the MySQL
//! convention `prefix.NNNNNN` and order lexicographically by their numeric
//! suffix; offsets are 64-bit so files larger than 4 GiB stay addressable.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Offset of the first event in a binlog file, right after the 4-byte magic.
pub const MIN_BINLOG_POS: u64 = 4;

/// A `(filename, offset)` position inside a binlog / relay log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BinlogPosition {
    /// Binlog filename, e.g. `mysql-bin.000001`
    pub name: String,
    /// Byte offset inside the file
    pub pos: u64,
}

impl BinlogPosition {
    pub fn new(name: impl Into<String>, pos: u64) -> Self {
        Self {
            name: name.into(),
            pos,
        }
    }

    /// The minimum meaningful position: the first binlog file of a stream,
    /// right after the magic bytes. The filename is left empty; comparing
    /// against it treats any named file as greater.
    pub fn min_position() -> Self {
        Self {
            name: String::new(),
            pos: MIN_BINLOG_POS,
        }
    }

    /// True when no real position has been recorded yet.
    pub fn is_unset(&self) -> bool {
        self.name.is_empty()
    }

    /// Compare two positions: lexicographic on the filename's numeric
    /// suffix, numeric on the offset within the same file.
    pub fn compare(&self, other: &BinlogPosition) -> Ordering {
        match compare_binlog_filenames(&self.name, &other.name) {
            Ordering::Equal => self.pos.cmp(&other.pos),
            ord => ord,
        }
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.name, self.pos)
    }
}

/// Compare two binlog filenames.
///
/// Uses the numeric suffix when both names share a base name, so that
/// `mysql-bin.000010` sorts after `mysql-bin.000009` even if the sequence
/// width ever differs. Falls back to plain string ordering for foreign
/// names, and sorts the empty name before everything.
pub fn compare_binlog_filenames(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    if a.is_empty() {
        return Ordering::Less;
    }
    if b.is_empty() {
        return Ordering::Greater;
    }
    match (split_binlog_filename(a), split_binlog_filename(b)) {
        (Ok((base_a, seq_a)), Ok((base_b, seq_b))) if base_a == base_b => seq_a.cmp(&seq_b),
        _ => a.cmp(b),
    }
}

/// Numeric sequence index of a binlog filename, e.g. 3 for `mysql-bin.000003`.
pub fn filename_index(name: &str) -> Result<u64> {
    split_binlog_filename(name).map(|(_, seq)| seq)
}

/// The filename that follows `name` in the sequence.
pub fn next_filename(name: &str) -> Result<String> {
    let (base, seq) = split_binlog_filename(name)?;
    Ok(format!("{base}.{:06}", seq + 1))
}

fn split_binlog_filename(name: &str) -> Result<(&str, u64)> {
    let (base, seq) = name
        .rsplit_once('.')
        .ok_or_else(|| RelayError::InvalidBinlogFilename(name.to_string()))?;
    if base.is_empty() || seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RelayError::InvalidBinlogFilename(name.to_string()));
    }
    let seq = seq
        .parse::<u64>()
        .map_err(|_| RelayError::InvalidBinlogFilename(name.to_string()))?;
    Ok((base, seq))
}
