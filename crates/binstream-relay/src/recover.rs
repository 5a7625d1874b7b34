//! Relay file crash recovery
//!
//! After a crash the active relay file may end mid-transaction or
//! mid-event. Recovery scans the file, finds the last position that ends a
//! complete transaction (an XID event or a DDL query event) and truncates
//! anything after it, so a restarted relay resumes exactly at a
//! transaction boundary.
//!
//! Offsets are tracked in 64 bits by accumulating event sizes rather than
//! trusting the 32-bit `end_log_pos` header field, so files past 4 GiB
//! recover correctly.

use std::fs::{self, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::event::{is_ddl_query, EventData, EventHeader, BINLOG_MAGIC, EVENT_HEADER_SIZE};
use crate::gtid::{Flavor, GtidSet};
use crate::position::BinlogPosition;

/// Outcome of recovering one relay file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverResult {
    /// Whether trailing bytes were cut off.
    pub truncated: bool,
    /// Position of the last complete transaction.
    pub latest_pos: BinlogPosition,
    /// GTID set through the last complete transaction (base set plus every
    /// transaction observed in the file).
    pub latest_gtids: Option<GtidSet>,
}

/// Result of scanning a file for its last transaction boundary.
#[derive(Debug)]
struct BoundaryScan {
    latest_pos: u64,
    latest_gtids: Option<GtidSet>,
}

/// Recover the given relay file: scan for the last complete transaction
/// and truncate anything past it. Returns `None` when there is no file to
/// recover.
pub fn recover_relay_file(
    dir: &Path,
    filename: &str,
    flavor: Flavor,
    base_gtids: Option<GtidSet>,
) -> Result<Option<RecoverResult>> {
    if filename.is_empty() {
        return Ok(None);
    }
    let full: PathBuf = dir.join(filename);
    let size = match fs::metadata(&full) {
        Ok(md) => md.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let scan = scan_txn_boundaries(&full, flavor, base_gtids)?;

    if size == scan.latest_pos {
        return Ok(Some(RecoverResult {
            truncated: false,
            latest_pos: BinlogPosition::new(filename, scan.latest_pos),
            latest_gtids: scan.latest_gtids,
        }));
    }
    if size < scan.latest_pos {
        return Err(RelayError::LatestPosGtFileSize {
            latest_pos: scan.latest_pos,
            size,
        });
    }

    info!(
        file = %full.display(),
        size,
        latest_pos = scan.latest_pos,
        "truncating relay file to last transaction boundary"
    );
    let f = OpenOptions::new().write(true).open(&full)?;
    f.set_len(scan.latest_pos)?;
    f.sync_all()?;

    Ok(Some(RecoverResult {
        truncated: true,
        latest_pos: BinlogPosition::new(filename, scan.latest_pos),
        latest_gtids: scan.latest_gtids,
    }))
}

/// Walk the file event by event, tracking the offset after the most recent
/// XID or DDL query event and the GTID set accumulated through it.
fn scan_txn_boundaries(
    path: &Path,
    flavor: Flavor,
    base_gtids: Option<GtidSet>,
) -> Result<BoundaryScan> {
    let file = fs::File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != BINLOG_MAGIC {
        return Err(RelayError::InvalidEvent(format!(
            "{} does not start with the binlog magic",
            path.display()
        )));
    }

    let mut offset: u64 = BINLOG_MAGIC.len() as u64;
    let mut latest_pos = offset;
    let mut latest_gtids = base_gtids;
    // GTIDs of transactions begun but not yet committed at the scan point
    let mut pending_gtids = latest_gtids.clone();
    let mut checksum_enabled = false;

    loop {
        let mut header_buf = [0u8; EVENT_HEADER_SIZE];
        match read_exact_or_eof(&mut reader, &mut header_buf)? {
            ReadOutcome::Eof => break,
            ReadOutcome::Partial => {
                debug!(offset, "partial event header at file tail");
                break;
            }
            ReadOutcome::Full => {}
        }
        let header = match EventHeader::decode(&header_buf) {
            Ok(h) => h,
            Err(e) => {
                warn!(offset, error = %e, "undecodable event header, stopping scan");
                break;
            }
        };
        let body_len = header.event_size as usize - EVENT_HEADER_SIZE;
        let mut body = vec![0u8; body_len];
        match read_exact_or_eof(&mut reader, &mut body)? {
            ReadOutcome::Full => {}
            ReadOutcome::Eof | ReadOutcome::Partial => {
                debug!(offset, "partial event body at file tail");
                break;
            }
        }
        offset += header.event_size as u64;

        let mut frame = Vec::with_capacity(header.event_size as usize);
        frame.extend_from_slice(&header_buf);
        frame.extend_from_slice(&body);
        let event = match crate::event::decode_event(&frame, flavor, checksum_enabled) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(offset, error = %e, "undecodable event, stopping scan");
                break;
            }
        };

        match &event.data {
            EventData::FormatDescription {
                checksum_enabled: enabled,
                ..
            } => {
                checksum_enabled = *enabled;
            }
            EventData::Gtid { uuid, gno } => {
                let set = pending_gtids.get_or_insert_with(|| GtidSet::empty(Flavor::MySql));
                if let GtidSet::MySql(s) = set {
                    s.add_gtid(uuid, *gno);
                }
            }
            EventData::MariadbGtid { gtid } => {
                let set = pending_gtids.get_or_insert_with(|| GtidSet::empty(Flavor::MariaDb));
                if let GtidSet::MariaDb(s) = set {
                    s.add_gtid(*gtid);
                }
            }
            EventData::Xid { .. } => {
                latest_pos = offset;
                latest_gtids = pending_gtids.clone();
            }
            EventData::Query { query, .. } if is_ddl_query(query) => {
                latest_pos = offset;
                latest_gtids = pending_gtids.clone();
            }
            _ => {}
        }
    }

    Ok(BoundaryScan {
        latest_pos,
        latest_gtids,
    })
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Partial
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::EventBuilder;
    use std::io::Write;
    use tempfile::TempDir;

    const UUID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    fn write_file(dir: &Path, name: &str, events: &[&crate::event::BinlogEvent]) -> u64 {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(&BINLOG_MAGIC).unwrap();
        for ev in events {
            f.write_all(&ev.raw).unwrap();
        }
        f.metadata().unwrap().len()
    }

    #[test]
    fn test_recover_missing_file() {
        let tmp = TempDir::new().unwrap();
        assert!(recover_relay_file(tmp.path(), "mysql-bin.000001", Flavor::MySql, None)
            .unwrap()
            .is_none());
        assert!(recover_relay_file(tmp.path(), "", Flavor::MySql, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_recover_complete_file_untouched() {
        let tmp = TempDir::new().unwrap();
        let b = EventBuilder::new(1);

        let mut pos = 4;
        let fmt = b.format_description(pos);
        pos += fmt.raw.len() as u64;
        let begin = b.begin(pos);
        pos += begin.raw.len() as u64;
        let row = b.row(pos, 40);
        pos += row.raw.len() as u64;
        let xid = b.xid(pos, 9);
        pos += xid.raw.len() as u64;

        // fmt is not a boundary, so a complete file for recovery purposes
        // ends at the XID
        let size = write_file(tmp.path(), "mysql-bin.000001", &[&fmt, &begin, &row, &xid]);
        assert_eq!(size, pos);

        let result = recover_relay_file(tmp.path(), "mysql-bin.000001", Flavor::MySql, None)
            .unwrap()
            .unwrap();
        assert!(!result.truncated);
        assert_eq!(result.latest_pos, BinlogPosition::new("mysql-bin.000001", size));
    }

    #[test]
    fn test_recover_truncates_incomplete_transaction() {
        let tmp = TempDir::new().unwrap();
        let b = EventBuilder::new(1);

        let mut pos = 4;
        let fmt = b.format_description(pos);
        pos += fmt.raw.len() as u64;
        let begin = b.begin(pos);
        pos += begin.raw.len() as u64;
        let row = b.row(pos, 40);
        pos += row.raw.len() as u64;
        let xid = b.xid(pos, 9);
        pos += xid.raw.len() as u64;
        let boundary = pos;

        // a second transaction that never commits
        let begin2 = b.begin(pos);
        pos += begin2.raw.len() as u64;
        let row2 = b.row(pos, 64);

        write_file(
            tmp.path(),
            "mysql-bin.000001",
            &[&fmt, &begin, &row, &xid, &begin2, &row2],
        );

        let result = recover_relay_file(tmp.path(), "mysql-bin.000001", Flavor::MySql, None)
            .unwrap()
            .unwrap();
        assert!(result.truncated);
        assert_eq!(result.latest_pos.pos, boundary);
        assert_eq!(
            fs::metadata(tmp.path().join("mysql-bin.000001")).unwrap().len(),
            boundary
        );
    }

    #[test]
    fn test_recover_truncates_partial_event_bytes() {
        let tmp = TempDir::new().unwrap();
        let b = EventBuilder::new(1);

        let mut pos = 4;
        let ddl = b.query(pos, "shop", "CREATE TABLE t (id INT)");
        pos += ddl.raw.len() as u64;
        let boundary = pos;
        let xid = b.xid(pos, 9);

        let path = tmp.path().join("mysql-bin.000001");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(&BINLOG_MAGIC).unwrap();
        f.write_all(&ddl.raw).unwrap();
        // half an event at the tail
        f.write_all(&xid.raw[..xid.raw.len() / 2]).unwrap();
        drop(f);

        let result = recover_relay_file(tmp.path(), "mysql-bin.000001", Flavor::MySql, None)
            .unwrap()
            .unwrap();
        assert!(result.truncated);
        assert_eq!(result.latest_pos.pos, boundary);
        assert_eq!(fs::metadata(&path).unwrap().len(), boundary);
        // re-running recovery is a no-op
        let again = recover_relay_file(tmp.path(), "mysql-bin.000001", Flavor::MySql, None)
            .unwrap()
            .unwrap();
        assert!(!again.truncated);
        assert_eq!(again.latest_pos.pos, boundary);
    }

    #[test]
    fn test_recover_accumulates_gtids() {
        let tmp = TempDir::new().unwrap();
        let b = EventBuilder::new(1);

        let mut pos = 4;
        let g1 = b.gtid(pos, UUID, 5);
        pos += g1.raw.len() as u64;
        let xid1 = b.xid(pos, 1);
        pos += xid1.raw.len() as u64;
        let g2 = b.gtid(pos, UUID, 6);
        pos += g2.raw.len() as u64;
        // transaction 6 never commits, so it must not appear in the result
        let row = b.row(pos, 16);

        write_file(tmp.path(), "mysql-bin.000001", &[&g1, &xid1, &g2, &row]);

        let base = GtidSet::parse(Flavor::MySql, &format!("{UUID}:1-4")).unwrap();
        let result =
            recover_relay_file(tmp.path(), "mysql-bin.000001", Flavor::MySql, Some(base))
                .unwrap()
                .unwrap();
        assert!(result.truncated);
        assert_eq!(
            result.latest_gtids.unwrap().to_string(),
            format!("{UUID}:1-5")
        );
    }
}
