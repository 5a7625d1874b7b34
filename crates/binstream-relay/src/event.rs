//! Binlog event model
//!
//! Decodes the event kinds the relay has to understand: format
//! description, rotate (real and synthetic), query, XID, GTID markers and
//! heartbeats. Everything else passes through opaquely; relay files store
//! the raw upstream bytes unmodified, so decoding is only needed for
//! control decisions and crash recovery.

use bytes::{Buf, Bytes};

use crate::error::{RelayError, Result};
use crate::gtid::{Flavor, GtidSet, MariaDbGtid};

/// Magic bytes at offset 0 of every binlog file: `0xFE 'b' 'i' 'n'`.
pub const BINLOG_MAGIC: [u8; 4] = [0xfe, b'b', b'i', b'n'];

/// Fixed size of a binlog event header.
pub const EVENT_HEADER_SIZE: usize = 19;

/// Header flag marking events synthesized by the server rather than read
/// from an on-disk binlog (fake rotates, heartbeat bookkeeping).
pub const LOG_EVENT_ARTIFICIAL_F: u16 = 0x0020;

/// Binlog event types, numbered per the replication wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Unknown = 0,
    QueryEvent = 2,
    StopEvent = 3,
    RotateEvent = 4,
    FormatDescriptionEvent = 15,
    XidEvent = 16,
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    HeartbeatLogEvent = 27,
    WriteRowsEventV2 = 30,
    UpdateRowsEventV2 = 31,
    DeleteRowsEventV2 = 32,
    GtidLogEvent = 33,
    AnonymousGtidLogEvent = 34,
    PreviousGtidsLogEvent = 35,
    MariadbAnnotateRowsEvent = 160,
    MariadbBinlogCheckpointEvent = 161,
    MariadbGtidEvent = 162,
    MariadbGtidListEvent = 163,
}

impl EventType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatLogEvent,
            30 => EventType::WriteRowsEventV2,
            31 => EventType::UpdateRowsEventV2,
            32 => EventType::DeleteRowsEventV2,
            33 => EventType::GtidLogEvent,
            34 => EventType::AnonymousGtidLogEvent,
            35 => EventType::PreviousGtidsLogEvent,
            160 => EventType::MariadbAnnotateRowsEvent,
            161 => EventType::MariadbBinlogCheckpointEvent,
            162 => EventType::MariadbGtidEvent,
            163 => EventType::MariadbGtidListEvent,
            _ => EventType::Unknown,
        }
    }

    pub fn is_row_event(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV1
                | EventType::WriteRowsEventV2
                | EventType::UpdateRowsEventV1
                | EventType::UpdateRowsEventV2
                | EventType::DeleteRowsEventV1
                | EventType::DeleteRowsEventV2
        )
    }
}

/// The 19-byte header every binlog event starts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    /// Raw wire value of the type byte, kept for opaque passthrough.
    pub event_type_code: u8,
    pub server_id: u32,
    pub event_size: u32,
    /// End position of this event in the binlog file (`end_log_pos`).
    pub log_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < EVENT_HEADER_SIZE {
            return Err(RelayError::InvalidEvent(format!(
                "header needs {EVENT_HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let mut cur = &buf[..EVENT_HEADER_SIZE];
        let timestamp = cur.get_u32_le();
        let type_code = cur.get_u8();
        let server_id = cur.get_u32_le();
        let event_size = cur.get_u32_le();
        let log_pos = cur.get_u32_le();
        let flags = cur.get_u16_le();
        if (event_size as usize) < EVENT_HEADER_SIZE {
            return Err(RelayError::InvalidEvent(format!(
                "event size {event_size} smaller than header"
            )));
        }
        Ok(Self {
            timestamp,
            event_type: EventType::from_u8(type_code),
            event_type_code: type_code,
            server_id,
            event_size,
            log_pos,
            flags,
        })
    }

    pub fn is_artificial(&self) -> bool {
        self.flags & LOG_EVENT_ARTIFICIAL_F != 0
    }
}

/// Decoded payloads for the event kinds the relay acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventData {
    FormatDescription {
        binlog_version: u16,
        server_version: String,
        checksum_enabled: bool,
    },
    Rotate {
        /// First event position in the next file.
        position: u64,
        next_log_name: String,
    },
    Query {
        schema: String,
        query: String,
    },
    Xid {
        xid: u64,
    },
    Gtid {
        uuid: String,
        gno: u64,
    },
    MariadbGtid {
        gtid: MariaDbGtid,
    },
    PreviousGtids,
    MariadbGtidList,
    Heartbeat,
    /// Anything the relay passes through without inspecting.
    Other,
}

/// A binlog event: header, decoded payload where the relay needs one, an
/// optional GTID-set snapshot attached by the reader (query / XID events
/// in GTID mode), and the raw upstream bytes.
#[derive(Debug, Clone)]
pub struct BinlogEvent {
    pub header: EventHeader,
    pub data: EventData,
    /// GTID set as of this event, when the reader tracks one.
    pub gtid_set: Option<GtidSet>,
    /// The exact bytes received from upstream, written to relay files.
    pub raw: Bytes,
}

impl BinlogEvent {
    /// A fake rotate is synthesized by the server at stream start (and on
    /// reconnect) to announce the current filename; it carries the
    /// artificial flag and must never be written to the relay file.
    pub fn is_fake_rotate(&self) -> bool {
        self.header.event_type == EventType::RotateEvent && self.header.is_artificial()
    }
}

/// Decode one event frame. `checksum_enabled` strips the trailing CRC32
/// that servers append once the format-description event announces it.
pub fn decode_event(buf: &[u8], flavor: Flavor, checksum_enabled: bool) -> Result<BinlogEvent> {
    let header = EventHeader::decode(buf)?;
    if buf.len() < header.event_size as usize {
        return Err(RelayError::InvalidEvent(format!(
            "event truncated: header says {} bytes, got {}",
            header.event_size,
            buf.len()
        )));
    }
    let frame = &buf[..header.event_size as usize];
    let mut body = &frame[EVENT_HEADER_SIZE..];
    if checksum_enabled && body.len() >= 4 {
        body = &body[..body.len() - 4];
    }

    let data = match header.event_type {
        // the format description announces the checksum algorithm itself,
        // so it is decoded from the unstripped body
        EventType::FormatDescriptionEvent => decode_format_description(&frame[EVENT_HEADER_SIZE..])?,
        EventType::RotateEvent => decode_rotate(body)?,
        EventType::QueryEvent => decode_query(body)?,
        EventType::XidEvent => decode_xid(body)?,
        EventType::GtidLogEvent => decode_gtid(body)?,
        EventType::MariadbGtidEvent if flavor == Flavor::MariaDb => {
            decode_mariadb_gtid(body, header.server_id)?
        }
        EventType::PreviousGtidsLogEvent => EventData::PreviousGtids,
        EventType::MariadbGtidListEvent => EventData::MariadbGtidList,
        EventType::HeartbeatLogEvent => EventData::Heartbeat,
        _ => EventData::Other,
    };

    Ok(BinlogEvent {
        header,
        data,
        gtid_set: None,
        raw: Bytes::copy_from_slice(frame),
    })
}

fn decode_format_description(body: &[u8]) -> Result<EventData> {
    // binlog-version (2) + server-version (50) + create-timestamp (4) +
    // header-length (1), then per-type header lengths
    if body.len() < 57 {
        return Err(RelayError::InvalidEvent("short format description".into()));
    }
    let binlog_version = u16::from_le_bytes([body[0], body[1]]);
    let raw_version = &body[2..52];
    let end = raw_version.iter().position(|&b| b == 0).unwrap_or(50);
    let server_version = String::from_utf8_lossy(&raw_version[..end]).into_owned();
    // servers from 5.6.1 on append a checksum-algorithm byte and a CRC32
    // to every event; the algorithm byte is the 5th byte from the end
    let checksum_enabled = server_supports_checksum(&server_version)
        && body.len() >= 62
        && body[body.len() - 5] == 1;
    Ok(EventData::FormatDescription {
        binlog_version,
        server_version,
        checksum_enabled,
    })
}

fn server_supports_checksum(server_version: &str) -> bool {
    let numeric: String = server_version
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor, patch) >= (5, 6, 1)
}

fn decode_rotate(mut body: &[u8]) -> Result<EventData> {
    if body.len() < 8 {
        return Err(RelayError::InvalidEvent("short rotate event".into()));
    }
    let position = body.get_u64_le();
    let next_log_name = String::from_utf8_lossy(body).into_owned();
    Ok(EventData::Rotate {
        position,
        next_log_name,
    })
}

fn decode_query(body: &[u8]) -> Result<EventData> {
    // slave-proxy-id (4) + exec-time (4) + schema-len (1) + error-code (2)
    // + status-vars-len (2) + status-vars + schema + 0x00 + query
    if body.len() < 13 {
        return Err(RelayError::InvalidEvent("short query event".into()));
    }
    let schema_len = body[4 + 4] as usize;
    let status_vars_len = u16::from_le_bytes([body[11], body[12]]) as usize;
    let schema_start = 13 + status_vars_len;
    let query_start = schema_start + schema_len + 1;
    if body.len() < query_start {
        return Err(RelayError::InvalidEvent("truncated query event".into()));
    }
    let schema = String::from_utf8_lossy(&body[schema_start..schema_start + schema_len]).into_owned();
    let query = String::from_utf8_lossy(&body[query_start..]).into_owned();
    Ok(EventData::Query { schema, query })
}

fn decode_xid(mut body: &[u8]) -> Result<EventData> {
    if body.len() < 8 {
        return Err(RelayError::InvalidEvent("short xid event".into()));
    }
    Ok(EventData::Xid {
        xid: body.get_u64_le(),
    })
}

fn decode_gtid(body: &[u8]) -> Result<EventData> {
    // flags (1) + sid (16) + gno (8)
    if body.len() < 25 {
        return Err(RelayError::InvalidEvent("short gtid event".into()));
    }
    let sid: [u8; 16] = body[1..17].try_into().expect("sliced 16 bytes");
    let uuid = uuid::Uuid::from_bytes(sid)
        .hyphenated()
        .to_string();
    let gno = u64::from_le_bytes(body[17..25].try_into().expect("sliced 8 bytes"));
    Ok(EventData::Gtid { uuid, gno })
}

fn decode_mariadb_gtid(mut body: &[u8], server_id: u32) -> Result<EventData> {
    // seq (8) + domain (4) + flags (1) ...
    if body.len() < 12 {
        return Err(RelayError::InvalidEvent("short mariadb gtid event".into()));
    }
    let seq = body.get_u64_le();
    let domain = body.get_u32_le();
    Ok(EventData::MariadbGtid {
        gtid: MariaDbGtid {
            domain,
            server_id,
            seq,
        },
    })
}

/// Whether a query-event statement is DDL. Transaction control (`BEGIN`,
/// `COMMIT`) and DML routed through query events are not.
pub fn is_ddl_query(query: &str) -> bool {
    let mut rest = query.trim_start();
    // skip leading /* ... */ comment blocks
    while let Some(stripped) = rest.strip_prefix("/*") {
        match stripped.find("*/") {
            Some(end) => rest = stripped[end + 2..].trim_start(),
            None => return false,
        }
    }
    let word: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    matches!(
        word.as_str(),
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::EventBuilder;

    #[test]
    fn test_event_type_from_u8() {
        assert_eq!(EventType::from_u8(4), EventType::RotateEvent);
        assert_eq!(EventType::from_u8(15), EventType::FormatDescriptionEvent);
        assert_eq!(EventType::from_u8(16), EventType::XidEvent);
        assert_eq!(EventType::from_u8(27), EventType::HeartbeatLogEvent);
        assert_eq!(EventType::from_u8(33), EventType::GtidLogEvent);
        assert_eq!(EventType::from_u8(162), EventType::MariadbGtidEvent);
        assert_eq!(EventType::from_u8(200), EventType::Unknown);
    }

    #[test]
    fn test_header_round_trip() {
        let b = EventBuilder::new(7);
        let ev = b.xid(4, 100);
        let header = EventHeader::decode(&ev.raw).unwrap();
        assert_eq!(header.event_type, EventType::XidEvent);
        assert_eq!(header.event_size as usize, ev.raw.len());
        assert_eq!(header.log_pos as u64, 4 + ev.raw.len() as u64);
    }

    #[test]
    fn test_decode_rotate() {
        let b = EventBuilder::new(7);
        let ev = b.rotate(1000, "mysql-bin.000002", 4);
        let decoded = decode_event(&ev.raw, Flavor::MySql, false).unwrap();
        match &decoded.data {
            EventData::Rotate {
                position,
                next_log_name,
            } => {
                assert_eq!(*position, 4);
                assert_eq!(next_log_name, "mysql-bin.000002");
            }
            other => panic!("expected rotate, got {other:?}"),
        }
        assert!(!decoded.is_fake_rotate());
    }

    #[test]
    fn test_fake_rotate_detection() {
        let b = EventBuilder::new(7);
        let ev = b.fake_rotate("mysql-bin.000003", 4);
        assert!(ev.is_fake_rotate());
        assert!(ev.header.is_artificial());
    }

    #[test]
    fn test_decode_query() {
        let b = EventBuilder::new(7);
        let ev = b.query(4, "shop", "CREATE TABLE t (id INT PRIMARY KEY)");
        let decoded = decode_event(&ev.raw, Flavor::MySql, false).unwrap();
        match decoded.data {
            EventData::Query { schema, query } => {
                assert_eq!(schema, "shop");
                assert_eq!(query, "CREATE TABLE t (id INT PRIMARY KEY)");
            }
            other => panic!("expected query, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_gtid() {
        let b = EventBuilder::new(7);
        let uuid = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
        let ev = b.gtid(4, uuid, 42);
        let decoded = decode_event(&ev.raw, Flavor::MySql, false).unwrap();
        match decoded.data {
            EventData::Gtid { uuid: got, gno } => {
                assert_eq!(got, uuid);
                assert_eq!(gno, 42);
            }
            other => panic!("expected gtid, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_truncated_event_fails() {
        let b = EventBuilder::new(7);
        let ev = b.xid(4, 100);
        let cut = &ev.raw[..ev.raw.len() - 1];
        assert!(decode_event(cut, Flavor::MySql, false).is_err());
        assert!(EventHeader::decode(&ev.raw[..10]).is_err());
    }

    #[test]
    fn test_is_ddl_query() {
        assert!(is_ddl_query("CREATE TABLE t (id INT)"));
        assert!(is_ddl_query("  alter table t add column v int"));
        assert!(is_ddl_query("/* comment */ DROP TABLE t"));
        assert!(is_ddl_query("TRUNCATE t"));
        assert!(is_ddl_query("RENAME TABLE a TO b"));

        assert!(!is_ddl_query("BEGIN"));
        assert!(!is_ddl_query("COMMIT"));
        assert!(!is_ddl_query("INSERT INTO t VALUES (1)"));
        assert!(!is_ddl_query("/* unterminated"));
    }
}
