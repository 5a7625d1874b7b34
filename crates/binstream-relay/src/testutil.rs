//! Synthetic binlog event frames for tests.
//!
//! Builds byte-accurate event frames (no trailing checksum, matching a
//! pre-5.6 format description) so writer, recovery and engine tests can
//! exercise real files without an upstream server.

use bytes::{BufMut, Bytes, BytesMut};

use crate::event::{
    decode_event, BinlogEvent, EventType, EVENT_HEADER_SIZE, LOG_EVENT_ARTIFICIAL_F,
};
use crate::gtid::{Flavor, GtidSet};

pub struct EventBuilder {
    server_id: u32,
}

impl EventBuilder {
    pub fn new(server_id: u32) -> Self {
        Self { server_id }
    }

    /// Format description event at `pos`, announcing a pre-checksum server.
    pub fn format_description(&self, pos: u64) -> BinlogEvent {
        let mut body = BytesMut::new();
        body.put_u16_le(4); // binlog version
        let mut version = [0u8; 50];
        let v = b"5.5.50-log";
        version[..v.len()].copy_from_slice(v);
        body.put_slice(&version);
        body.put_u32_le(0); // create timestamp
        body.put_u8(EVENT_HEADER_SIZE as u8);
        body.put_slice(&[0u8; 39]); // per-type header lengths
        self.build(EventType::FormatDescriptionEvent, pos, &body, 0)
    }

    pub fn rotate(&self, pos: u64, next_log_name: &str, next_pos: u64) -> BinlogEvent {
        let mut body = BytesMut::new();
        body.put_u64_le(next_pos);
        body.put_slice(next_log_name.as_bytes());
        self.build(EventType::RotateEvent, pos, &body, 0)
    }

    /// Server-synthesized rotate announcing the current file; end position
    /// zero, artificial flag set.
    pub fn fake_rotate(&self, next_log_name: &str, next_pos: u64) -> BinlogEvent {
        let mut body = BytesMut::new();
        body.put_u64_le(next_pos);
        body.put_slice(next_log_name.as_bytes());
        self.build_raw(
            EventType::RotateEvent,
            0,
            &body,
            LOG_EVENT_ARTIFICIAL_F,
            true,
        )
    }

    pub fn query(&self, pos: u64, schema: &str, query: &str) -> BinlogEvent {
        let mut body = BytesMut::new();
        body.put_u32_le(1); // slave proxy id
        body.put_u32_le(0); // execution time
        body.put_u8(schema.len() as u8);
        body.put_u16_le(0); // error code
        body.put_u16_le(0); // status vars length
        body.put_slice(schema.as_bytes());
        body.put_u8(0);
        body.put_slice(query.as_bytes());
        self.build(EventType::QueryEvent, pos, &body, 0)
    }

    pub fn begin(&self, pos: u64) -> BinlogEvent {
        self.query(pos, "", "BEGIN")
    }

    pub fn xid(&self, pos: u64, xid: u64) -> BinlogEvent {
        let mut body = BytesMut::new();
        body.put_u64_le(xid);
        self.build(EventType::XidEvent, pos, &body, 0)
    }

    pub fn gtid(&self, pos: u64, uuid: &str, gno: u64) -> BinlogEvent {
        let mut body = BytesMut::new();
        body.put_u8(0); // commit flag
        body.put_slice(&uuid_bytes(uuid));
        body.put_u64_le(gno);
        self.build(EventType::GtidLogEvent, pos, &body, 0)
    }

    pub fn heartbeat(&self) -> BinlogEvent {
        self.build_raw(
            EventType::HeartbeatLogEvent,
            0,
            b"mysql-bin.000001",
            LOG_EVENT_ARTIFICIAL_F,
            true,
        )
    }

    /// Opaque row-event filler of roughly `payload_len` body bytes.
    pub fn row(&self, pos: u64, payload_len: usize) -> BinlogEvent {
        let body = vec![0xabu8; payload_len];
        self.build(EventType::WriteRowsEventV2, pos, &body, 0)
    }

    fn build(&self, tp: EventType, pos: u64, body: &[u8], flags: u16) -> BinlogEvent {
        self.build_raw(tp, pos, body, flags, false)
    }

    fn build_raw(
        &self,
        tp: EventType,
        pos: u64,
        body: &[u8],
        flags: u16,
        artificial_pos: bool,
    ) -> BinlogEvent {
        let event_size = (EVENT_HEADER_SIZE + body.len()) as u32;
        let log_pos = if artificial_pos {
            0
        } else {
            (pos + event_size as u64) as u32
        };
        let mut frame = BytesMut::with_capacity(event_size as usize);
        frame.put_u32_le(1_700_000_000); // timestamp
        frame.put_u8(tp as u8);
        frame.put_u32_le(self.server_id);
        frame.put_u32_le(event_size);
        frame.put_u32_le(log_pos);
        frame.put_u16_le(flags);
        frame.put_slice(body);
        let raw: Bytes = frame.freeze();
        decode_event(&raw, Flavor::MySql, false).expect("built frame must decode")
    }
}

/// Attach a GTID-set snapshot, as the reader does for query/XID events in
/// GTID mode.
pub fn with_gtid_set(mut ev: BinlogEvent, gset: GtidSet) -> BinlogEvent {
    ev.gtid_set = Some(gset);
    ev
}

fn uuid_bytes(uuid: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let hex: String = uuid.chars().filter(|c| *c != '-').collect();
    assert_eq!(hex.len(), 32, "bad uuid literal in test");
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).unwrap();
        out[i] = u8::from_str_radix(s, 16).unwrap();
    }
    out
}
