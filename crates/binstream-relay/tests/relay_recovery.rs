//! Crash-recovery round trip over the public relay API.
//!
//! A relay interrupted mid-transaction leaves a torn tail in the active
//! file. After truncation to the last transaction boundary, replaying the
//! remaining upstream events through the writer must reproduce a file
//! byte-identical to the one an uninterrupted relay would have written.

use std::fs;

use tempfile::TempDir;

use binstream_relay::event::decode_event;
use binstream_relay::meta::LocalMeta;
use binstream_relay::position::BinlogPosition;
use binstream_relay::recover::recover_relay_file;
use binstream_relay::writer::FileWriter;
use binstream_relay::{BinlogEvent, Flavor, GtidSet};

const UUID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
const SERVER_ID: u32 = 7;

fn frame(event_type: u8, pos: u64, body: &[u8]) -> Vec<u8> {
    let event_size = (19 + body.len()) as u32;
    let mut out = Vec::with_capacity(event_size as usize);
    out.extend_from_slice(&1_700_000_000u32.to_le_bytes());
    out.push(event_type);
    out.extend_from_slice(&SERVER_ID.to_le_bytes());
    out.extend_from_slice(&event_size.to_le_bytes());
    out.extend_from_slice(&((pos + event_size as u64) as u32).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn gtid_frame(pos: u64, gno: u64) -> Vec<u8> {
    let mut body = vec![0u8];
    let hex: String = UUID.chars().filter(|c| *c != '-').collect();
    for chunk in hex.as_bytes().chunks(2) {
        body.push(u8::from_str_radix(std::str::from_utf8(chunk).unwrap(), 16).unwrap());
    }
    body.extend_from_slice(&gno.to_le_bytes());
    frame(33, pos, &body)
}

fn query_frame(pos: u64, query: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&1u32.to_le_bytes()); // slave proxy id
    body.extend_from_slice(&0u32.to_le_bytes()); // exec time
    body.push(0); // schema length
    body.extend_from_slice(&0u16.to_le_bytes()); // error code
    body.extend_from_slice(&0u16.to_le_bytes()); // status vars length
    body.push(0); // schema terminator
    body.extend_from_slice(query.as_bytes());
    frame(2, pos, &body)
}

fn row_frame(pos: u64) -> Vec<u8> {
    frame(30, pos, &[0xab; 48])
}

fn xid_frame(pos: u64, xid: u64) -> Vec<u8> {
    frame(16, pos, &xid.to_le_bytes())
}

fn decode(raw: &[u8]) -> BinlogEvent {
    decode_event(raw, Flavor::MySql, false).expect("test frame must decode")
}

#[test]
fn test_truncate_and_replay_is_byte_identical() {
    let tmp = TempDir::new().unwrap();
    let dirname = format!("{UUID}.000001");

    // two committed transactions, as an uninterrupted relay writes them
    let txn = |mut pos: u64, gno: u64, xid: u64| {
        let mut frames: Vec<Vec<u8>> = Vec::new();
        for build in [
            Box::new(move |p| gtid_frame(p, gno)) as Box<dyn Fn(u64) -> Vec<u8>>,
            Box::new(|p| query_frame(p, "BEGIN")),
            Box::new(row_frame),
            Box::new(move |p| xid_frame(p, xid)),
        ] {
            let f = build(pos);
            pos += f.len() as u64;
            frames.push(f);
        }
        (frames, pos)
    };
    let (txn1, boundary) = txn(4, 101, 1);
    let (txn2, pos) = txn(boundary, 102, 2);

    let mut full = vec![0xfe, b'b', b'i', b'n'];
    for f in txn1.iter().chain(&txn2) {
        full.extend_from_slice(f);
    }

    // the crash cut the file in the middle of the second transaction
    let crash_len = (boundary as usize) + txn2[0].len() + 7;
    fs::create_dir_all(tmp.path().join(&dirname)).unwrap();
    let file = tmp.path().join(&dirname).join("mysql-bin.000001");
    fs::write(&file, &full[..crash_len]).unwrap();

    // metadata was last flushed at the first transaction boundary
    let meta = LocalMeta::new(Flavor::MySql, tmp.path());
    meta.add_dir(UUID, None, None, 0).unwrap();
    let saved_gtid = GtidSet::parse(Flavor::MySql, &format!("{UUID}:1-101")).unwrap();
    meta.save(
        BinlogPosition::new("mysql-bin.000001", boundary),
        saved_gtid.clone(),
    )
    .unwrap();
    meta.flush().unwrap();

    // restart: recover the torn tail
    let result = recover_relay_file(
        &tmp.path().join(&dirname),
        "mysql-bin.000001",
        Flavor::MySql,
        Some(saved_gtid),
    )
    .unwrap()
    .unwrap();
    assert!(result.truncated);
    assert_eq!(result.latest_pos, BinlogPosition::new("mysql-bin.000001", boundary));
    assert_eq!(fs::metadata(&file).unwrap().len(), boundary);

    // resume: the upstream re-sends the second transaction from the
    // boundary and the writer appends it
    let writer = FileWriter::new(tmp.path());
    writer.init(&dirname, "mysql-bin.000001").unwrap();
    for f in &txn2 {
        let written = writer.write_event(&decode(f)).unwrap();
        assert!(!written.ignore);
    }
    writer.close().unwrap();

    // the final file is byte-identical to the uninterrupted one
    assert_eq!(fs::read(&file).unwrap(), full);

    // and the metadata round-trips through disk
    let pos_after = BinlogPosition::new("mysql-bin.000001", pos);
    let gtid_after = GtidSet::parse(Flavor::MySql, &format!("{UUID}:1-102")).unwrap();
    meta.save(pos_after.clone(), gtid_after.clone()).unwrap();
    meta.flush().unwrap();

    let reloaded = LocalMeta::new(Flavor::MySql, tmp.path());
    reloaded.load().unwrap();
    assert_eq!(reloaded.pos().1, pos_after);
    assert_eq!(reloaded.gtid().1, gtid_after);
}
