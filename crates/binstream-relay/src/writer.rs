//! Relay file writer
//!
//! Appends raw upstream event bytes to the active relay file and rotates
//! to the next file when a rotate event names one. The writer does not
//! fsync per event; crash safety comes from the recovery scan truncating
//! back to the last transaction boundary on restart.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{RelayError, Result};
use crate::event::{BinlogEvent, EventData, EventType, BINLOG_MAGIC};
use crate::position::compare_binlog_filenames;

/// Why a write was skipped, if it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub ignore: bool,
    pub ignore_reason: &'static str,
}

impl WriteResult {
    fn written() -> Self {
        Self {
            ignore: false,
            ignore_reason: "",
        }
    }

    fn ignored(reason: &'static str) -> Self {
        Self {
            ignore: true,
            ignore_reason: reason,
        }
    }
}

struct ActiveFile {
    uuid: String,
    filename: String,
    file: File,
    offset: u64,
}

/// Append-only writer over the per-identity relay directory.
pub struct FileWriter {
    relay_dir: PathBuf,
    active: Mutex<Option<ActiveFile>>,
}

impl FileWriter {
    pub fn new(relay_dir: impl Into<PathBuf>) -> Self {
        Self {
            relay_dir: relay_dir.into(),
            active: Mutex::new(None),
        }
    }

    /// Open (creating if needed) the relay file the writer appends to.
    pub fn init(&self, uuid: &str, filename: &str) -> Result<()> {
        let mut guard = self.active.lock();
        *guard = Some(self.open_file(uuid, filename)?);
        Ok(())
    }

    /// Append one event. Rotate events switch the active file; events whose
    /// bytes are already present at their end position are ignored so that
    /// reconnect replays stay idempotent.
    pub fn write_event(&self, event: &BinlogEvent) -> Result<WriteResult> {
        let mut guard = self.active.lock();
        let active = guard.as_mut().ok_or(RelayError::WriterNotInitialized)?;

        if event.header.event_type == EventType::RotateEvent {
            return self.handle_rotate(active, event);
        }

        if let Some(result) = check_duplicate(active, event)? {
            return Ok(result);
        }

        active.file.write_all(&event.raw)?;
        active.offset += event.raw.len() as u64;
        Ok(WriteResult::written())
    }

    /// True plus the current end offset when `uuid/filename` is the file
    /// being written.
    pub fn is_active(&self, uuid: &str, filename: &str) -> (bool, u64) {
        let guard = self.active.lock();
        match guard.as_ref() {
            Some(active) if active.uuid == uuid && active.filename == filename => {
                (true, active.offset)
            }
            _ => (false, 0),
        }
    }

    /// Current `(filename, offset)` of the active file, if any.
    pub fn active_position(&self) -> Option<(String, u64)> {
        let guard = self.active.lock();
        guard
            .as_ref()
            .map(|active| (active.filename.clone(), active.offset))
    }

    pub fn close(&self) -> Result<()> {
        let mut guard = self.active.lock();
        if let Some(active) = guard.take() {
            active.file.sync_all()?;
        }
        Ok(())
    }

    fn handle_rotate(&self, active: &mut ActiveFile, event: &BinlogEvent) -> Result<WriteResult> {
        let EventData::Rotate { next_log_name, .. } = &event.data else {
            return Err(RelayError::InvalidEvent(
                "rotate event without rotate payload".into(),
            ));
        };
        let fake = event.is_fake_rotate();

        if !fake {
            if let Some(result) = check_duplicate(active, event)? {
                return Ok(result);
            }
            // the rotate is the last event of the current file
            active.file.write_all(&event.raw)?;
            active.offset += event.raw.len() as u64;
        }

        if compare_binlog_filenames(next_log_name, &active.filename).is_gt() {
            info!(
                from = %active.filename,
                to = %next_log_name,
                fake,
                "rotating relay file"
            );
            active.file.sync_all()?;
            let uuid = active.uuid.clone();
            *active = self.open_file(&uuid, next_log_name)?;
        }

        if fake {
            return Ok(WriteResult::ignored("fake rotate event"));
        }
        Ok(WriteResult::written())
    }

    fn open_file(&self, uuid: &str, filename: &str) -> Result<ActiveFile> {
        if filename.is_empty() {
            return Err(RelayError::InvalidBinlogFilename(filename.to_string()));
        }
        let dir = self.relay_dir.join(uuid);
        fs::create_dir_all(&dir)?;
        let path = dir.join(filename);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let mut offset = file.metadata()?.len();
        if offset == 0 {
            file.write_all(&BINLOG_MAGIC)?;
            offset = BINLOG_MAGIC.len() as u64;
        }
        debug!(file = %path.display(), offset, "opened relay file");
        Ok(ActiveFile {
            uuid: uuid.to_string(),
            filename: filename.to_string(),
            file,
            offset,
        })
    }
}

/// Detect an idempotent re-write: the event's end position already lies
/// within the file and the bytes there match. End positions are 32-bit on
/// the wire, so detection is skipped once a file outgrows them; duplicates
/// only occur right after a reconnect, near the live tail.
fn check_duplicate(active: &mut ActiveFile, event: &BinlogEvent) -> Result<Option<WriteResult>> {
    let end_pos = event.header.log_pos as u64;
    let len = event.raw.len() as u64;
    if active.offset > u32::MAX as u64 || end_pos > active.offset || end_pos < len {
        return Ok(None);
    }

    let start = end_pos - len;
    let mut existing = vec![0u8; event.raw.len()];
    active.file.seek(SeekFrom::Start(start))?;
    active.file.read_exact(&mut existing)?;
    active.file.seek(SeekFrom::End(0))?;

    if existing == event.raw {
        return Ok(Some(WriteResult::ignored("duplicate event")));
    }
    Err(RelayError::EventConflict {
        filename: active.filename.clone(),
        log_pos: end_pos,
    })
}
