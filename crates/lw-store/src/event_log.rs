//! ---
//! lw_section: "03-persistence-logging"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Daily peak tracking and append-only event log."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
//! Append-only JSONL trail of telemetry snapshots, audit records and
//! anomaly events. Records are never rewritten; the log is the durable
//! answer to "what did protection do and when".
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::{Result, StoreError};

/// On-disk format version written into the header line.
pub const EVENT_LOG_VERSION: u16 = 1;

/// First line of every log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventLogHeader {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
}

impl EventLogHeader {
    fn new() -> Self {
        let created_at = Utc::now();
        let hash = format!(
            "{:x}",
            sha2::Sha256::digest(created_at.to_rfc3339().as_bytes())
        );
        Self {
            version: EVENT_LOG_VERSION,
            created_at,
            hash,
        }
    }
}

/// One appended record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Sequential identifier assigned when appending.
    pub sequence: u64,
    /// Timestamp when the record was written.
    pub timestamp: DateTime<Utc>,
    /// Record class: `telemetry`, `audit` or `anomaly`.
    pub kind: String,
    /// Self-contained JSON payload.
    pub payload: serde_json::Value,
}

/// Append-only writer. One writer per file; appends are flushed before
/// returning so a crash never loses an acknowledged record.
pub struct EventLogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
}

impl EventLogWriter {
    /// Open a log for appending, writing a header if the file is new.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let exists = path.exists();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);

        if !exists || is_empty(path)? {
            let header = EventLogHeader::new();
            let line = serde_json::to_string(&header)?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            return Ok(Self {
                path: path.to_path_buf(),
                writer,
                next_sequence: 0,
            });
        }

        let next_sequence = last_sequence(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            next_sequence,
        })
    }

    /// Append a record of `kind` and return its assigned sequence number.
    pub fn append(&mut self, kind: &str, payload: serde_json::Value) -> Result<u64> {
        self.next_sequence += 1;
        let record = EventRecord {
            sequence: self.next_sequence,
            timestamp: Utc::now(),
            kind: kind.to_owned(),
            payload,
        };
        let line = serde_json::to_string(&record)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(record.sequence)
    }

    /// Path of the log on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_empty(path: &Path) -> Result<bool> {
    Ok(fs::metadata(path)?.len() == 0)
}

fn last_sequence(path: &Path) -> Result<u64> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut last = 0u64;
    for line in reader.lines().skip(1) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(record) = serde_json::from_str::<EventRecord>(&line) {
            last = record.sequence;
        }
    }
    Ok(last)
}

/// Replay the log in order, invoking the callback for each record.
pub fn replay<F>(path: &Path, mut handler: F) -> Result<usize>
where
    F: FnMut(EventRecord) -> Result<()>,
{
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut count = 0usize;
    for line in reader.lines().skip(1) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: EventRecord = serde_json::from_str(&line)?;
        handler(record)?;
        count += 1;
    }
    Ok(count)
}

/// Streaming iterator over log records.
pub struct EventLogReader {
    lines: std::io::Lines<BufReader<File>>,
}

impl EventLogReader {
    /// Open the log for sequential reading.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut first_line = String::new();
        reader.read_line(&mut first_line)?; // discard header
        Ok(Self {
            lines: reader.lines(),
        })
    }
}

impl Iterator for EventLogReader {
    type Item = Result<EventRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lines.next()? {
            Ok(line) if line.trim().is_empty() => self.next(),
            Ok(line) => Some(serde_json::from_str(&line).map_err(StoreError::from)),
            Err(err) => Some(Err(err.into())),
        }
    }
}
