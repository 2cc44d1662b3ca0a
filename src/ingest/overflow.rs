//! Append-only JSON-lines file for records the writer could not commit.
//!
//! Entries are replayed into the database on the next start and the file is
//! removed once the replay commits.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ingest::queue::EventRecord;

const ENABLE_LOGS: bool = true;

use crate::log_warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OverflowEntry {
    /// Session the record was routed to; `None` when no session could be
    /// started for it.
    pub session_id: Option<i64>,
    pub record: EventRecord,
    pub parked_at: DateTime<Utc>,
}

pub struct OverflowLog {
    path: PathBuf,
}

impl OverflowLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends entries and syncs the file before returning.
    pub fn append(&self, entries: &[OverflowEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open overflow log {}", self.path.display()))?;
        let torn = ends_mid_line(&mut file).context("failed to inspect overflow log tail")?;
        let mut writer = BufWriter::new(file);
        // a crash mid-append leaves an unterminated fragment; keep it on its own line
        if torn {
            writer.write_all(b"\n")?;
        }
        for entry in entries {
            serde_json::to_writer(&mut writer, entry).context("failed to encode overflow entry")?;
            writer.write_all(b"\n")?;
        }
        let file = writer
            .into_inner()
            .map_err(|err| err.into_error())
            .context("failed to flush overflow log")?;
        file.sync_data().context("failed to sync overflow log")?;
        Ok(())
    }

    /// Reads every entry. A missing file is an empty log; an unreadable line
    /// (a write torn by a crash) is skipped with a warning.
    pub fn load(&self) -> Result<Vec<OverflowEntry>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to open overflow log {}", self.path.display()))
            }
        };

        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.context("failed to read overflow log")?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<OverflowEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => log_warn!(
                    "skipping unreadable overflow line {} in {}: {err}",
                    index + 1,
                    self.path.display()
                ),
            }
        }
        Ok(entries)
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove overflow log {}", self.path.display())),
        }
    }
}

fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{NewBlink, NewPerformanceSample};

    fn entry(session_id: Option<i64>, count: u32) -> OverflowEntry {
        OverflowEntry {
            session_id,
            record: EventRecord::Blink(NewBlink {
                timestamp: Utc::now(),
                blink_count: count,
                blink_rate: 14.0,
                eye_aspect_ratio: Some(0.3),
            }),
            parked_at: Utc::now(),
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = OverflowLog::new(dir.path().join("overflow.jsonl"));
        assert!(log.load().unwrap().is_empty());
        log.clear().unwrap();
    }

    #[test]
    fn appends_accumulate_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let log = OverflowLog::new(dir.path().join("nested").join("overflow.jsonl"));

        log.append(&[entry(Some(1), 1), entry(None, 2)]).unwrap();
        log.append(&[OverflowEntry {
            session_id: Some(1),
            record: EventRecord::Performance(NewPerformanceSample {
                timestamp: Utc::now(),
                cpu_usage: 12.5,
                memory_usage: 61.0,
                battery_level: None,
            }),
            parked_at: Utc::now(),
        }])
        .unwrap();

        let entries = log.load().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].session_id, None);
        assert!(matches!(entries[2].record, EventRecord::Performance(_)));

        log.clear().unwrap();
        assert!(log.load().unwrap().is_empty());
    }

    #[test]
    fn torn_tail_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = OverflowLog::new(dir.path().join("overflow.jsonl"));
        log.append(&[entry(Some(3), 7)]).unwrap();

        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(b"{\"sessionId\":3,\"rec").unwrap();

        let entries = log.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_id, Some(3));
        assert!(matches!(&entries[0].record, EventRecord::Blink(b) if b.blink_count == 7));
    }

    #[test]
    fn append_after_a_torn_fragment_starts_a_new_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = OverflowLog::new(dir.path().join("overflow.jsonl"));
        fs::write(log.path(), b"{\"sessionId\":1,\"rec").unwrap();
        assert!(log.load().unwrap().is_empty());

        log.append(&[entry(Some(1), 4)]).unwrap();
        log.append(&[entry(Some(1), 5)]).unwrap();

        let entries = log.load().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(&entries[0].record, EventRecord::Blink(b) if b.blink_count == 4));
        assert!(matches!(&entries[1].record, EventRecord::Blink(b) if b.blink_count == 5));
    }
}
