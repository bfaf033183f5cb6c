#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON logging shared across NEXUS subsystems.
//!
//! Two writers are provided: [`JsonLogger`] appends to a fixed file, while
//! [`DailyJsonLogger`] rotates to a date-stamped file per UTC day (the
//! contract used by the R&D notes and daily self-learning logs).

use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Routine operational events.
    Info,
    /// Unexpected but recoverable conditions.
    Warn,
    /// Failures requiring attention.
    Error,
}

/// Structured log record serialized as one JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// Subsystem emitting the record (e.g. `learning.scheduler`).
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Structured context fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Attaches a structured field and returns self for chaining.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Truncates a string to at most `max` characters, preserving char boundaries.
#[must_use]
pub fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    value.chars().take(max).collect()
}

/// Thread-safe append-only JSON-lines logger.
#[derive(Debug)]
pub struct JsonLogger {
    path: PathBuf,
    writer: Mutex<File>,
}

impl JsonLogger {
    /// Creates or opens a logger at the given path, creating parents.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Appends one record as a JSON line and flushes.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Underlying file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Logger that writes to `<dir>/<prefix>_YYYYMMDD.jsonl`, rolling at UTC
/// midnight.
#[derive(Debug)]
pub struct DailyJsonLogger {
    dir: PathBuf,
    prefix: String,
    state: Mutex<DailyState>,
}

#[derive(Debug)]
struct DailyState {
    day: NaiveDate,
    file: File,
}

impl DailyJsonLogger {
    /// Creates a daily logger writing under `dir` with the given prefix.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let prefix = prefix.into();
        let day = Utc::now().date_naive();
        let file = Self::open_for(&dir, &prefix, day)?;
        Ok(Self {
            dir,
            prefix,
            state: Mutex::new(DailyState { day, file }),
        })
    }

    fn file_path(dir: &Path, prefix: &str, day: NaiveDate) -> PathBuf {
        dir.join(format!("{prefix}_{}.jsonl", day.format("%Y%m%d")))
    }

    fn open_for(dir: &Path, prefix: &str, day: NaiveDate) -> Result<File> {
        let path = Self::file_path(dir, prefix, day);
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }

    /// Appends an arbitrary serializable payload to today's file.
    pub fn append<T: Serialize>(&self, payload: &T) -> Result<()> {
        let today = Utc::now().date_naive();
        let mut state = self.state.lock();
        if state.day != today {
            state.file = Self::open_for(&self.dir, &self.prefix, today)?;
            state.day = today;
        }
        serde_json::to_writer(&mut state.file, payload)?;
        state.file.write_all(b"\n")?;
        state.file.flush()?;
        Ok(())
    }

    /// Path of today's log file.
    #[must_use]
    pub fn today_path(&self) -> PathBuf {
        Self::file_path(&self.dir, &self.prefix, Utc::now().date_naive())
    }

    /// Reads the last `limit` parsed lines of today's file, skipping
    /// malformed entries.
    #[must_use]
    pub fn tail_today(&self, limit: usize) -> Vec<serde_json::Value> {
        let path = self.today_path();
        let Ok(file) = File::open(path) else {
            return Vec::new();
        };
        let mut rows: Vec<serde_json::Value> = BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();
        if rows.len() > limit {
            rows.drain(..rows.len() - limit);
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn writes_records_as_json_lines() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("nexus.log")).unwrap();
        logger
            .log(
                &LogRecord::new("learning.scheduler", LogLevel::Info, "iteration complete")
                    .with_field("iteration", json!(3)),
            )
            .unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("\"message\":\"iteration complete\""));
        assert!(content.contains("\"iteration\":3"));
    }

    #[test]
    fn daily_logger_appends_and_tails() {
        let dir = tempdir().unwrap();
        let logger = DailyJsonLogger::new(dir.path(), "rnd_notes").unwrap();
        logger.append(&json!({"note": "first"})).unwrap();
        logger.append(&json!({"note": "second"})).unwrap();
        let rows = logger.tail_today(1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["note"], "second");
        let name = logger.today_path();
        assert!(name.file_name().unwrap().to_str().unwrap().starts_with("rnd_notes_"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
