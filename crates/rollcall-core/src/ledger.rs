//! Attendance ledger: per-day append-only CSV files plus the in-memory set
//! of labels already recorded this session.
//!
//! Each record is one line, `label,YYYY-MM-DD,HH:MM:SS`, with no header.
//! Appends open the day file, write the complete line in one call and
//! close it again, so an interrupted write can never damage earlier lines.
//! Labels with control characters are refused, so a record never spans
//! more than one line.

use crate::registry::is_valid_label;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("failed to write attendance log {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read attendance log {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid label {0:?}: must be non-empty with no control characters")]
    InvalidLabel(String),
}

/// One person's first appearance on a given day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub label: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl AttendanceRecord {
    pub fn new(label: impl Into<String>, at: NaiveDateTime) -> Self {
        Self {
            label: label.into(),
            date: at.date(),
            time: at.time().with_nanosecond(0).unwrap_or_else(|| at.time()),
        }
    }

    /// The newline-terminated CSV line stored in the day file.
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{}\n",
            csv_field(&self.label),
            self.date.format(DATE_FORMAT),
            self.time.format(TIME_FORMAT)
        )
    }

    /// Parse one stored line. Returns `None` for anything malformed.
    pub fn parse_csv_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut tail = line.rsplitn(3, ',');
        let time = NaiveTime::parse_from_str(tail.next()?, TIME_FORMAT).ok()?;
        let date = NaiveDate::parse_from_str(tail.next()?, DATE_FORMAT).ok()?;
        let label = unquote(tail.next()?)?;
        Some(Self { label, date, time })
    }
}

impl fmt::Display for AttendanceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} {}",
            self.label,
            self.date.format(DATE_FORMAT),
            self.time.format(TIME_FORMAT)
        )
    }
}

/// What a call to [`AttendanceLedger::record`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A new line was appended and the label is now marked for the session.
    Logged(AttendanceRecord),
    /// Already recorded this session; nothing was written.
    Duplicate,
}

pub struct AttendanceLedger {
    dir: PathBuf,
    session: HashSet<String>,
}

impl AttendanceLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            session: HashSet::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Day file for `date`: `<dir>/attendance_<YYYY-MM-DD>.csv`.
    pub fn log_path(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("attendance_{}.csv", date.format(DATE_FORMAT)))
    }

    /// Record `label` as present at `now`, at most once per session.
    ///
    /// The label is only marked after the line reached the file, so a
    /// failed write can be retried on a later sighting.
    pub fn record(
        &mut self,
        label: &str,
        now: NaiveDateTime,
    ) -> Result<RecordOutcome, LedgerError> {
        if self.session.contains(label) {
            return Ok(RecordOutcome::Duplicate);
        }
        if !is_valid_label(label) {
            return Err(LedgerError::InvalidLabel(label.to_string()));
        }

        let record = AttendanceRecord::new(label, now);
        let path = self.log_path(record.date);
        append_line(&self.dir, &path, &record.to_csv_line())?;

        self.session.insert(label.to_string());
        tracing::info!(label, path = %path.display(), "attendance logged");
        Ok(RecordOutcome::Logged(record))
    }

    pub fn is_logged(&self, label: &str) -> bool {
        self.session.contains(label)
    }

    pub fn session_len(&self) -> usize {
        self.session.len()
    }

    /// Forget who was seen this session. Files on disk are untouched.
    pub fn clear_session(&mut self) {
        self.session.clear();
    }

    /// All records stored for `date`, in file order.
    ///
    /// A missing file is an empty day.
    pub fn read_day(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let path = self.log_path(date);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(LedgerError::Read { path, source }),
        };

        let mut records = Vec::new();
        for (n, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match AttendanceRecord::parse_csv_line(line) {
                Some(r) => records.push(r),
                None => tracing::warn!(
                    path = %path.display(),
                    line = n + 1,
                    "malformed attendance line"
                ),
            }
        }
        Ok(records)
    }
}

fn append_line(dir: &Path, path: &Path, line: &str) -> Result<(), LedgerError> {
    let write_err = |source| LedgerError::Write {
        path: path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(write_err)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(write_err)?;
    file.write_all(line.as_bytes()).map_err(write_err)
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn unquote(field: &str) -> Option<String> {
    match field.strip_prefix('"') {
        Some(inner) => Some(inner.strip_suffix('"')?.replace("\"\"", "\"")),
        None => Some(field.to_string()),
    }
}
