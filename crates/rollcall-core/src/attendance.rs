//! Attendance table persisted as a two-column CSV file.
//!
//! The whole table lives in memory and every mutation rewrites the file.
//! At most one record per identity per calendar day is kept; that rule is
//! checked before insertion, not enforced by the storage format.

use crate::types::Identity;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Column names, in file order.
pub const HEADER: [&str; 2] = ["Name", "Timestamp"];

/// Timestamp format written to the table.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("attendance io: {0}")]
    Io(#[from] io::Error),
    #[error("attendance csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("unexpected attendance header {found:?}, expected Name,Timestamp")]
    Schema { found: Vec<String> },
}

/// One attendance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Timestamp", with = "timestamp")]
    pub timestamp: NaiveDateTime,
}

/// Outcome of [`AttendanceLog::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    /// The identity already has a record for that day; nothing was written.
    AlreadyMarked,
}

/// In-memory attendance table bound to its CSV file.
#[derive(Debug)]
pub struct AttendanceLog {
    path: PathBuf,
    records: Vec<AttendanceRecord>,
}

impl AttendanceLog {
    /// Load the table at `path`, creating it (header only) if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AttendanceError> {
        let path = path.into();
        if !path.exists() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let log = Self { path, records: Vec::new() };
            log.persist()?;
            tracing::info!(path = %log.path.display(), "created attendance table");
            return Ok(log);
        }

        let records = read_table(&path)?;
        tracing::debug!(path = %path.display(), rows = records.len(), "attendance table loaded");
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows belonging to `name`, in table order.
    pub fn records_for(&self, name: &str) -> Vec<&AttendanceRecord> {
        self.records.iter().filter(|r| r.name == name).collect()
    }

    /// Distinct names present in the table, sorted.
    pub fn identities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.iter().map(|r| r.name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn is_marked_on(&self, name: &str, day: NaiveDate) -> bool {
        self.records
            .iter()
            .any(|r| r.name == name && r.timestamp.date() == day)
    }

    /// Record `identity` as present at `now` unless it already has a record
    /// on the same calendar day.
    pub fn mark(&mut self, identity: &Identity, now: NaiveDateTime) -> Result<MarkOutcome, AttendanceError> {
        if self.is_marked_on(identity.as_str(), now.date()) {
            tracing::debug!(identity = %identity, date = %now.date(), "already marked today");
            return Ok(MarkOutcome::AlreadyMarked);
        }

        self.records.push(AttendanceRecord {
            name: identity.to_string(),
            timestamp: now,
        });
        if let Err(e) = self.persist() {
            self.records.pop();
            return Err(e);
        }

        tracing::info!(identity = %identity, at = %now.format(TIMESTAMP_FORMAT), "attendance marked");
        Ok(MarkOutcome::Marked)
    }

    /// Drop every record dated `now`'s day. Returns how many were removed.
    pub fn clear_today(&mut self, now: NaiveDateTime) -> Result<usize, AttendanceError> {
        let today = now.date();
        let kept: Vec<AttendanceRecord> = self
            .records
            .iter()
            .filter(|r| r.timestamp.date() != today)
            .cloned()
            .collect();
        let removed = self.records.len() - kept.len();

        let previous = std::mem::replace(&mut self.records, kept);
        if let Err(e) = self.persist() {
            self.records = previous;
            return Err(e);
        }
        tracing::info!(date = %today, removed, "cleared today's attendance");
        Ok(removed)
    }

    /// Truncate the table to its header.
    pub fn clear_all(&mut self) -> Result<(), AttendanceError> {
        let previous = std::mem::take(&mut self.records);
        if let Err(e) = self.persist() {
            self.records = previous;
            return Err(e);
        }
        tracing::info!(removed = previous.len(), "cleared all attendance");
        Ok(())
    }

    /// Records per name, most frequent first (ties by name).
    pub fn counts_by_identity(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for r in &self.records {
            *counts.entry(r.name.as_str()).or_default() += 1;
        }
        let mut counts: Vec<(String, usize)> =
            counts.into_iter().map(|(n, c)| (n.to_string(), c)).collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts
    }

    /// Records per calendar day, oldest first.
    pub fn daily_totals(&self) -> Vec<(NaiveDate, usize)> {
        let mut totals: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        for r in &self.records {
            *totals.entry(r.timestamp.date()).or_default() += 1;
        }
        totals.into_iter().collect()
    }

    /// The full table as CSV text, header included.
    pub fn to_csv(&self) -> Result<String, AttendanceError> {
        let mut buf = Vec::new();
        write_table(&mut buf, &self.records)?;
        String::from_utf8(buf).map_err(|e| AttendanceError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    /// Rewrite the whole file through a uniquely named sibling temp file and
    /// a rename, so concurrent writers never share a temp file.
    fn persist(&self) -> Result<(), AttendanceError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        write_table(tmp.as_file_mut(), &self.records)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn write_table<W: io::Write>(out: W, records: &[AttendanceRecord]) -> Result<(), AttendanceError> {
    // Header written by hand so an empty table still carries the schema.
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(out);
    writer.write_record(HEADER)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

fn read_table(path: &Path) -> Result<Vec<AttendanceRecord>, AttendanceError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;

    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Ok(Vec::new());
    }
    if headers.iter().collect::<Vec<_>>() != HEADER {
        return Err(AttendanceError::Schema {
            found: headers.iter().map(str::to_string).collect(),
        });
    }

    reader
        .deserialize()
        .collect::<Result<Vec<AttendanceRecord>, csv::Error>>()
        .map_err(AttendanceError::from)
}

/// `YYYY-MM-DD HH:MM:SS` on write; fractional seconds and a `T` separator are
/// accepted on read.
mod timestamp {
    use super::TIMESTAMP_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    const READ_FORMATS: [&str; 3] = [TIMESTAMP_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        READ_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(&raw, fmt).ok())
            .ok_or_else(|| de::Error::custom(format!("invalid timestamp {raw:?}")))
    }
}
