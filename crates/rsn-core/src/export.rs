/// CSV and JSON export of scan results
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::io::{self, Write};

use crate::recovery::ScanReport;
use crate::FileEntry;

pub const CSV_HEADER: [&str; 6] = [
    "Filename",
    "Size (bytes)",
    "Type",
    "Modified",
    "Status",
    "Recovery Priority",
];

const MEDIUM_PRIORITY_MIN_SIZE: u64 = 1024 * 1024;
const MEDIUM_PRIORITY_MAX_AGE_DAYS: i64 = 30;

/// Triage order for exported entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RecoveryPriority {
    Low,
    Medium,
    High,
}

impl RecoveryPriority {
    /// Deleted entries first, then large live files touched in the last 30 days
    pub fn for_entry(entry: &FileEntry, now: DateTime<Utc>) -> Self {
        if entry.is_deleted {
            return RecoveryPriority::High;
        }
        let recent = entry
            .modification_time
            .is_some_and(|t| now - t <= Duration::days(MEDIUM_PRIORITY_MAX_AGE_DAYS));
        if recent && entry.size > MEDIUM_PRIORITY_MIN_SIZE {
            RecoveryPriority::Medium
        } else {
            RecoveryPriority::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryPriority::Low => "Low",
            RecoveryPriority::Medium => "Medium",
            RecoveryPriority::High => "High",
        }
    }
}

/// Quote a field when it holds a delimiter, quote or line break
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_row<W: Write>(writer: &mut W, fields: &[&str]) -> io::Result<()> {
    let line = fields
        .iter()
        .map(|f| csv_field(f))
        .collect::<Vec<_>>()
        .join(",");
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\r\n")
}

/// Write `entries` as CSV, priorities relative to `now`
pub fn write_csv<W: Write>(
    entries: &[FileEntry],
    writer: &mut W,
    now: DateTime<Utc>,
) -> io::Result<()> {
    csv_row(writer, &CSV_HEADER)?;
    for entry in entries {
        let size = entry.size.to_string();
        let modified = entry
            .modification_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        csv_row(
            writer,
            &[
                entry.name.as_str(),
                size.as_str(),
                if entry.is_directory { "Directory" } else { "File" },
                modified.as_str(),
                if entry.is_deleted { "Deleted" } else { "Active" },
                RecoveryPriority::for_entry(entry, now).as_str(),
            ],
        )?;
    }
    writer.flush()
}

pub fn write_json<W: Write>(report: &ScanReport, writer: &mut W) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *writer, report)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(b"\n")?;
    writer.flush()
}
