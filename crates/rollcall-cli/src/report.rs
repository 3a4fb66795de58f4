//! Plain-text rendering of attendance tables and charts.

use chrono::NaiveDate;
use rollcall_core::attendance::{AttendanceRecord, TIMESTAMP_FORMAT};
use std::fmt::Write;

const BAR_WIDTH: usize = 40;

pub fn records_table(records: &[&AttendanceRecord]) -> String {
    if records.is_empty() {
        return "No attendance records\n".to_string();
    }

    let name_width = records
        .iter()
        .map(|r| r.name.chars().count())
        .chain(std::iter::once("Name".len()))
        .max()
        .unwrap_or(4);

    let mut out = String::new();
    let _ = writeln!(out, "{:<name_width$}  Timestamp", "Name");
    let _ = writeln!(out, "{}  {}", "-".repeat(name_width), "-".repeat(19));
    for r in records {
        let _ = writeln!(out, "{:<name_width$}  {}", r.name, r.timestamp.format(TIMESTAMP_FORMAT));
    }
    out
}

/// Horizontal bars scaled so the largest value spans the full width.
pub fn bar_chart<L: std::fmt::Display>(rows: &[(L, usize)]) -> String {
    let labels: Vec<String> = rows.iter().map(|(label, _)| label.to_string()).collect();
    let label_width = labels.iter().map(|l| l.chars().count()).max().unwrap_or(0);
    let max = rows.iter().map(|(_, n)| *n).max().unwrap_or(0);

    let mut out = String::new();
    for (label, (_, count)) in labels.iter().zip(rows) {
        let len = if max == 0 { 0 } else { (count * BAR_WIDTH).div_ceil(max) };
        let _ = writeln!(out, "{label:<label_width$} | {} {count}", "█".repeat(len));
    }
    out
}

/// Daily totals with a gap row for every day without attendance.
pub fn daily_trend(totals: &[(NaiveDate, usize)]) -> String {
    let (Some((first, _)), Some((last, _))) = (totals.first(), totals.last()) else {
        return String::new();
    };

    let mut filled = Vec::new();
    let mut lookup = totals.iter().peekable();
    for day in first.iter_days().take_while(|d| d <= last) {
        let count = match lookup.peek() {
            Some((d, n)) if *d == day => {
                lookup.next();
                *n
            }
            _ => 0,
        };
        filled.push((day, count));
    }
    bar_chart(&filled)
}
