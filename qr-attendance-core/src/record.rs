//! Attendance records and their line format
//!
//! A [`Record`] is one scanned or typed entry. Records are written to the
//! remote store and to the fallback file in the same line format:
//!
//! ```text
//! 2022-06-01 10:00:00<TAB>alice
//! ```

use std::fmt;

use chrono::{DateTime, Datelike, Local, NaiveDateTime, Timelike};

use crate::error::LineParseError;

/// Separator between timestamp and text in the line format
pub const FIELD_SEPARATOR: char = '\t';

/// Default file name of the monthly remote log
pub const DEFAULT_BLOB_FILE_NAME: &str = "attendance.log";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Timestamp layouts accepted when reading a line back.
/// `%.f` also matches an absent fractional part.
const ACCEPTED_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// A single timestamped attendance entry.
///
/// Immutable once built. The timestamp is local wall-clock time with second
/// precision, the text never contains a tab or a line break.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    timestamp: NaiveDateTime,
    text: String,
}

impl Record {
    /// Build a record, dropping sub-second precision and replacing any tab
    /// or line break in `text` with a space.
    pub fn new(timestamp: NaiveDateTime, text: impl Into<String>) -> Self {
        let timestamp = timestamp.with_nanosecond(0).unwrap_or(timestamp);
        let text: String = text.into();
        let text = if text.contains(['\t', '\r', '\n']) {
            text.replace(['\t', '\r', '\n'], " ")
        } else {
            text
        };
        Self { timestamp, text }
    }

    /// Build a record stamped with the current local time
    pub fn now(text: impl Into<String>) -> Self {
        Self::new(Local::now().naive_local(), text)
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Monthly partition this record belongs to, e.g. `year=2022/month=06`
    pub fn partition_key(&self) -> String {
        format!(
            "year={}/month={:02}",
            self.timestamp.year(),
            self.timestamp.month()
        )
    }

    /// Remote object this record is appended to, e.g.
    /// `year=2022/month=06/attendance.log`
    pub fn blob_name(&self, file_name: &str) -> String {
        format!("{}/{}", self.partition_key(), file_name)
    }

    /// Serialize to one newline-terminated line
    pub fn to_line(&self) -> String {
        format!(
            "{}{}{}\n",
            self.timestamp.format(TIMESTAMP_FORMAT),
            FIELD_SEPARATOR,
            self.text
        )
    }

    /// Reconstruct a record from a line produced by [`Record::to_line`].
    ///
    /// Also accepts `T`-separated ISO timestamps, fractional seconds and
    /// RFC 3339 timestamps with an offset (the wall-clock part is kept).
    pub fn parse_line(line: &str) -> Result<Self, LineParseError> {
        let line = line.trim_end_matches(&['\n', '\r'][..]);
        let (timestamp, text) = line
            .split_once(FIELD_SEPARATOR)
            .ok_or(LineParseError::MissingSeparator)?;
        let timestamp = parse_timestamp(timestamp.trim())?;
        Ok(Self::new(timestamp, text))
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.timestamp.format(TIMESTAMP_FORMAT), self.text)
    }
}

fn parse_timestamp(value: &str) -> Result<NaiveDateTime, LineParseError> {
    for format in ACCEPTED_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(ts);
        }
    }
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.naive_local())
        .map_err(|_| LineParseError::Timestamp(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_to_line_format() {
        let record = Record::new(at(2022, 6, 1, 10, 0, 0), "alice");
        assert_eq!(record.to_line(), "2022-06-01 10:00:00\talice\n");
    }

    #[test]
    fn test_line_round_trip() {
        let record = Record::new(at(2023, 12, 31, 23, 59, 59), "bob smith");
        let parsed = Record::parse_line(&record.to_line()).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_partition_key_and_blob_name() {
        let record = Record::new(at(2022, 6, 1, 10, 0, 0), "alice");
        assert_eq!(record.partition_key(), "year=2022/month=06");
        assert_eq!(
            record.blob_name(DEFAULT_BLOB_FILE_NAME),
            "year=2022/month=06/attendance.log"
        );

        let december = Record::new(at(2022, 12, 5, 8, 0, 0), "carol");
        assert_eq!(december.partition_key(), "year=2022/month=12");
    }

    #[test]
    fn test_subsecond_precision_dropped() {
        let ts = at(2022, 6, 1, 10, 0, 0)
            .with_nanosecond(123_456_000)
            .unwrap();
        let record = Record::new(ts, "alice");
        assert_eq!(record.timestamp(), at(2022, 6, 1, 10, 0, 0));
    }

    #[test]
    fn test_separator_in_text_replaced() {
        let record = Record::new(at(2022, 6, 1, 10, 0, 0), "a\tb\nc");
        assert_eq!(record.text(), "a b c");
        assert_eq!(record.to_line().matches('\t').count(), 1);
        assert_eq!(record.to_line().matches('\n').count(), 1);
    }

    #[test]
    fn test_parse_accepts_iso_variants() {
        let expected = at(2022, 6, 1, 10, 0, 0);
        for line in [
            "2022-06-01T10:00:00\talice",
            "2022-06-01 10:00:00.654321\talice\n",
            "2022-06-01T10:00:00+02:00\talice\r\n",
        ] {
            let record = Record::parse_line(line).unwrap();
            assert_eq!(record.timestamp(), expected, "line {line:?}");
            assert_eq!(record.text(), "alice");
        }
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert_eq!(
            Record::parse_line("no separator here"),
            Err(LineParseError::MissingSeparator)
        );
        assert!(matches!(
            Record::parse_line("yesterday\talice"),
            Err(LineParseError::Timestamp(_))
        ));
    }

    #[test]
    fn test_empty_text_survives() {
        let record = Record::new(at(2022, 6, 1, 10, 0, 0), "");
        let parsed = Record::parse_line(&record.to_line()).unwrap();
        assert_eq!(parsed.text(), "");
    }

    #[test]
    fn test_display() {
        let record = Record::new(at(2022, 6, 1, 10, 0, 0), "alice");
        assert_eq!(record.to_string(), "2022-06-01 10:00:00 alice");
    }
}
