//! Record types flowing through the pipeline.
//!
//! - [`RawRow`] / [`RawRecord`]: what the input reader saw, as optional raw
//!   strings. Consumed by the normalizer and discarded.
//! - [`CleanRecord`]: typed, validated and de-duplicated on `(entity, ts)`.
//! - [`WindowAggregate`]: one rolling-window statistic for one entity.
//!
//! Time keys are UTC instants with millisecond precision ([`TimeKey`]). A bare
//! integer in the input is read as seconds since the Unix epoch, so plain
//! sequence numbers order correctly.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Error returned when a timestamp cell cannot be interpreted.
#[derive(Debug, Snafu)]
#[snafu(display("Unrecognised timestamp {value:?}"))]
pub struct ParseTimeKeyError {
    value: String,
}

/// Ordering key for records of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeKey(DateTime<Utc>);

const NAIVE_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

impl TimeKey {
    /// Build a key from milliseconds since the Unix epoch.
    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(TimeKey)
    }

    /// Build a key from whole seconds since the Unix epoch.
    pub fn from_secs(secs: i64) -> Option<Self> {
        DateTime::from_timestamp(secs, 0).map(TimeKey)
    }

    /// Milliseconds since the Unix epoch.
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Parse a timestamp cell.
    ///
    /// Accepted forms, tried in order: integer seconds since the epoch,
    /// RFC 3339, `YYYY-MM-DD HH:MM:SS` (or with `T`), and plain dates
    /// (`YYYY-MM-DD`, `YYYY/MM/DD`, `MM/DD/YYYY`) at midnight UTC.
    /// Sub-millisecond precision is truncated.
    pub fn parse(raw: &str) -> Result<Self, ParseTimeKeyError> {
        let trimmed = raw.trim();
        let fail = || ParseTimeKeySnafu { value: trimmed }.build();

        if !trimmed.is_empty()
            && trimmed
                .trim_start_matches('-')
                .chars()
                .all(|c| c.is_ascii_digit())
        {
            let secs = trimmed.parse::<i64>().map_err(|_| fail())?;
            return TimeKey::from_secs(secs).ok_or_else(fail);
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
            return TimeKey::from_millis(dt.timestamp_millis()).ok_or_else(fail);
        }

        for fmt in NAIVE_DATETIME_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
                return TimeKey::from_millis(naive.and_utc().timestamp_millis()).ok_or_else(fail);
            }
        }

        for fmt in NAIVE_DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
                let naive = date.and_hms_opt(0, 0, 0).ok_or_else(fail)?;
                return TimeKey::from_millis(naive.and_utc().timestamp_millis()).ok_or_else(fail);
            }
        }

        Err(fail())
    }
}

impl FromStr for TimeKey {
    type Err = ParseTimeKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimeKey::parse(s)
    }
}

impl fmt::Display for TimeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

/// One input row as read from the file. Every cell is optional; empty cells
/// are already mapped to `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    /// 1-based line number in the input file (the header is line 1).
    pub line: u64,
    /// 0-based position among data rows; later rows have larger values.
    pub ingest_seq: u64,
    /// Entity identifier (grouping key).
    pub entity: Option<String>,
    /// Timestamp or sequence key.
    pub timestamp: Option<String>,
    /// Numeric rating.
    pub rating: Option<String>,
    /// Source review identifier.
    pub review_id: Option<String>,
    /// Display name of the entity.
    pub name: Option<String>,
    /// Reviewer identifier.
    pub reviewer: Option<String>,
    /// Free review text.
    pub text: Option<String>,
}

/// A row as handed from the input reader to the normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRow {
    /// The row had the expected shape.
    Record(RawRecord),
    /// The row could not be split into fields (wrong field count, bad encoding).
    Malformed {
        /// 1-based line number in the input file.
        line: u64,
        /// 0-based position among data rows.
        ingest_seq: u64,
        /// Human-readable description of the problem.
        detail: String,
    },
}

impl RawRow {
    /// Line number of the row, regardless of its shape.
    pub fn line(&self) -> u64 {
        match self {
            RawRow::Record(r) => r.line,
            RawRow::Malformed { line, .. } => *line,
        }
    }
}

/// A validated record. No two clean records of one build share
/// `(entity, ts)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanRecord {
    /// Entity identifier.
    pub entity: String,
    /// Time key.
    pub ts: TimeKey,
    /// Rating, possibly imputed.
    pub rating: f64,
    /// Set when the rating was missing and filled by the impute policy.
    pub rating_imputed: bool,
    /// Ingestion order of the surviving source row.
    pub ingest_seq: u64,
    /// Source review identifier, empty when absent.
    pub review_id: String,
    /// Entity display name; falls back to the entity id.
    pub name: String,
    /// Reviewer identifier, empty when absent.
    pub reviewer: String,
    /// Normalized review text, empty when absent.
    pub text: String,
    /// Lexicon polarity of `text` in `[-1.0, 1.0]`.
    pub sentiment: f64,
}

impl CleanRecord {
    /// Order the aggregator requires: entity, then time. Equal keys keep
    /// whatever order they were given in.
    pub fn order_key(&self) -> (&str, TimeKey) {
        (self.entity.as_str(), self.ts)
    }

    /// Full order used when sorting: [`Self::order_key`], then input order.
    pub fn sort_key(&self) -> (&str, TimeKey, u64) {
        (self.entity.as_str(), self.ts, self.ingest_seq)
    }
}

/// Rolling statistic for one window of one entity's ordered records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAggregate {
    /// Entity identifier.
    pub entity: String,
    /// Time key of the first record in the window.
    pub window_start: TimeKey,
    /// Time key of the last record in the window.
    pub window_end: TimeKey,
    /// Time key of the record the window was computed for.
    pub anchor: TimeKey,
    /// Mean rating over the window.
    pub mean: f64,
    /// Mean sentiment over the window.
    pub sentiment_mean: f64,
    /// Number of records in the window.
    pub count: u32,
    /// Window was clipped at the entity's sequence boundary (`count < W`).
    pub partial: bool,
}

impl WindowAggregate {
    /// Whether `[window_start, window_end]` intersects the inclusive range
    /// `[lo, hi]`; open bounds are unbounded.
    pub fn overlaps(&self, lo: Option<TimeKey>, hi: Option<TimeKey>) -> bool {
        lo.is_none_or(|lo| self.window_end >= lo) && hi.is_none_or(|hi| self.window_start <= hi)
    }
}
