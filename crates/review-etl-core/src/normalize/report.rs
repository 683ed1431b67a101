//! Rejection and data-quality reports produced by the normalizer.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::model::{RawRow, TimeKey};

/// Number of individual rejections / duplicate resolutions kept as samples.
pub const SAMPLE_LIMIT: usize = 20;

/// Why a row was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Row could not be split into the expected fields.
    Malformed,
    /// Entity cell empty.
    MissingEntity,
    /// Timestamp cell empty.
    MissingTimestamp,
    /// Timestamp cell not parseable.
    InvalidTimestamp,
    /// Rating cell empty under the drop policy.
    MissingRating,
    /// Rating cell present but not a finite number.
    InvalidRating,
}

impl RejectReason {
    /// Stable name used as report key.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Malformed => "malformed",
            RejectReason::MissingEntity => "missing_entity",
            RejectReason::MissingTimestamp => "missing_timestamp",
            RejectReason::InvalidTimestamp => "invalid_timestamp",
            RejectReason::MissingRating => "missing_rating",
            RejectReason::InvalidRating => "invalid_rating",
        }
    }
}

/// One rejected row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    /// 1-based input line.
    pub line: u64,
    /// Classification.
    pub reason: RejectReason,
    /// Human-readable detail.
    pub detail: String,
}

/// Which key two colliding rows shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKey {
    /// Same entity and time key; resolved by [`crate::config::DuplicatePolicy`].
    EntityTime,
    /// Same review id; the earliest row is kept.
    ReviewId,
}

/// One discarded duplicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateResolution {
    /// Key the rows collided on.
    pub key: DuplicateKey,
    /// Entity of the colliding rows.
    pub entity: String,
    /// Shared time key.
    pub ts: TimeKey,
    /// Ingestion order of the row that survived.
    pub kept_seq: u64,
    /// Ingestion order of the row that was discarded.
    pub dropped_seq: u64,
}

/// Outcome of one normalization pass.
///
/// Invariant: `total_rows == cleaned + rejected + duplicates`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RejectionReport {
    /// Rows handed to the normalizer.
    pub total_rows: u64,
    /// Records that survived.
    pub cleaned: u64,
    /// Rows rejected for any reason.
    pub rejected: u64,
    /// Rejections by reason name.
    pub rejected_by_reason: BTreeMap<&'static str, u64>,
    /// Rows discarded by duplicate resolution, on either key.
    pub duplicates: u64,
    /// Of `duplicates`, rows discarded for a repeated review id.
    pub duplicate_review_ids: u64,
    /// Surviving records whose rating was imputed.
    pub imputed: u64,
    /// First rejections, in input order.
    pub samples: Vec<Rejection>,
    /// First duplicate resolutions, `(entity, ts)` collisions before review
    /// id collisions.
    pub duplicate_samples: Vec<DuplicateResolution>,
}

impl RejectionReport {
    pub(crate) fn record_rejection(&mut self, line: u64, reason: RejectReason, detail: String) {
        self.rejected += 1;
        *self.rejected_by_reason.entry(reason.as_str()).or_default() += 1;
        if self.samples.len() < SAMPLE_LIMIT {
            self.samples.push(Rejection {
                line,
                reason,
                detail,
            });
        }
    }

    pub(crate) fn record_duplicate(&mut self, resolution: DuplicateResolution) {
        self.duplicates += 1;
        if resolution.key == DuplicateKey::ReviewId {
            self.duplicate_review_ids += 1;
        }
        if self.duplicate_samples.len() < SAMPLE_LIMIT {
            self.duplicate_samples.push(resolution);
        }
    }

    /// Count for one reason.
    pub fn rejected_for(&self, reason: RejectReason) -> u64 {
        self.rejected_by_reason
            .get(reason.as_str())
            .copied()
            .unwrap_or(0)
    }

    /// Whether the counts add up.
    pub fn is_balanced(&self) -> bool {
        self.total_rows == self.cleaned + self.rejected + self.duplicates
    }
}

/// Data-quality assessment of a raw batch, computed before cleaning.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityReport {
    /// Data rows in the batch.
    pub total_rows: u64,
    /// Rows that could not be split into fields.
    pub malformed_rows: u64,
    /// Missing cells per logical column.
    pub missing_by_column: BTreeMap<&'static str, u64>,
    /// Ratings present but not numeric.
    pub invalid_ratings: u64,
    /// Timestamps present but not parseable.
    pub invalid_timestamps: u64,
    /// Rows whose `(entity, timestamp)` was already seen.
    pub duplicate_keys: u64,
    /// Rows whose review id was already seen.
    pub duplicate_review_ids: u64,
}

/// Assess a raw batch without modifying it.
pub fn assess_quality(rows: &[RawRow]) -> QualityReport {
    let mut report = QualityReport::default();
    let mut seen_keys: HashSet<(&str, TimeKey)> = HashSet::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();

    for row in rows {
        report.total_rows += 1;
        let r = match row {
            RawRow::Record(r) => r,
            RawRow::Malformed { .. } => {
                report.malformed_rows += 1;
                continue;
            }
        };

        for (column, cell) in [
            ("entity", &r.entity),
            ("timestamp", &r.timestamp),
            ("rating", &r.rating),
            ("review_id", &r.review_id),
            ("name", &r.name),
            ("reviewer", &r.reviewer),
            ("text", &r.text),
        ] {
            if cell.is_none() {
                *report.missing_by_column.entry(column).or_default() += 1;
            }
        }

        if let Some(rating) = &r.rating
            && !rating.parse::<f64>().is_ok_and(f64::is_finite)
        {
            report.invalid_ratings += 1;
        }

        let ts = r.timestamp.as_deref().map(TimeKey::parse);
        if let Some(Err(_)) = ts {
            report.invalid_timestamps += 1;
        }

        if let (Some(entity), Some(Ok(ts))) = (r.entity.as_deref(), ts)
            && !seen_keys.insert((entity, ts))
        {
            report.duplicate_keys += 1;
        }

        if let Some(id) = r.review_id.as_deref()
            && !seen_ids.insert(id)
        {
            report.duplicate_review_ids += 1;
        }
    }

    report
}
