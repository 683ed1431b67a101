//! Normalizer: raw rows to typed, de-duplicated [`CleanRecord`]s.
//!
//! Every row handed in ends up in exactly one bucket: cleaned, rejected (with
//! a reason) or discarded as a duplicate. A single bad row never fails the
//! batch. Duplicates are resolved in two passes: first on `(entity, ts)` by
//! the configured policy, then on review id, where the earliest row wins.
//! The output is sorted by `(entity, ts)`, which is the order the aggregator
//! requires.

pub mod report;
pub mod sentiment;
pub mod text;

use std::collections::{BTreeMap, HashMap, btree_map::Entry};

use log::debug;
use snafu::prelude::*;

use crate::{
    config::{DuplicatePolicy, MissingValuePolicy, NormalizeConfig},
    error::ErrorKind,
    model::{CleanRecord, ParseTimeKeyError, RawRecord, RawRow, TimeKey},
};

pub use report::{
    DuplicateKey, DuplicateResolution, QualityReport, RejectReason, Rejection, RejectionReport,
    assess_quality,
};

/// Why one row could not become a [`CleanRecord`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RowError {
    /// The reader could not split the row.
    #[snafu(display("Malformed row: {detail}"))]
    Malformed {
        /// Reader's description.
        detail: String,
    },

    /// Entity cell is empty.
    #[snafu(display("Missing entity"))]
    MissingEntity,

    /// Timestamp cell is empty.
    #[snafu(display("Missing timestamp"))]
    MissingTimestamp,

    /// Timestamp cell could not be parsed.
    #[snafu(display("Invalid timestamp {value:?}"))]
    InvalidTimestamp {
        /// Raw cell.
        value: String,
        /// Parser error.
        source: ParseTimeKeyError,
    },

    /// Rating cell is empty and the policy is to drop.
    #[snafu(display("Missing rating"))]
    MissingRating,

    /// Rating cell is not a finite number.
    #[snafu(display("Invalid rating {value:?}"))]
    InvalidRating {
        /// Raw cell.
        value: String,
    },
}

impl RowError {
    /// Report bucket for this error.
    pub fn reason(&self) -> RejectReason {
        match self {
            RowError::Malformed { .. } => RejectReason::Malformed,
            RowError::MissingEntity => RejectReason::MissingEntity,
            RowError::MissingTimestamp => RejectReason::MissingTimestamp,
            RowError::InvalidTimestamp { .. } => RejectReason::InvalidTimestamp,
            RowError::MissingRating => RejectReason::MissingRating,
            RowError::InvalidRating { .. } => RejectReason::InvalidRating,
        }
    }

    /// Machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ParseError
    }
}

/// Output of [`normalize`].
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    /// Clean records sorted by `(entity, ts)`.
    pub records: Vec<CleanRecord>,
    /// What happened to every input row.
    pub report: RejectionReport,
}

/// Clean and de-duplicate a batch.
pub fn normalize(rows: Vec<RawRow>, cfg: &NormalizeConfig) -> Normalized {
    let mut report = RejectionReport::default();
    let mut by_key: BTreeMap<(String, TimeKey), CleanRecord> = BTreeMap::new();

    for row in rows {
        report.total_rows += 1;
        let line = row.line();
        let record = match clean_row(row, cfg) {
            Ok(record) => record,
            Err(e) => {
                debug!("line {line}: rejected: {e}");
                report.record_rejection(line, e.reason(), e.to_string());
                continue;
            }
        };

        match by_key.entry((record.entity.clone(), record.ts)) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                let replace = match cfg.duplicates {
                    DuplicatePolicy::LastSeen => record.ingest_seq > existing.ingest_seq,
                    DuplicatePolicy::FirstSeen => record.ingest_seq < existing.ingest_seq,
                };
                let (kept_seq, dropped_seq) = if replace {
                    (record.ingest_seq, existing.ingest_seq)
                } else {
                    (existing.ingest_seq, record.ingest_seq)
                };
                report.record_duplicate(DuplicateResolution {
                    key: DuplicateKey::EntityTime,
                    entity: record.entity.clone(),
                    ts: record.ts,
                    kept_seq,
                    dropped_seq,
                });
                if replace {
                    *existing = record;
                }
            }
        }
    }

    let mut records: Vec<CleanRecord> = by_key.into_values().collect();
    if cfg.dedup_review_ids {
        drop_repeated_review_ids(&mut records, &mut report);
    }
    report.cleaned = records.len() as u64;
    report.imputed = records.iter().filter(|r| r.rating_imputed).count() as u64;

    Normalized { records, report }
}

/// Keep the earliest-ingested record of every non-empty review id.
fn drop_repeated_review_ids(records: &mut Vec<CleanRecord>, report: &mut RejectionReport) {
    let mut first_seq: HashMap<String, u64> = HashMap::new();
    for r in records.iter().filter(|r| !r.review_id.is_empty()) {
        first_seq
            .entry(r.review_id.clone())
            .and_modify(|seq| *seq = (*seq).min(r.ingest_seq))
            .or_insert(r.ingest_seq);
    }

    records.retain(|r| match first_seq.get(&r.review_id) {
        Some(&kept_seq) if kept_seq != r.ingest_seq => {
            debug!("review id {:?}: dropping row {}", r.review_id, r.ingest_seq);
            report.record_duplicate(DuplicateResolution {
                key: DuplicateKey::ReviewId,
                entity: r.entity.clone(),
                ts: r.ts,
                kept_seq,
                dropped_seq: r.ingest_seq,
            });
            false
        }
        _ => true,
    });
}

fn clean_row(row: RawRow, cfg: &NormalizeConfig) -> Result<CleanRecord, RowError> {
    let raw = match row {
        RawRow::Record(raw) => raw,
        RawRow::Malformed { detail, .. } => return MalformedSnafu { detail }.fail(),
    };
    let RawRecord {
        ingest_seq,
        entity,
        timestamp,
        rating,
        review_id,
        name,
        reviewer,
        text,
        ..
    } = raw;

    let entity = entity
        .map(|e| text::clean_text(&e))
        .filter(|e| !e.is_empty())
        .context(MissingEntitySnafu)?;

    let timestamp = timestamp.context(MissingTimestampSnafu)?;
    let ts = TimeKey::parse(&timestamp).context(InvalidTimestampSnafu { value: &timestamp })?;

    let (rating, rating_imputed) = match rating {
        Some(cell) => match cell.parse::<f64>() {
            Ok(v) if v.is_finite() => (v, false),
            _ => return InvalidRatingSnafu { value: cell }.fail(),
        },
        None => match cfg.missing_values {
            MissingValuePolicy::Drop => return MissingRatingSnafu.fail(),
            MissingValuePolicy::Impute { value } => (value, true),
        },
    };

    let name = name
        .map(|n| text::title_case(&text::clean_text(&n)))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| entity.clone());
    let text = text.map(|t| text::clean_text(&t)).unwrap_or_default();
    let sentiment = sentiment::polarity(&text);

    Ok(CleanRecord {
        entity,
        ts,
        rating,
        rating_imputed,
        ingest_seq,
        review_id: review_id.map(|id| text::clean_text(&id)).unwrap_or_default(),
        name,
        reviewer: reviewer.map(|r| text::clean_text(&r)).unwrap_or_default(),
        text,
        sentiment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(seq: u64, entity: &str, ts: &str, rating: Option<&str>) -> RawRow {
        RawRow::Record(RawRecord {
            line: seq + 2,
            ingest_seq: seq,
            entity: Some(entity.to_string()),
            timestamp: Some(ts.to_string()),
            rating: rating.map(str::to_string),
            ..RawRecord::default()
        })
    }

    #[test]
    fn buckets_every_row_exactly_once() {
        let rows = vec![
            raw(0, "A", "1", Some("5")),
            raw(1, "A", "3", Some("4")),
            raw(2, "A", "3", Some("2")),
            raw(3, "B", "bogus", Some("3")),
            raw(4, "B", "2", None),
            raw(5, "B", "4", Some("four")),
            RawRow::Malformed {
                line: 8,
                ingest_seq: 6,
                detail: "wrong field count".to_string(),
            },
        ];

        let out = normalize(rows, &NormalizeConfig::default());
        let r = &out.report;
        assert_eq!(r.total_rows, 7);
        assert_eq!(r.cleaned, 2);
        assert_eq!(r.duplicates, 1);
        assert_eq!(r.rejected, 4);
        assert!(r.is_balanced());
        assert_eq!(r.rejected_for(RejectReason::InvalidTimestamp), 1);
        assert_eq!(r.rejected_for(RejectReason::MissingRating), 1);
        assert_eq!(r.rejected_for(RejectReason::InvalidRating), 1);
        assert_eq!(r.rejected_for(RejectReason::Malformed), 1);
        assert_eq!(r.samples[0].line, 5);
    }

    #[test]
    fn last_seen_keeps_later_row() {
        let rows = vec![raw(0, "A", "3", Some("4")), raw(1, "A", "3", Some("2"))];
        let out = normalize(rows, &NormalizeConfig::default());
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].rating, 2.0);
        assert_eq!(out.report.duplicate_samples[0].key, DuplicateKey::EntityTime);
        assert_eq!(out.report.duplicate_samples[0].kept_seq, 1);
        assert_eq!(out.report.duplicate_samples[0].dropped_seq, 0);
    }

    #[test]
    fn first_seen_keeps_earlier_row() {
        let rows = vec![raw(0, "A", "3", Some("4")), raw(1, "A", "3", Some("2"))];
        let cfg = NormalizeConfig {
            duplicates: DuplicatePolicy::FirstSeen,
            ..NormalizeConfig::default()
        };
        let out = normalize(rows, &cfg);
        assert_eq!(out.records[0].rating, 4.0);
        assert_eq!(out.report.duplicates, 1);
    }

    fn with_id(row: RawRow, id: &str) -> RawRow {
        match row {
            RawRow::Record(mut r) => {
                r.review_id = Some(id.to_string());
                RawRow::Record(r)
            }
            other => other,
        }
    }

    #[test]
    fn repeated_review_id_keeps_earliest_row() {
        let rows = vec![
            with_id(raw(0, "A", "2024-01-02", Some("5")), "r1"),
            with_id(raw(1, "A", "2024-01-01", Some("1")), "r1"),
            with_id(raw(2, "B", "2024-01-01", Some("3")), "r2"),
            raw(3, "B", "2024-01-02", Some("4")),
            raw(4, "B", "2024-01-03", Some("2")),
        ];

        let out = normalize(rows, &NormalizeConfig::default());
        let r = &out.report;
        assert_eq!(r.cleaned, 4);
        assert_eq!(r.duplicates, 1);
        assert_eq!(r.duplicate_review_ids, 1);
        assert!(r.is_balanced());

        let a: Vec<_> = out.records.iter().filter(|r| r.entity == "A").collect();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].rating, 5.0);
        let d = &r.duplicate_samples[0];
        assert_eq!(d.key, DuplicateKey::ReviewId);
        assert_eq!((d.kept_seq, d.dropped_seq), (0, 1));
    }

    #[test]
    fn review_id_pass_can_be_disabled() {
        let rows = vec![
            with_id(raw(0, "A", "1", Some("5")), "r1"),
            with_id(raw(1, "A", "2", Some("4")), "r1"),
        ];
        let cfg = NormalizeConfig {
            dedup_review_ids: false,
            ..NormalizeConfig::default()
        };
        let out = normalize(rows, &cfg);
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.report.duplicates, 0);
    }

    #[test]
    fn ids_equal_after_nfkc_collide() {
        let rows = vec![
            with_id(raw(0, "\u{FF21}", "1", Some("5")), "r\u{FF11}"),
            with_id(raw(1, "A", "2", Some("4")), "r1"),
        ];
        let out = normalize(rows, &NormalizeConfig::default());
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].entity, "A");
        assert_eq!(out.records[0].review_id, "r1");
    }

    #[test]
    fn impute_fills_and_flags_missing_ratings() {
        let cfg = NormalizeConfig {
            missing_values: MissingValuePolicy::Impute { value: 3.0 },
            ..NormalizeConfig::default()
        };
        let out = normalize(vec![raw(0, "A", "1", None)], &cfg);
        assert_eq!(out.records.len(), 1);
        assert!(out.records[0].rating_imputed);
        assert_eq!(out.records[0].rating, 3.0);
        assert_eq!(out.report.imputed, 1);
    }

    #[test]
    fn non_finite_ratings_are_rejected() {
        let out = normalize(
            vec![raw(0, "A", "1", Some("NaN")), raw(1, "A", "2", Some("inf"))],
            &NormalizeConfig::default(),
        );
        assert!(out.records.is_empty());
        assert_eq!(out.report.rejected_for(RejectReason::InvalidRating), 2);
    }

    #[test]
    fn output_is_sorted_by_entity_then_time() {
        let rows = vec![
            raw(0, "B", "2", Some("1")),
            raw(1, "A", "9", Some("1")),
            raw(2, "A", "1", Some("1")),
        ];
        let out = normalize(rows, &NormalizeConfig::default());
        let keys: Vec<_> = out
            .records
            .iter()
            .map(|r| (r.entity.as_str(), r.ts.as_millis()))
            .collect();
        assert_eq!(keys, vec![("A", 1_000), ("A", 9_000), ("B", 2_000)]);
    }

    #[test]
    fn text_fields_are_cleaned() {
        let row = RawRow::Record(RawRecord {
            line: 2,
            ingest_seq: 0,
            entity: Some("  P1 ".to_string()),
            timestamp: Some("2024-01-01".to_string()),
            rating: Some("5".to_string()),
            name: Some("wireless   MOUSE".to_string()),
            text: Some("  really   great  ".to_string()),
            ..RawRecord::default()
        });
        let out = normalize(vec![row, raw(1, "P2", "1", Some("1"))], &NormalizeConfig::default());
        assert_eq!(out.records[0].entity, "P1");
        assert_eq!(out.records[0].name, "Wireless Mouse");
        assert_eq!(out.records[0].text, "really great");
        assert!(out.records[0].sentiment > 0.0);
        assert_eq!(out.records[1].name, "P2");
    }
}
