//! Input reader: delimited text file to [`RawRow`]s.
//!
//! The input is a bounded batch, so the whole file is read in one go and
//! split with the `csv` crate in flexible mode. Only file-level problems
//! (unreadable file, broken header, missing required column) fail the read;
//! a row with the wrong number of fields or an undecodable byte sequence is
//! returned as [`RawRow::Malformed`] so the normalizer can count it.

use std::collections::HashMap;

use csv::{ByteRecord, ReaderBuilder};
use log::{debug, info, warn};
use snafu::prelude::*;

use crate::{
    config::{Encoding, InputConfig},
    error::ErrorKind,
    model::{RawRecord, RawRow},
};

/// Cells treated as missing in addition to empty ones (case-insensitive).
/// Key columns (entity, timestamp) only treat empty cells as missing, so an
/// id such as `NA` survives.
const NULL_TOKENS: &[&str] = &["na", "n/a", "nan", "null", "none", "nil"];

/// File-level failures of the input reader.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IngestError {
    /// The input file could not be read.
    #[snafu(display("Failed to read input file {path}: {source}"))]
    ReadInput {
        /// Input path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The header row is missing or cannot be parsed.
    #[snafu(display("Failed to read header row: {source}"))]
    Header {
        /// Underlying CSV error.
        source: csv::Error,
    },

    /// The header row is empty.
    #[snafu(display("Input has no header row"))]
    EmptyHeader,

    /// A header cell is not valid in the configured encoding.
    #[snafu(display("Header column {index} is not valid {encoding:?}"))]
    HeaderEncoding {
        /// 0-based column index.
        index: usize,
        /// Configured encoding.
        encoding: Encoding,
    },

    /// A required column is absent from the header.
    #[snafu(display("Required column {column:?} not found in header {headers:?}"))]
    MissingColumn {
        /// Configured column name.
        column: String,
        /// Header as read.
        headers: Vec<String>,
    },
}

impl IngestError {
    /// Machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InputError
    }
}

/// Rows read from one input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBatch {
    /// Header cells, trimmed.
    pub headers: Vec<String>,
    /// Data rows in file order.
    pub rows: Vec<RawRow>,
}

impl RawBatch {
    /// Number of rows that could not be split into fields.
    pub fn malformed_count(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| matches!(r, RawRow::Malformed { .. }))
            .count()
    }
}

/// Read and split the configured input file.
pub async fn read_input(cfg: &InputConfig) -> Result<RawBatch, IngestError> {
    let bytes = tokio::fs::read(&cfg.path).await.context(ReadInputSnafu {
        path: cfg.path.display().to_string(),
    })?;
    info!("read {} bytes from {}", bytes.len(), cfg.path.display());
    parse_input(&bytes, cfg)
}

struct ColumnIndex {
    entity: usize,
    timestamp: usize,
    rating: usize,
    review_id: Option<usize>,
    name: Option<usize>,
    reviewer: Option<usize>,
    text: Option<usize>,
}

impl ColumnIndex {
    fn resolve(headers: &[String], cfg: &InputConfig) -> Result<Self, IngestError> {
        let positions: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .rev()
            .map(|(i, h)| (h.as_str(), i))
            .collect();

        let required = |name: &str| {
            positions.get(name).copied().context(MissingColumnSnafu {
                column: name,
                headers: headers.to_vec(),
            })
        };
        let optional = |name: &Option<String>| {
            let name = name.as_deref()?;
            let found = positions.get(name).copied();
            if found.is_none() {
                warn!("optional column {name:?} not in header; using defaults");
            }
            found
        };

        let cols = &cfg.columns;
        Ok(Self {
            entity: required(&cols.entity)?,
            timestamp: required(&cols.timestamp)?,
            rating: required(&cols.rating)?,
            review_id: optional(&cols.review_id),
            name: optional(&cols.name),
            reviewer: optional(&cols.reviewer),
            text: optional(&cols.text),
        })
    }
}

fn decode(bytes: &[u8], encoding: Encoding) -> Option<String> {
    match encoding {
        Encoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_owned),
        Encoding::Latin1 => Some(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}

fn is_null_token(cell: &str) -> bool {
    NULL_TOKENS.iter().any(|t| cell.eq_ignore_ascii_case(t))
}

/// Split already-loaded input bytes. See [`read_input`].
pub fn parse_input(bytes: &[u8], cfg: &InputConfig) -> Result<RawBatch, IngestError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(cfg.delimiter_byte())
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let header_record = reader.byte_headers().context(HeaderSnafu)?.clone();
    ensure!(!header_record.is_empty(), EmptyHeaderSnafu);

    let mut headers = Vec::with_capacity(header_record.len());
    for (index, cell) in header_record.iter().enumerate() {
        let text = decode(cell, cfg.encoding).context(HeaderEncodingSnafu {
            index,
            encoding: cfg.encoding,
        })?;
        let text = if index == 0 {
            text.trim_start_matches('\u{feff}').to_string()
        } else {
            text
        };
        headers.push(text.trim().to_string());
    }

    let columns = ColumnIndex::resolve(&headers, cfg)?;
    let width = headers.len();

    let mut rows = Vec::new();
    let mut record = ByteRecord::new();
    let mut ingest_seq = 0u64;
    loop {
        let line_hint = reader.position().line();
        match reader.read_byte_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                let line = record.position().map_or(line_hint, |p| p.line());
                rows.push(split_row(&record, &columns, width, line, ingest_seq, cfg.encoding));
            }
            Err(e) => {
                let line = e.position().map_or(line_hint, |p| p.line());
                rows.push(RawRow::Malformed {
                    line,
                    ingest_seq,
                    detail: e.to_string(),
                });
            }
        }
        ingest_seq += 1;
    }

    debug!("split {} data rows over {} columns", rows.len(), width);
    Ok(RawBatch { headers, rows })
}

fn split_row(
    record: &ByteRecord,
    columns: &ColumnIndex,
    width: usize,
    line: u64,
    ingest_seq: u64,
    encoding: Encoding,
) -> RawRow {
    if record.len() != width {
        return RawRow::Malformed {
            line,
            ingest_seq,
            detail: format!("expected {width} fields, found {}", record.len()),
        };
    }

    let mut bad_column = None;
    let mut cell = |index: Option<usize>, key: bool| -> Option<String> {
        let index = index?;
        let bytes = record.get(index)?;
        match decode(bytes, encoding) {
            Some(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() || (!key && is_null_token(trimmed)) {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            None => {
                bad_column.get_or_insert(index);
                None
            }
        }
    };

    let raw = RawRecord {
        line,
        ingest_seq,
        entity: cell(Some(columns.entity), true),
        timestamp: cell(Some(columns.timestamp), true),
        rating: cell(Some(columns.rating), false),
        review_id: cell(columns.review_id, false),
        name: cell(columns.name, false),
        reviewer: cell(columns.reviewer, false),
        text: cell(columns.text, false),
    };

    match bad_column {
        Some(index) => RawRow::Malformed {
            line,
            ingest_seq,
            detail: format!("column {index} is not valid {encoding:?}"),
        },
        None => RawRow::Record(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnMap;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn simple_cfg() -> InputConfig {
        InputConfig {
            columns: ColumnMap {
                entity: "entity".to_string(),
                timestamp: "ts".to_string(),
                rating: "rating".to_string(),
                review_id: None,
                name: None,
                reviewer: None,
                text: Some("text".to_string()),
            },
            ..InputConfig::default()
        }
    }

    fn record(row: &RawRow) -> &RawRecord {
        match row {
            RawRow::Record(r) => r,
            RawRow::Malformed { detail, .. } => panic!("unexpected malformed row: {detail}"),
        }
    }

    #[test]
    fn splits_rows_and_maps_empty_cells_to_none() -> TestResult {
        let input = b"entity,ts,rating,text\nA,1,5,great\nA,2,,\nA,3,4,  ok  \n";
        let batch = parse_input(input, &simple_cfg())?;

        assert_eq!(batch.headers, vec!["entity", "ts", "rating", "text"]);
        assert_eq!(batch.rows.len(), 3);

        let second = record(&batch.rows[1]);
        assert_eq!(second.line, 3);
        assert_eq!(second.ingest_seq, 1);
        assert_eq!(second.rating, None);
        assert_eq!(second.text, None);

        let third = record(&batch.rows[2]);
        assert_eq!(third.text.as_deref(), Some("ok"));
        Ok(())
    }

    #[test]
    fn ragged_rows_are_malformed_not_fatal() -> TestResult {
        let input = b"entity,ts,rating,text\nA,1,5\nA,2,4,x,extra\nB,1,3,fine\n";
        let batch = parse_input(input, &simple_cfg())?;

        assert_eq!(batch.rows.len(), 3);
        assert_eq!(batch.malformed_count(), 2);
        assert!(matches!(batch.rows[0], RawRow::Malformed { line: 2, .. }));
        assert_eq!(record(&batch.rows[2]).entity.as_deref(), Some("B"));
        Ok(())
    }

    #[test]
    fn null_tokens_are_missing() -> TestResult {
        let input = b"entity,ts,rating,text\nA,1,N/A,null\n";
        let batch = parse_input(input, &simple_cfg())?;
        let r = record(&batch.rows[0]);
        assert_eq!(r.rating, None);
        assert_eq!(r.text, None);
        Ok(())
    }

    #[test]
    fn key_columns_keep_null_like_values() -> TestResult {
        let input = b"entity,ts,rating,text\nNA,1,5,x\nnone,null,4,y\n,2,3,z\n";
        let batch = parse_input(input, &simple_cfg())?;
        assert_eq!(record(&batch.rows[0]).entity.as_deref(), Some("NA"));
        assert_eq!(record(&batch.rows[1]).entity.as_deref(), Some("none"));
        assert_eq!(record(&batch.rows[1]).timestamp.as_deref(), Some("null"));
        assert_eq!(record(&batch.rows[2]).entity, None);
        Ok(())
    }

    #[test]
    fn invalid_utf8_rejects_only_that_row() -> TestResult {
        let mut input = b"entity,ts,rating,text\nA,1,5,caf".to_vec();
        input.extend_from_slice(&[0xE9, b'\n']);
        input.extend_from_slice(b"A,2,4,ok\n");

        let batch = parse_input(&input, &simple_cfg())?;
        assert!(matches!(batch.rows[0], RawRow::Malformed { .. }));
        assert_eq!(record(&batch.rows[1]).rating.as_deref(), Some("4"));
        Ok(())
    }

    #[test]
    fn latin1_decodes_every_byte() -> TestResult {
        let mut input = b"entity;ts;rating;text\nA;1;5;caf".to_vec();
        input.extend_from_slice(&[0xE9, b'\n']);
        let cfg = InputConfig {
            delimiter: ';',
            encoding: Encoding::Latin1,
            ..simple_cfg()
        };

        let batch = parse_input(&input, &cfg)?;
        assert_eq!(record(&batch.rows[0]).text.as_deref(), Some("café"));
        Ok(())
    }

    #[test]
    fn bom_is_stripped_from_first_header() -> TestResult {
        let input = "\u{feff}entity,ts,rating,text\nA,1,5,x\n";
        let batch = parse_input(input.as_bytes(), &simple_cfg())?;
        assert_eq!(batch.headers[0], "entity");
        Ok(())
    }

    #[test]
    fn missing_required_column_fails_the_read() {
        let input = b"entity,when,rating\nA,1,5\n";
        let err = parse_input(input, &simple_cfg()).expect_err("missing ts column");
        assert!(matches!(err, IngestError::MissingColumn { ref column, .. } if column == "ts"));
        assert_eq!(err.kind(), ErrorKind::InputError);
    }

    #[tokio::test]
    async fn missing_file_is_an_input_error() {
        let cfg = InputConfig {
            path: "/no/such/reviews.csv".into(),
            ..simple_cfg()
        };
        let err = read_input(&cfg).await.expect_err("missing file");
        assert!(matches!(err, IngestError::ReadInput { .. }));
    }
}
