//! Arrow/Parquet encoding of snapshot tables.
//!
//! Both tables are written as a single Arrow batch into an in-memory Parquet
//! buffer (Snappy compressed) and read back with
//! `ParquetRecordBatchReaderBuilder` over `Bytes`. Time keys are stored as
//! `Timestamp(Millisecond, None)` holding UTC instants. No column is
//! nullable; a null on read means the file is corrupt.

use std::sync::Arc;

use arrow::{
    array::{
        Array, ArrayRef, BooleanArray, Float64Array, StringArray, TimestampMillisecondArray,
        UInt32Array, UInt64Array,
    },
    datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit},
    record_batch::RecordBatch,
};
use bytes::Bytes;
use parquet::{
    arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder},
    basic::Compression,
    file::properties::WriterProperties,
};
use snafu::prelude::*;

use crate::{
    model::{CleanRecord, TimeKey, WindowAggregate},
    store::{ArrowSnafu, CorruptSnapshotSnafu, ParquetReadSnafu, ParquetWriteSnafu, StoreError},
};

const RECORDS: &str = "records";
const AGGREGATES: &str = "aggregates";

fn ts_type() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, None)
}

/// Schema of the `records` table.
pub fn records_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("entity", DataType::Utf8, false),
        Field::new("ts", ts_type(), false),
        Field::new("rating", DataType::Float64, false),
        Field::new("rating_imputed", DataType::Boolean, false),
        Field::new("ingest_seq", DataType::UInt64, false),
        Field::new("review_id", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("reviewer", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("sentiment", DataType::Float64, false),
    ]))
}

/// Schema of the `aggregates` table.
pub fn aggregates_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("entity", DataType::Utf8, false),
        Field::new("window_start", ts_type(), false),
        Field::new("window_end", ts_type(), false),
        Field::new("anchor", ts_type(), false),
        Field::new("mean", DataType::Float64, false),
        Field::new("sentiment_mean", DataType::Float64, false),
        Field::new("count", DataType::UInt32, false),
        Field::new("partial", DataType::Boolean, false),
    ]))
}

fn strings<'a>(values: impl Iterator<Item = &'a str>) -> ArrayRef {
    Arc::new(StringArray::from_iter_values(values))
}

fn timestamps(values: impl Iterator<Item = TimeKey>) -> ArrayRef {
    Arc::new(TimestampMillisecondArray::from_iter_values(
        values.map(|k| k.as_millis()),
    ))
}

fn floats(values: impl Iterator<Item = f64>) -> ArrayRef {
    Arc::new(Float64Array::from_iter_values(values))
}

fn to_parquet(table: &'static str, batch: &RecordBatch) -> Result<Vec<u8>, StoreError> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))
        .context(ParquetWriteSnafu { table })?;
    writer.write(batch).context(ParquetWriteSnafu { table })?;
    writer.close().context(ParquetWriteSnafu { table })?;
    Ok(buf)
}

fn from_parquet(table: &'static str, bytes: Bytes) -> Result<Vec<RecordBatch>, StoreError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .context(ParquetReadSnafu { table })?
        .build()
        .context(ParquetReadSnafu { table })?;
    reader
        .map(|batch| batch.context(ArrowSnafu { table }))
        .collect()
}

fn column<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    table: &'static str,
    name: &str,
) -> Result<&'a T, StoreError> {
    let col = batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .with_context(|| CorruptSnapshotSnafu {
            version: 0u64,
            msg: format!("{table}: column {name:?} missing or mistyped"),
        })?;
    ensure!(
        col.null_count() == 0,
        CorruptSnapshotSnafu {
            version: 0u64,
            msg: format!("{table}: column {name:?} contains nulls"),
        }
    );
    Ok(col)
}

fn time_key(table: &'static str, millis: i64) -> Result<TimeKey, StoreError> {
    TimeKey::from_millis(millis).with_context(|| CorruptSnapshotSnafu {
        version: 0u64,
        msg: format!("{table}: timestamp {millis} out of range"),
    })
}

/// Encode clean records as a Parquet file.
pub fn encode_records(records: &[CleanRecord]) -> Result<Vec<u8>, StoreError> {
    let columns = vec![
        strings(records.iter().map(|r| r.entity.as_str())),
        timestamps(records.iter().map(|r| r.ts)),
        floats(records.iter().map(|r| r.rating)),
        Arc::new(BooleanArray::from(
            records.iter().map(|r| r.rating_imputed).collect::<Vec<_>>(),
        )) as ArrayRef,
        Arc::new(UInt64Array::from_iter_values(
            records.iter().map(|r| r.ingest_seq),
        )) as ArrayRef,
        strings(records.iter().map(|r| r.review_id.as_str())),
        strings(records.iter().map(|r| r.name.as_str())),
        strings(records.iter().map(|r| r.reviewer.as_str())),
        strings(records.iter().map(|r| r.text.as_str())),
        floats(records.iter().map(|r| r.sentiment)),
    ];
    let batch = RecordBatch::try_new(records_schema(), columns)
        .context(ArrowSnafu { table: RECORDS })?;
    to_parquet(RECORDS, &batch)
}

/// Decode a Parquet file written by [`encode_records`].
pub fn decode_records(bytes: Bytes) -> Result<Vec<CleanRecord>, StoreError> {
    let mut out = Vec::new();
    for batch in from_parquet(RECORDS, bytes)? {
        let entity = column::<StringArray>(&batch, RECORDS, "entity")?;
        let ts = column::<TimestampMillisecondArray>(&batch, RECORDS, "ts")?;
        let rating = column::<Float64Array>(&batch, RECORDS, "rating")?;
        let imputed = column::<BooleanArray>(&batch, RECORDS, "rating_imputed")?;
        let seq = column::<UInt64Array>(&batch, RECORDS, "ingest_seq")?;
        let review_id = column::<StringArray>(&batch, RECORDS, "review_id")?;
        let name = column::<StringArray>(&batch, RECORDS, "name")?;
        let reviewer = column::<StringArray>(&batch, RECORDS, "reviewer")?;
        let text = column::<StringArray>(&batch, RECORDS, "text")?;
        let sentiment = column::<Float64Array>(&batch, RECORDS, "sentiment")?;

        out.reserve(batch.num_rows());
        for i in 0..batch.num_rows() {
            out.push(CleanRecord {
                entity: entity.value(i).to_string(),
                ts: time_key(RECORDS, ts.value(i))?,
                rating: rating.value(i),
                rating_imputed: imputed.value(i),
                ingest_seq: seq.value(i),
                review_id: review_id.value(i).to_string(),
                name: name.value(i).to_string(),
                reviewer: reviewer.value(i).to_string(),
                text: text.value(i).to_string(),
                sentiment: sentiment.value(i),
            });
        }
    }
    Ok(out)
}

/// Encode window aggregates as a Parquet file.
pub fn encode_aggregates(aggregates: &[WindowAggregate]) -> Result<Vec<u8>, StoreError> {
    let columns = vec![
        strings(aggregates.iter().map(|a| a.entity.as_str())),
        timestamps(aggregates.iter().map(|a| a.window_start)),
        timestamps(aggregates.iter().map(|a| a.window_end)),
        timestamps(aggregates.iter().map(|a| a.anchor)),
        floats(aggregates.iter().map(|a| a.mean)),
        floats(aggregates.iter().map(|a| a.sentiment_mean)),
        Arc::new(UInt32Array::from_iter_values(
            aggregates.iter().map(|a| a.count),
        )) as ArrayRef,
        Arc::new(BooleanArray::from(
            aggregates.iter().map(|a| a.partial).collect::<Vec<_>>(),
        )) as ArrayRef,
    ];
    let batch = RecordBatch::try_new(aggregates_schema(), columns)
        .context(ArrowSnafu { table: AGGREGATES })?;
    to_parquet(AGGREGATES, &batch)
}

/// Decode a Parquet file written by [`encode_aggregates`].
pub fn decode_aggregates(bytes: Bytes) -> Result<Vec<WindowAggregate>, StoreError> {
    let mut out = Vec::new();
    for batch in from_parquet(AGGREGATES, bytes)? {
        let entity = column::<StringArray>(&batch, AGGREGATES, "entity")?;
        let start = column::<TimestampMillisecondArray>(&batch, AGGREGATES, "window_start")?;
        let end = column::<TimestampMillisecondArray>(&batch, AGGREGATES, "window_end")?;
        let anchor = column::<TimestampMillisecondArray>(&batch, AGGREGATES, "anchor")?;
        let mean = column::<Float64Array>(&batch, AGGREGATES, "mean")?;
        let sentiment = column::<Float64Array>(&batch, AGGREGATES, "sentiment_mean")?;
        let count = column::<UInt32Array>(&batch, AGGREGATES, "count")?;
        let partial = column::<BooleanArray>(&batch, AGGREGATES, "partial")?;

        out.reserve(batch.num_rows());
        for i in 0..batch.num_rows() {
            out.push(WindowAggregate {
                entity: entity.value(i).to_string(),
                window_start: time_key(AGGREGATES, start.value(i))?,
                window_end: time_key(AGGREGATES, end.value(i))?,
                anchor: time_key(AGGREGATES, anchor.value(i))?,
                mean: mean.value(i),
                sentiment_mean: sentiment.value(i),
                count: count.value(i),
                partial: partial.value(i),
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(secs: i64) -> TimeKey {
        TimeKey::from_secs(secs).expect("key")
    }

    #[test]
    fn records_survive_parquet() -> Result<(), Box<dyn std::error::Error>> {
        let records = vec![CleanRecord {
            entity: "P1".to_string(),
            ts: key(1_700_000_000),
            rating: 4.5,
            rating_imputed: true,
            ingest_seq: 7,
            review_id: "r-1".to_string(),
            name: "Wireless Mouse".to_string(),
            reviewer: "c-9".to_string(),
            text: "great mouse".to_string(),
            sentiment: 0.8,
        }];
        let bytes = encode_records(&records)?;
        assert_eq!(&bytes[..4], b"PAR1");
        assert_eq!(decode_records(Bytes::from(bytes))?, records);
        Ok(())
    }

    #[test]
    fn empty_aggregates_table_is_readable() -> Result<(), Box<dyn std::error::Error>> {
        let bytes = encode_aggregates(&[])?;
        assert!(decode_aggregates(Bytes::from(bytes))?.is_empty());
        Ok(())
    }

    #[test]
    fn wrong_table_is_reported_as_corrupt() -> Result<(), Box<dyn std::error::Error>> {
        let aggs = vec![WindowAggregate {
            entity: "P1".to_string(),
            window_start: key(1),
            window_end: key(2),
            anchor: key(2),
            mean: 3.0,
            sentiment_mean: 0.0,
            count: 2,
            partial: false,
        }];
        let bytes = encode_aggregates(&aggs)?;
        let err = decode_records(Bytes::from(bytes)).expect_err("schema mismatch");
        assert!(matches!(err, StoreError::CorruptSnapshot { .. }));
        Ok(())
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = decode_records(Bytes::from_static(b"not parquet")).expect_err("garbage");
        assert!(matches!(err, StoreError::ParquetRead { .. }));
    }
}
