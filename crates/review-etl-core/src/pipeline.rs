//! One-shot build: input file → normalizer → aggregator → store writer.
//!
//! The build lock is taken before the input is read, so a second build fails
//! fast with `BuildInProgress` instead of doing all the work first. Nothing
//! is written to the store unless every stage before the writer succeeded.

pub mod report;

use std::{sync::Arc, time::Instant};

use log::{info, warn};
use snafu::prelude::*;

use crate::{
    aggregate::{AggregateError, aggregate},
    config::{ConfigError, PipelineConfig},
    error::ErrorKind,
    ingest::{IngestError, read_input},
    model::RawRow,
    normalize::{assess_quality, normalize},
    store::{BuildLock, StoreBackend},
    writer::{StoreWriter, WriteError},
};

pub use report::{BuildReport, BuildStep};
use report::BuildReportBuilder;

/// Errors that abort a build.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PipelineError {
    /// Configuration rejected before anything ran.
    #[snafu(display("Invalid configuration: {source}"))]
    Config {
        /// Underlying configuration error.
        source: ConfigError,
    },

    /// The input file could not be read.
    #[snafu(display("Input error: {source}"))]
    Ingest {
        /// Underlying input error.
        source: IngestError,
    },

    /// Aggregation rejected the normalized records.
    #[snafu(display("Aggregation failed: {source}"))]
    Aggregate {
        /// Underlying aggregation error.
        source: AggregateError,
    },

    /// The store could not be written or is locked.
    #[snafu(display("{source}"))]
    Write {
        /// Underlying writer error.
        source: WriteError,
    },
}

impl PipelineError {
    /// Machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Config { source } => source.kind(),
            PipelineError::Ingest { source } => source.kind(),
            PipelineError::Aggregate { .. } => ErrorKind::ConfigError,
            PipelineError::Write { source } => source.kind(),
        }
    }
}

/// Run a full build described by `config` against `backend`.
pub async fn run_build(
    config: &PipelineConfig,
    backend: Arc<dyn StoreBackend>,
) -> Result<BuildReport, PipelineError> {
    config.validate().context(ConfigSnafu)?;
    let writer = StoreWriter::new(backend, config.retain_snapshots);
    let lock = writer.acquire().await.context(WriteSnafu)?;
    info!(
        "build started: {} -> {}",
        config.input.path.display(),
        writer.backend().describe()
    );

    let mut steps = BuildReportBuilder::new();
    let started = Instant::now();
    let batch = read_input(&config.input).await.context(IngestSnafu)?;
    steps.push_step(
        "read",
        started.elapsed(),
        [
            ("rows", batch.rows.len().to_string()),
            ("malformed", batch.malformed_count().to_string()),
        ],
    );

    build_locked(config, &writer, &lock, batch.rows, steps).await
}

/// Run the stages after reading, on rows already in memory.
pub async fn build_from_rows(
    config: &PipelineConfig,
    backend: Arc<dyn StoreBackend>,
    rows: Vec<RawRow>,
) -> Result<BuildReport, PipelineError> {
    config.validate().context(ConfigSnafu)?;
    let writer = StoreWriter::new(backend, config.retain_snapshots);
    let lock = writer.acquire().await.context(WriteSnafu)?;
    build_locked(config, &writer, &lock, rows, BuildReportBuilder::new()).await
}

async fn build_locked(
    config: &PipelineConfig,
    writer: &StoreWriter,
    lock: &BuildLock,
    rows: Vec<RawRow>,
    mut steps: BuildReportBuilder,
) -> Result<BuildReport, PipelineError> {
    let quality = assess_quality(&rows);
    info!(
        "input quality: {} rows, {} malformed, {} invalid ratings, {} invalid timestamps, {} duplicate keys",
        quality.total_rows,
        quality.malformed_rows,
        quality.invalid_ratings,
        quality.invalid_timestamps,
        quality.duplicate_keys
    );

    let normalized = steps.timed("normalize", || {
        let out = normalize(rows, &config.normalize());
        let fields = vec![
            ("cleaned", out.report.cleaned.to_string()),
            ("rejected", out.report.rejected.to_string()),
            ("duplicates", out.report.duplicates.to_string()),
            ("duplicate_review_ids", out.report.duplicate_review_ids.to_string()),
            ("imputed", out.report.imputed.to_string()),
        ];
        (out, fields)
    });
    let rejections = normalized.report;
    if rejections.rejected > 0 {
        warn!(
            "rejected {} of {} rows: {:?}",
            rejections.rejected, rejections.total_rows, rejections.rejected_by_reason
        );
    }
    if rejections.duplicates > 0 {
        warn!(
            "discarded {} duplicate rows ({:?})",
            rejections.duplicates, config.duplicates
        );
    }

    let records = normalized.records;
    let aggregates = steps
        .timed("aggregate", || {
            let out = aggregate(&records, &config.window);
            let count = out.as_ref().map(Vec::len).unwrap_or(0);
            (out, vec![("windows", count.to_string())])
        })
        .context(AggregateSnafu)?;

    let started = Instant::now();
    let outcome = writer
        .write_snapshot(lock, &records, &aggregates, config.window)
        .await
        .context(WriteSnafu)?;
    steps.push_step(
        "write",
        started.elapsed(),
        [
            ("version", outcome.version.to_string()),
            ("pruned", outcome.pruned.len().to_string()),
        ],
    );

    let entity_count = records.chunk_by(|a, b| a.entity == b.entity).count() as u64;
    let report = steps.finish(
        outcome.version,
        outcome.pruned,
        quality,
        rejections,
        entity_count,
        aggregates.len() as u64,
    );
    info!(
        "build finished: snapshot {} with {} records, {} entities, {} windows in {} ms",
        report.snapshot_version,
        records.len(),
        report.entity_count,
        report.aggregate_count,
        report.total_ms
    );
    Ok(report)
}
