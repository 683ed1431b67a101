//! Build report: what one pipeline run did and how long each stage took.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::normalize::{QualityReport, RejectionReport};

/// Timing of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildStep {
    /// Stage name (`read`, `normalize`, `aggregate`, `write`).
    pub name: String,
    /// Elapsed wall time in milliseconds.
    pub elapsed_ms: u128,
    /// Counters captured during the stage.
    pub fields: Vec<(String, String)>,
}

/// Outcome of a successful build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildReport {
    /// Version of the snapshot the build published.
    pub snapshot_version: u64,
    /// Superseded snapshots removed after publishing.
    pub pruned: Vec<u64>,
    /// Data quality of the raw input.
    pub quality: QualityReport,
    /// Normalizer outcome.
    pub rejections: RejectionReport,
    /// Number of distinct entities stored.
    pub entity_count: u64,
    /// Number of window aggregates stored.
    pub aggregate_count: u64,
    /// Per-stage timings.
    pub steps: Vec<BuildStep>,
    /// Total wall time in milliseconds.
    pub total_ms: u128,
}

/// Collects stage timings while a build runs.
#[derive(Debug)]
pub(crate) struct BuildReportBuilder {
    start: Instant,
    steps: Vec<BuildStep>,
}

impl BuildReportBuilder {
    pub(crate) fn new() -> Self {
        Self {
            start: Instant::now(),
            steps: Vec::new(),
        }
    }

    pub(crate) fn push_step<I>(&mut self, name: &str, elapsed: Duration, fields: I)
    where
        I: IntoIterator<Item = (&'static str, String)>,
    {
        self.steps.push(BuildStep {
            name: name.to_string(),
            elapsed_ms: elapsed.as_millis(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        });
    }

    /// Time `f` and record it as a step with the fields it returns.
    pub(crate) fn timed<T>(
        &mut self,
        name: &str,
        f: impl FnOnce() -> (T, Vec<(&'static str, String)>),
    ) -> T {
        let started = Instant::now();
        let (value, fields) = f();
        self.push_step(name, started.elapsed(), fields);
        value
    }

    pub(crate) fn finish(
        self,
        snapshot_version: u64,
        pruned: Vec<u64>,
        quality: QualityReport,
        rejections: RejectionReport,
        entity_count: u64,
        aggregate_count: u64,
    ) -> BuildReport {
        BuildReport {
            snapshot_version,
            pruned,
            quality,
            rejections,
            entity_count,
            aggregate_count,
            steps: self.steps,
            total_ms: self.start.elapsed().as_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_keep_order_and_fields() {
        let mut b = BuildReportBuilder::new();
        let n = b.timed("normalize", || (3, vec![("cleaned", "3".to_string())]));
        b.push_step("write", Duration::from_millis(2), [("version", "1".to_string())]);
        let report = b.finish(
            1,
            Vec::new(),
            QualityReport::default(),
            RejectionReport::default(),
            1,
            3,
        );

        assert_eq!(n, 3);
        let names: Vec<_> = report.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["normalize", "write"]);
        assert_eq!(report.steps[1].elapsed_ms, 2);
        assert_eq!(
            report.steps[0].fields,
            vec![("cleaned".to_string(), "3".to_string())]
        );
    }
}
