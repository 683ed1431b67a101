//! Store writer: persists one build as a new snapshot and swaps it in.
//!
//! The writer only talks to a [`StoreBackend`]; it never touches paths. It
//! guarantees that either the new snapshot becomes current or the previous
//! one stays current, and that two builds never overlap.

use std::sync::Arc;

use log::{info, warn};
use snafu::prelude::*;

use crate::{
    config::WindowConfig,
    error::ErrorKind,
    model::{CleanRecord, WindowAggregate},
    store::{BuildLock, SnapshotManifest, StagingSnapshot, StoreBackend, StoreError},
};

/// Errors from [`StoreWriter`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WriteError {
    /// Another build holds the build lock.
    #[snafu(display("A build is already in progress ({holder})"))]
    BuildInProgress {
        /// Holder reported by the backend.
        holder: String,
    },

    /// The store failed while writing; the previous snapshot is untouched.
    #[snafu(display("Store write failed during {stage}: {source}"))]
    Write {
        /// Step that failed.
        stage: &'static str,
        /// Underlying store error.
        #[snafu(source(from(StoreError, Box::new)))]
        source: Box<StoreError>,
    },
}

impl WriteError {
    /// Machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WriteError::BuildInProgress { .. } => ErrorKind::BuildInProgress,
            WriteError::Write { .. } => ErrorKind::WriteError,
        }
    }
}

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Version now current.
    pub version: u64,
    /// Superseded versions removed afterwards.
    pub pruned: Vec<u64>,
}

/// Writes snapshots to a backend.
#[derive(Debug, Clone)]
pub struct StoreWriter {
    backend: Arc<dyn StoreBackend>,
    retain_snapshots: usize,
}

impl StoreWriter {
    /// Writer keeping `retain_snapshots` superseded snapshots after each swap.
    pub fn new(backend: Arc<dyn StoreBackend>, retain_snapshots: usize) -> Self {
        Self {
            backend,
            retain_snapshots,
        }
    }

    /// Backend this writer publishes to.
    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    /// Take the exclusive build lock, failing fast when it is held.
    pub async fn acquire(&self) -> Result<BuildLock, WriteError> {
        match self.backend.acquire_build_lock().await {
            Ok(lock) => Ok(lock),
            Err(StoreError::Locked { holder }) => BuildInProgressSnafu { holder }.fail(),
            Err(source) => Err(source).context(WriteSnafu { stage: "lock" }),
        }
    }

    /// Acquire the lock and write one snapshot.
    pub async fn write(
        &self,
        records: &[CleanRecord],
        aggregates: &[WindowAggregate],
        window: WindowConfig,
    ) -> Result<WriteOutcome, WriteError> {
        let lock = self.acquire().await?;
        self.write_snapshot(&lock, records, aggregates, window).await
    }

    /// Write one snapshot under a lock the caller already holds.
    pub async fn write_snapshot(
        &self,
        lock: &BuildLock,
        records: &[CleanRecord],
        aggregates: &[WindowAggregate],
        window: WindowConfig,
    ) -> Result<WriteOutcome, WriteError> {
        let staging = self
            .backend
            .begin_snapshot(lock)
            .await
            .context(WriteSnafu { stage: "begin" })?;
        let manifest = SnapshotManifest::describe(staging.version(), records, aggregates, window);

        if let Err(e) = self.stage(&staging, records, aggregates, &manifest).await {
            let version = staging.version();
            if let Err(discard) = self.backend.discard(staging).await {
                warn!("failed to discard staged snapshot {version}: {discard}");
            }
            return Err(e);
        }

        let version = self
            .backend
            .publish(staging)
            .await
            .context(WriteSnafu { stage: "publish" })?;
        info!(
            "snapshot {version} is current ({} records, {} aggregates, {} entities)",
            manifest.record_count, manifest.aggregate_count, manifest.entity_count
        );

        let pruned = match self.backend.prune(lock, self.retain_snapshots).await {
            Ok(pruned) => pruned,
            Err(e) => {
                warn!("pruning old snapshots failed: {e}");
                Vec::new()
            }
        };

        Ok(WriteOutcome { version, pruned })
    }

    async fn stage(
        &self,
        staging: &StagingSnapshot,
        records: &[CleanRecord],
        aggregates: &[WindowAggregate],
        manifest: &SnapshotManifest,
    ) -> Result<(), WriteError> {
        self.backend
            .write_records(staging, records)
            .await
            .context(WriteSnafu { stage: "records" })?;
        self.backend
            .write_aggregates(staging, aggregates)
            .await
            .context(WriteSnafu { stage: "aggregates" })?;
        self.backend
            .write_manifest(staging, manifest)
            .await
            .context(WriteSnafu { stage: "manifest" })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::TimeKey,
        store::memory::{FailPoint, MemoryStore},
    };

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn record(secs: i64) -> CleanRecord {
        CleanRecord {
            entity: "A".to_string(),
            ts: TimeKey::from_secs(secs).expect("key"),
            rating: 4.0,
            rating_imputed: false,
            ingest_seq: secs as u64,
            review_id: String::new(),
            name: "A".to_string(),
            reviewer: String::new(),
            text: String::new(),
            sentiment: 0.0,
        }
    }

    #[tokio::test]
    async fn every_failing_step_keeps_previous_snapshot() -> TestResult {
        for point in [
            FailPoint::BeginSnapshot,
            FailPoint::WriteRecords,
            FailPoint::WriteAggregates,
            FailPoint::WriteManifest,
            FailPoint::Publish,
        ] {
            let store = Arc::new(MemoryStore::new());
            let writer = StoreWriter::new(store.clone(), 1);
            writer
                .write(&[record(1)], &[], WindowConfig::default())
                .await?;

            store.fail_on(point);
            let err = writer
                .write(&[record(1), record(2)], &[], WindowConfig::default())
                .await
                .expect_err("injected failure");
            assert_eq!(err.kind(), ErrorKind::WriteError, "{point:?}");
            assert_eq!(store.staged_count(), 0, "{point:?}");

            let current = store.load_current().await?.expect("v1 still current");
            assert_eq!(current.manifest.version, 1);
            assert_eq!(current.records.len(), 1);
        }
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_build_is_rejected() -> TestResult {
        let store = Arc::new(MemoryStore::new());
        let writer = StoreWriter::new(store, 1);
        let _held = writer.acquire().await?;

        let err = writer
            .write(&[record(1)], &[], WindowConfig::default())
            .await
            .expect_err("lock held");
        assert!(matches!(err, WriteError::BuildInProgress { .. }));
        assert!(err.kind().is_retryable());
        Ok(())
    }

    #[tokio::test]
    async fn old_snapshots_are_pruned_after_swap() -> TestResult {
        let store = Arc::new(MemoryStore::new());
        let writer = StoreWriter::new(store.clone(), 1);
        for _ in 0..3 {
            writer
                .write(&[record(1)], &[], WindowConfig::default())
                .await?;
        }
        let outcome = writer
            .write(&[record(1)], &[], WindowConfig::default())
            .await?;
        assert_eq!(outcome.version, 4);
        assert_eq!(outcome.pruned, vec![2]);
        assert_eq!(store.snapshot_versions(), vec![3, 4]);
        Ok(())
    }
}
