//! Snapshot store capability and its backends.
//!
//! A store holds immutable, versioned snapshots of one build's clean records
//! and window aggregates. Exactly one snapshot is *current*; readers only
//! ever load the current one. A build goes through:
//!
//! 1. [`StoreBackend::acquire_build_lock`] (fails fast with
//!    [`StoreError::Locked`] when another build holds it),
//! 2. [`StoreBackend::begin_snapshot`] to stage a new version nobody can see,
//! 3. the `write_*` calls,
//! 4. [`StoreBackend::publish`], the single atomic step that makes the
//!    staged version current, or [`StoreBackend::discard`] on failure.
//!
//! [`local::LocalStore`] keeps snapshots as Parquet files behind a `CURRENT`
//! pointer file; [`memory::MemoryStore`] is an in-process fake with failure
//! injection for tests.

pub mod codec;
pub mod local;
pub mod memory;

use std::fmt;

use arrow::error::ArrowError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parquet::errors::ParquetError;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    config::WindowConfig,
    error::ErrorKind,
    model::{CleanRecord, WindowAggregate},
    storage::StorageError,
};

/// Version of the on-disk snapshot layout written into every manifest.
pub const FORMAT_VERSION: u32 = 1;

/// Errors raised by store backends.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// Filesystem failure.
    #[snafu(display("Storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(source, backtrace)]
        source: StorageError,
    },

    /// Encoding a table to Parquet failed.
    #[snafu(display("Failed to write Parquet table {table}: {source}"))]
    ParquetWrite {
        /// Logical table name (`records` or `aggregates`).
        table: &'static str,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Decoding a Parquet table failed.
    #[snafu(display("Failed to read Parquet table {table}: {source}"))]
    ParquetRead {
        /// Logical table name.
        table: &'static str,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Building or reading an Arrow batch failed.
    #[snafu(display("Arrow error in table {table}: {source}"))]
    Arrow {
        /// Logical table name.
        table: &'static str,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// The manifest could not be encoded or decoded.
    #[snafu(display("Invalid snapshot manifest: {source}"))]
    Manifest {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// Snapshot content is inconsistent with itself or its manifest.
    #[snafu(display("Corrupt snapshot {version}: {msg}"))]
    CorruptSnapshot {
        /// Version being read (0 when unknown).
        version: u64,
        /// What is wrong.
        msg: String,
    },

    /// Another build holds the exclusive build lock.
    #[snafu(display("Build lock is held by {holder}"))]
    Locked {
        /// Description of the current holder.
        holder: String,
    },

    /// Failure injected by [`memory::MemoryStore`].
    #[snafu(display("Injected failure at {point:?}"))]
    Injected {
        /// Step that was made to fail.
        point: memory::FailPoint,
    },
}

impl StoreError {
    /// Whether this is lock contention rather than a medium failure.
    pub fn is_locked(&self) -> bool {
        matches!(self, StoreError::Locked { .. })
    }

    /// Machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Locked { .. } => ErrorKind::BuildInProgress,
            _ => ErrorKind::StoreError,
        }
    }
}

/// Metadata stored alongside each snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Layout version, see [`FORMAT_VERSION`].
    pub format_version: u32,
    /// Snapshot version.
    pub version: u64,
    /// When the build produced this snapshot.
    pub created_at: DateTime<Utc>,
    /// Number of clean records.
    pub record_count: u64,
    /// Number of window aggregates.
    pub aggregate_count: u64,
    /// Number of distinct entities.
    pub entity_count: u64,
    /// Window settings the aggregates were computed with.
    pub window: WindowConfig,
}

impl SnapshotManifest {
    /// Manifest for `version` describing the given contents.
    pub fn describe(
        version: u64,
        records: &[CleanRecord],
        aggregates: &[WindowAggregate],
        window: WindowConfig,
    ) -> Self {
        let entity_count = records
            .chunk_by(|a, b| a.entity == b.entity)
            .count() as u64;
        Self {
            format_version: FORMAT_VERSION,
            version,
            created_at: Utc::now(),
            record_count: records.len() as u64,
            aggregate_count: aggregates.len() as u64,
            entity_count,
            window,
        }
    }

    /// Check that decoded tables match the counts recorded at write time.
    pub fn check_counts(
        &self,
        records: &[CleanRecord],
        aggregates: &[WindowAggregate],
    ) -> Result<(), StoreError> {
        ensure!(
            self.record_count == records.len() as u64
                && self.aggregate_count == aggregates.len() as u64,
            CorruptSnapshotSnafu {
                version: self.version,
                msg: format!(
                    "manifest lists {} records / {} aggregates, found {} / {}",
                    self.record_count,
                    self.aggregate_count,
                    records.len(),
                    aggregates.len()
                ),
            }
        );
        Ok(())
    }
}

/// Everything a reader needs from one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreContents {
    /// Snapshot metadata.
    pub manifest: SnapshotManifest,
    /// Clean records sorted by `(entity, ts)`.
    pub records: Vec<CleanRecord>,
    /// Window aggregates sorted by `(entity, anchor)`.
    pub aggregates: Vec<WindowAggregate>,
}

/// A staged, not yet visible snapshot.
#[derive(Debug, PartialEq, Eq)]
pub struct StagingSnapshot {
    version: u64,
}

impl StagingSnapshot {
    pub(crate) fn new(version: u64) -> Self {
        Self { version }
    }

    /// Version this snapshot will have once published.
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Exclusive right to build. Released when dropped.
pub struct BuildLock {
    holder: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl BuildLock {
    pub(crate) fn new(holder: String, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            holder,
            release: Some(Box::new(release)),
        }
    }

    /// Description of this lock holder.
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl fmt::Debug for BuildLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildLock")
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// String identifying this process as a lock holder.
pub(crate) fn holder_id() -> String {
    format!("pid {} at {}", std::process::id(), Utc::now().to_rfc3339())
}

/// Persistence capability the writer and the query service are built on.
///
/// Implementations must guarantee that nothing written between
/// `begin_snapshot` and `publish` is visible through `load_current`, and
/// that `publish` switches the current snapshot in one atomic step.
#[async_trait]
pub trait StoreBackend: Send + Sync + fmt::Debug {
    /// Human-readable location for logs and errors.
    fn describe(&self) -> String;

    /// Take the exclusive build lock, or fail with [`StoreError::Locked`].
    async fn acquire_build_lock(&self) -> Result<BuildLock, StoreError>;

    /// Version of the current snapshot, if any was ever published.
    async fn current_version(&self) -> Result<Option<u64>, StoreError>;

    /// Stage a new, empty snapshot with a version above every existing one.
    async fn begin_snapshot(&self, lock: &BuildLock) -> Result<StagingSnapshot, StoreError>;

    /// Write the clean records of a staged snapshot.
    async fn write_records(
        &self,
        staging: &StagingSnapshot,
        records: &[CleanRecord],
    ) -> Result<(), StoreError>;

    /// Write the window aggregates of a staged snapshot.
    async fn write_aggregates(
        &self,
        staging: &StagingSnapshot,
        aggregates: &[WindowAggregate],
    ) -> Result<(), StoreError>;

    /// Write the manifest of a staged snapshot.
    async fn write_manifest(
        &self,
        staging: &StagingSnapshot,
        manifest: &SnapshotManifest,
    ) -> Result<(), StoreError>;

    /// Make a staged snapshot current. Returns its version.
    async fn publish(&self, staging: StagingSnapshot) -> Result<u64, StoreError>;

    /// Drop a staged snapshot.
    async fn discard(&self, staging: StagingSnapshot) -> Result<(), StoreError>;

    /// Delete superseded snapshots, keeping the current one and the
    /// `keep_previous` newest before it. Returns the removed versions.
    async fn prune(&self, lock: &BuildLock, keep_previous: usize) -> Result<Vec<u64>, StoreError>;

    /// Load the current snapshot, or `None` if nothing was published.
    async fn load_current(&self) -> Result<Option<StoreContents>, StoreError>;
}

/// Versions to delete given every stored version and the current one.
pub(crate) fn prune_candidates(
    mut versions: Vec<u64>,
    current: u64,
    keep_previous: usize,
) -> Vec<u64> {
    versions.sort_unstable();
    let older: Vec<u64> = versions.iter().copied().filter(|v| *v < current).collect();
    let keep_from = older.len().saturating_sub(keep_previous);
    let mut doomed: Vec<u64> = older[..keep_from].to_vec();
    // Versions above current are leftovers of a publish that never switched
    // the pointer.
    doomed.extend(versions.iter().copied().filter(|v| *v > current));
    doomed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    #[test]
    fn prune_keeps_current_and_previous() {
        assert_eq!(prune_candidates(vec![1, 2, 3, 4], 4, 1), vec![1, 2]);
        assert_eq!(prune_candidates(vec![4, 3, 2, 1], 4, 0), vec![1, 2, 3]);
        assert_eq!(prune_candidates(vec![1, 2], 2, 5), Vec::<u64>::new());
        assert_eq!(prune_candidates(vec![1, 2, 3], 2, 1), vec![3]);
    }

    #[test]
    fn build_lock_releases_on_drop() {
        let held = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&held);
        let lock = BuildLock::new("test".to_string(), move || {
            flag.store(false, Ordering::SeqCst)
        });
        assert_eq!(lock.holder(), "test");
        drop(lock);
        assert!(!held.load(Ordering::SeqCst));
    }

    #[test]
    fn locked_maps_to_build_in_progress() {
        let err = StoreError::Locked {
            holder: "pid 1".to_string(),
        };
        assert!(err.is_locked());
        assert_eq!(err.kind(), ErrorKind::BuildInProgress);
    }
}
