//! In-process store used by tests and by callers that do not need
//! durability. Can be told to fail a chosen step once, which is how the
//! "failed rebuild keeps the previous snapshot" behaviour is exercised
//! without touching a real medium.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use snafu::prelude::*;

use crate::{
    model::{CleanRecord, WindowAggregate},
    store::{
        BuildLock, CorruptSnapshotSnafu, InjectedSnafu, LockedSnafu, SnapshotManifest,
        StagingSnapshot, StoreBackend, StoreContents, StoreError, holder_id, prune_candidates,
    },
};

/// Step of a build that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPoint {
    /// [`StoreBackend::begin_snapshot`].
    BeginSnapshot,
    /// [`StoreBackend::write_records`].
    WriteRecords,
    /// [`StoreBackend::write_aggregates`].
    WriteAggregates,
    /// [`StoreBackend::write_manifest`].
    WriteManifest,
    /// [`StoreBackend::publish`].
    Publish,
}

#[derive(Debug, Default)]
struct Staged {
    records: Option<Vec<CleanRecord>>,
    aggregates: Option<Vec<WindowAggregate>>,
    manifest: Option<SnapshotManifest>,
}

#[derive(Debug, Default)]
struct Inner {
    current: Option<u64>,
    snapshots: BTreeMap<u64, Arc<StoreContents>>,
    staging: BTreeMap<u64, Staged>,
    fail_on: Option<FailPoint>,
}

/// Store that keeps snapshots in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    locked: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to `point` fail with [`StoreError::Injected`].
    pub fn fail_on(&self, point: FailPoint) {
        self.inner.lock().fail_on = Some(point);
    }

    /// Versions currently held, ascending.
    pub fn snapshot_versions(&self) -> Vec<u64> {
        self.inner.lock().snapshots.keys().copied().collect()
    }

    /// Number of staged, unpublished snapshots.
    pub fn staged_count(&self) -> usize {
        self.inner.lock().staging.len()
    }

    fn trip(inner: &mut Inner, point: FailPoint) -> Result<(), StoreError> {
        if inner.fail_on == Some(point) {
            inner.fail_on = None;
            return InjectedSnafu { point }.fail();
        }
        Ok(())
    }

    fn with_staged<F>(
        &self,
        staging: &StagingSnapshot,
        point: FailPoint,
        f: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Staged),
    {
        let mut inner = self.inner.lock();
        Self::trip(&mut inner, point)?;
        let version = staging.version();
        let staged = inner.staging.get_mut(&version).with_context(|| CorruptSnapshotSnafu {
            version,
            msg: "snapshot is not staged",
        })?;
        f(staged);
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    fn describe(&self) -> String {
        "in-memory store".to_string()
    }

    async fn acquire_build_lock(&self) -> Result<BuildLock, StoreError> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return LockedSnafu {
                holder: "another build in this process",
            }
            .fail();
        }
        let flag = Arc::clone(&self.locked);
        Ok(BuildLock::new(holder_id(), move || {
            flag.store(false, Ordering::Release)
        }))
    }

    async fn current_version(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.inner.lock().current)
    }

    async fn begin_snapshot(&self, _lock: &BuildLock) -> Result<StagingSnapshot, StoreError> {
        let mut inner = self.inner.lock();
        Self::trip(&mut inner, FailPoint::BeginSnapshot)?;
        inner.staging.clear();
        let highest = inner.snapshots.keys().next_back().copied().unwrap_or(0);
        let version = inner.current.unwrap_or(0).max(highest) + 1;
        inner.staging.insert(version, Staged::default());
        Ok(StagingSnapshot::new(version))
    }

    async fn write_records(
        &self,
        staging: &StagingSnapshot,
        records: &[CleanRecord],
    ) -> Result<(), StoreError> {
        self.with_staged(staging, FailPoint::WriteRecords, |s| {
            s.records = Some(records.to_vec())
        })
    }

    async fn write_aggregates(
        &self,
        staging: &StagingSnapshot,
        aggregates: &[WindowAggregate],
    ) -> Result<(), StoreError> {
        self.with_staged(staging, FailPoint::WriteAggregates, |s| {
            s.aggregates = Some(aggregates.to_vec())
        })
    }

    async fn write_manifest(
        &self,
        staging: &StagingSnapshot,
        manifest: &SnapshotManifest,
    ) -> Result<(), StoreError> {
        self.with_staged(staging, FailPoint::WriteManifest, |s| {
            s.manifest = Some(manifest.clone())
        })
    }

    async fn publish(&self, staging: StagingSnapshot) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let version = staging.version();
        let staged = inner.staging.remove(&version);
        Self::trip(&mut inner, FailPoint::Publish)?;
        let Some(Staged {
            records: Some(records),
            aggregates: Some(aggregates),
            manifest: Some(manifest),
        }) = staged
        else {
            return CorruptSnapshotSnafu {
                version,
                msg: "staged snapshot is incomplete",
            }
            .fail();
        };
        manifest.check_counts(&records, &aggregates)?;
        inner.snapshots.insert(
            version,
            Arc::new(StoreContents {
                manifest,
                records,
                aggregates,
            }),
        );
        inner.current = Some(version);
        Ok(version)
    }

    async fn discard(&self, staging: StagingSnapshot) -> Result<(), StoreError> {
        self.inner.lock().staging.remove(&staging.version());
        Ok(())
    }

    async fn prune(&self, _lock: &BuildLock, keep_previous: usize) -> Result<Vec<u64>, StoreError> {
        let mut inner = self.inner.lock();
        let Some(current) = inner.current else {
            return Ok(Vec::new());
        };
        let versions = inner.snapshots.keys().copied().collect();
        let doomed = prune_candidates(versions, current, keep_previous);
        for version in &doomed {
            inner.snapshots.remove(version);
        }
        Ok(doomed)
    }

    async fn load_current(&self) -> Result<Option<StoreContents>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .current
            .and_then(|v| inner.snapshots.get(&v))
            .map(|c| c.as_ref().clone()))
    }
}
