//! Parquet-on-disk store.
//!
//! Layout under the store root:
//!
//! ```text
//! CURRENT                 # version of the published snapshot, e.g. "3\n"
//! _build.lock             # present while a build holds the lock
//! _staging/0000000004/    # snapshot being written, invisible to readers
//! snapshots/0000000003/
//!   manifest.json
//!   records.parquet
//!   aggregates.parquet
//! ```
//!
//! A staged directory is renamed into `snapshots/` and then `CURRENT` is
//! replaced atomically; readers only follow `CURRENT`, so a build that dies
//! at any point leaves the previous snapshot authoritative.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use snafu::prelude::*;

use crate::{
    model::{CleanRecord, WindowAggregate},
    storage::{self, StorageError, StoreLocation},
    store::{
        BuildLock, CorruptSnapshotSnafu, LockedSnafu, ManifestSnafu, SnapshotManifest,
        StagingSnapshot, StorageSnafu, StoreBackend, StoreContents, StoreError, codec,
        holder_id, prune_candidates,
    },
};

const CURRENT: &str = "CURRENT";
const LOCK_FILE: &str = "_build.lock";
const STAGING_DIR: &str = "_staging";
const SNAPSHOTS_DIR: &str = "snapshots";
const MANIFEST_FILE: &str = "manifest.json";
const RECORDS_FILE: &str = "records.parquet";
const AGGREGATES_FILE: &str = "aggregates.parquet";

fn version_dir(version: u64) -> String {
    format!("{version:010}")
}

fn staging_path(version: u64) -> PathBuf {
    Path::new(STAGING_DIR).join(version_dir(version))
}

fn snapshot_path(version: u64) -> PathBuf {
    Path::new(SNAPSHOTS_DIR).join(version_dir(version))
}

/// Store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    location: StoreLocation,
}

impl LocalStore {
    /// Store rooted at `root`. Nothing is created until the first build.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            location: StoreLocation::local(root),
        }
    }

    /// Versions present under `snapshots/`, ascending.
    pub async fn snapshot_versions(&self) -> Result<Vec<u64>, StoreError> {
        let names = storage::list_dir(&self.location, Path::new(SNAPSHOTS_DIR))
            .await
            .context(StorageSnafu)?;
        Ok(names.iter().filter_map(|n| n.parse::<u64>().ok()).collect())
    }

    async fn write_staged(
        &self,
        staging: &StagingSnapshot,
        file: &str,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        let rel = staging_path(staging.version()).join(file);
        storage::write_file(&self.location, &rel, bytes)
            .await
            .context(StorageSnafu)?;
        debug!("wrote {} ({} bytes)", rel.display(), bytes.len());
        Ok(())
    }

    async fn read_snapshot_file(&self, version: u64, file: &str) -> Result<Vec<u8>, StoreError> {
        storage::read_all_bytes(&self.location, &snapshot_path(version).join(file))
            .await
            .context(StorageSnafu)
    }
}

#[async_trait]
impl StoreBackend for LocalStore {
    fn describe(&self) -> String {
        format!("local store at {}", self.location)
    }

    async fn acquire_build_lock(&self) -> Result<BuildLock, StoreError> {
        let holder = holder_id();
        let rel = Path::new(LOCK_FILE);
        match storage::write_new(&self.location, rel, holder.as_bytes()).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists { .. }) => {
                let existing = storage::read_to_string(&self.location, rel)
                    .await
                    .unwrap_or_else(|_| "an unknown process".to_string());
                return LockedSnafu {
                    holder: existing.trim(),
                }
                .fail();
            }
            Err(source) => return Err(source).context(StorageSnafu),
        }

        let abs = self.location.resolve(rel);
        Ok(BuildLock::new(holder, move || {
            if let Err(e) = std::fs::remove_file(&abs)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("failed to release build lock {}: {e}", abs.display());
            }
        }))
    }

    async fn current_version(&self) -> Result<Option<u64>, StoreError> {
        let text = match storage::read_to_string(&self.location, Path::new(CURRENT)).await {
            Ok(text) => text,
            Err(StorageError::NotFound { .. }) => return Ok(None),
            Err(source) => return Err(source).context(StorageSnafu),
        };
        let version = text.trim().parse::<u64>().ok().with_context(|| {
            CorruptSnapshotSnafu {
                version: 0u64,
                msg: format!("CURRENT holds {:?}", text.trim()),
            }
        })?;
        Ok(Some(version))
    }

    async fn begin_snapshot(&self, _lock: &BuildLock) -> Result<StagingSnapshot, StoreError> {
        // Leftovers of a build that died before publishing.
        storage::remove_dir_all(&self.location, Path::new(STAGING_DIR))
            .await
            .context(StorageSnafu)?;

        let current = self.current_version().await?.unwrap_or(0);
        let highest = self.snapshot_versions().await?.last().copied().unwrap_or(0);
        let version = current.max(highest) + 1;

        storage::create_dir_all(&self.location, &staging_path(version))
            .await
            .context(StorageSnafu)?;
        debug!("staging snapshot {version} in {}", self.location);
        Ok(StagingSnapshot::new(version))
    }

    async fn write_records(
        &self,
        staging: &StagingSnapshot,
        records: &[CleanRecord],
    ) -> Result<(), StoreError> {
        let bytes = codec::encode_records(records)?;
        self.write_staged(staging, RECORDS_FILE, &bytes).await
    }

    async fn write_aggregates(
        &self,
        staging: &StagingSnapshot,
        aggregates: &[WindowAggregate],
    ) -> Result<(), StoreError> {
        let bytes = codec::encode_aggregates(aggregates)?;
        self.write_staged(staging, AGGREGATES_FILE, &bytes).await
    }

    async fn write_manifest(
        &self,
        staging: &StagingSnapshot,
        manifest: &SnapshotManifest,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(manifest).context(ManifestSnafu)?;
        self.write_staged(staging, MANIFEST_FILE, &bytes).await
    }

    async fn publish(&self, staging: StagingSnapshot) -> Result<u64, StoreError> {
        let version = staging.version();
        storage::create_dir_all(&self.location, Path::new(SNAPSHOTS_DIR))
            .await
            .context(StorageSnafu)?;
        storage::rename(
            &self.location,
            &staging_path(version),
            &snapshot_path(version),
        )
        .await
        .context(StorageSnafu)?;
        storage::write_atomic(
            &self.location,
            Path::new(CURRENT),
            format!("{version}\n").as_bytes(),
        )
        .await
        .context(StorageSnafu)?;
        info!("published snapshot {version} in {}", self.location);

        // Only one snapshot is ever staged under the lock.
        if let Err(e) = storage::remove_dir_all(&self.location, Path::new(STAGING_DIR)).await {
            warn!("failed to remove {STAGING_DIR} after publishing {version}: {e}");
        }
        Ok(version)
    }

    async fn discard(&self, staging: StagingSnapshot) -> Result<(), StoreError> {
        debug!("discarding staged snapshot {}", staging.version());
        storage::remove_dir_all(&self.location, Path::new(STAGING_DIR))
            .await
            .context(StorageSnafu)
    }

    async fn prune(&self, _lock: &BuildLock, keep_previous: usize) -> Result<Vec<u64>, StoreError> {
        let Some(current) = self.current_version().await? else {
            return Ok(Vec::new());
        };
        let doomed = prune_candidates(self.snapshot_versions().await?, current, keep_previous);
        for version in &doomed {
            storage::remove_dir_all(&self.location, &snapshot_path(*version))
                .await
                .context(StorageSnafu)?;
            debug!("pruned snapshot {version}");
        }
        Ok(doomed)
    }

    async fn load_current(&self) -> Result<Option<StoreContents>, StoreError> {
        let Some(version) = self.current_version().await? else {
            return Ok(None);
        };

        let manifest_bytes = self.read_snapshot_file(version, MANIFEST_FILE).await?;
        let manifest: SnapshotManifest =
            serde_json::from_slice(&manifest_bytes).context(ManifestSnafu)?;
        ensure!(
            manifest.version == version,
            CorruptSnapshotSnafu {
                version,
                msg: format!("manifest claims version {}", manifest.version),
            }
        );

        let records = codec::decode_records(Bytes::from(
            self.read_snapshot_file(version, RECORDS_FILE).await?,
        ))?;
        let aggregates = codec::decode_aggregates(Bytes::from(
            self.read_snapshot_file(version, AGGREGATES_FILE).await?,
        ))?;
        manifest.check_counts(&records, &aggregates)?;

        debug!(
            "loaded snapshot {version}: {} records, {} aggregates",
            records.len(),
            aggregates.len()
        );
        Ok(Some(StoreContents {
            manifest,
            records,
            aggregates,
        }))
    }
}
