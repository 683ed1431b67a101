//! Read-only query service over the current snapshot.
//!
//! [`QueryService::open`] loads the current snapshot into an immutable,
//! per-entity index behind an `Arc`. Every query clones that `Arc` first and
//! works on it alone, so a concurrent [`QueryService::refresh`] never changes
//! the data a request is halfway through reading.

pub mod filter;

use std::{collections::BTreeMap, ops::Bound, sync::Arc};

use chrono::{DateTime, Utc};
use log::info;
use parking_lot::RwLock;
use serde::Serialize;
use snafu::prelude::*;

use crate::{
    config::WindowConfig,
    error::ErrorKind,
    model::{CleanRecord, TimeKey, WindowAggregate},
    store::{StoreBackend, StoreContents, StoreError},
};

pub use filter::{EntityFilter, Page, PageRequest, WindowRange};

/// Errors from [`QueryService`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueryError {
    /// No entity with this key in the snapshot.
    #[snafu(display("Entity {key:?} not found"))]
    NotFound {
        /// Requested key.
        key: String,
    },

    /// A query parameter is malformed or out of range.
    #[snafu(display("Invalid {field}: {detail}"))]
    Validation {
        /// Offending parameter.
        field: &'static str,
        /// What is wrong with it.
        detail: String,
    },

    /// The store has never published a snapshot.
    #[snafu(display("No snapshot has been published to {location}"))]
    NoSnapshot {
        /// Backend description.
        location: String,
    },

    /// The store could not be read.
    #[snafu(display("Failed to load snapshot: {source}"))]
    Store {
        /// Underlying store error.
        #[snafu(source(from(StoreError, Box::new)))]
        source: Box<StoreError>,
    },
}

impl QueryError {
    /// Machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::NotFound { .. } => ErrorKind::NotFound,
            QueryError::Validation { .. } => ErrorKind::ValidationError,
            QueryError::NoSnapshot { .. } | QueryError::Store { .. } => ErrorKind::StoreError,
        }
    }
}

/// Per-entity roll-up shown in listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySummary {
    /// Entity key.
    pub entity: String,
    /// Display name from the most recent record.
    pub name: String,
    /// Number of clean records.
    pub record_count: u64,
    /// Mean rating over all records.
    pub mean_rating: f64,
    /// Earliest time key.
    pub first_ts: TimeKey,
    /// Latest time key.
    pub last_ts: TimeKey,
    /// Rating of the latest record.
    pub latest_rating: f64,
    /// Text sentiment of the latest record.
    pub latest_sentiment: f64,
    /// Rolling mean rating of the window anchored at the latest record, if
    /// that window was emitted.
    pub latest_rolling_mean: Option<f64>,
    /// Rolling mean text sentiment of the same window.
    pub latest_rolling_sentiment: Option<f64>,
}

/// Everything stored for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityData {
    /// Roll-up.
    pub summary: EntitySummary,
    /// Records by time key.
    pub records: Vec<CleanRecord>,
    /// Aggregates by anchor.
    pub aggregates: Vec<WindowAggregate>,
}

impl EntityData {
    fn build(records: Vec<CleanRecord>, aggregates: Vec<WindowAggregate>) -> Option<Self> {
        let first = records.first()?;
        let last = records.last()?;
        let mean_rating = records.iter().map(|r| r.rating).sum::<f64>() / records.len() as f64;
        let latest_window = aggregates.iter().rev().find(|a| a.anchor == last.ts);
        let summary = EntitySummary {
            entity: last.entity.clone(),
            name: last.name.clone(),
            record_count: records.len() as u64,
            mean_rating,
            first_ts: first.ts,
            last_ts: last.ts,
            latest_rating: last.rating,
            latest_sentiment: last.sentiment,
            latest_rolling_mean: latest_window.map(|a| a.mean),
            latest_rolling_sentiment: latest_window.map(|a| a.sentiment_mean),
        };
        Some(Self {
            summary,
            records,
            aggregates,
        })
    }
}

/// Latest sentiment figures for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentimentSummary {
    /// Entity key.
    pub product_id: String,
    /// Display name.
    pub product_name: String,
    /// Rating of the most recent review.
    pub latest_sentiment_score: f64,
    /// Rolling mean text sentiment of the window ending at the most recent
    /// review.
    pub rolling_average_sentiment: Option<f64>,
    /// Text polarity of the most recent review.
    pub latest_text_sentiment: f64,
    /// Time key of the most recent review.
    pub as_of: TimeKey,
}

/// Service status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    /// Always `"ok"` while a snapshot is loaded.
    pub status: &'static str,
    /// Version of the pinned snapshot.
    pub snapshot_version: u64,
    /// When that snapshot was built.
    pub built_at: DateTime<Utc>,
    /// Number of entities.
    pub entity_count: usize,
    /// Number of clean records.
    pub record_count: usize,
    /// Number of window aggregates.
    pub aggregate_count: usize,
}

/// Immutable, indexed view of one snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Snapshot version.
    pub version: u64,
    /// Build time.
    pub created_at: DateTime<Utc>,
    /// Window settings of the aggregates.
    pub window: WindowConfig,
    record_count: usize,
    aggregate_count: usize,
    entities: BTreeMap<String, Arc<EntityData>>,
}

impl Snapshot {
    /// Index loaded contents by entity.
    pub fn from_contents(contents: StoreContents) -> Self {
        let StoreContents {
            manifest,
            records,
            aggregates,
        } = contents;
        let record_count = records.len();
        let aggregate_count = aggregates.len();

        let mut grouped: BTreeMap<String, (Vec<CleanRecord>, Vec<WindowAggregate>)> =
            BTreeMap::new();
        for r in records {
            grouped.entry(r.entity.clone()).or_default().0.push(r);
        }
        for a in aggregates {
            grouped.entry(a.entity.clone()).or_default().1.push(a);
        }

        let entities = grouped
            .into_iter()
            .filter_map(|(key, (mut records, mut aggregates))| {
                records.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
                aggregates.sort_by_key(|a| a.anchor);
                EntityData::build(records, aggregates).map(|d| (key, Arc::new(d)))
            })
            .collect();

        Self {
            version: manifest.version,
            created_at: manifest.created_at,
            window: manifest.window,
            record_count,
            aggregate_count,
            entities,
        }
    }

    /// Data of one entity.
    pub fn entity(&self, key: &str) -> Option<&Arc<EntityData>> {
        self.entities.get(key)
    }

    /// Number of entities.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

/// Answers read-only queries against the current snapshot of a store.
#[derive(Debug)]
pub struct QueryService {
    backend: Arc<dyn StoreBackend>,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl QueryService {
    /// Load the current snapshot of `backend`.
    pub async fn open(backend: Arc<dyn StoreBackend>) -> Result<Self, QueryError> {
        let snapshot = Self::load(backend.as_ref()).await?;
        info!(
            "query service opened snapshot {} ({} entities) from {}",
            snapshot.version,
            snapshot.entity_count(),
            backend.describe()
        );
        Ok(Self {
            backend,
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    async fn load(backend: &dyn StoreBackend) -> Result<Snapshot, QueryError> {
        let contents = backend.load_current().await.context(StoreSnafu)?;
        let contents = contents.with_context(|| NoSnapshotSnafu {
            location: backend.describe(),
        })?;
        Ok(Snapshot::from_contents(contents))
    }

    /// The pinned snapshot. Holding the returned `Arc` keeps it alive across
    /// refreshes.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.snapshot.read())
    }

    /// Load the newest published snapshot if it differs from the pinned one.
    /// Returns the version now pinned.
    pub async fn refresh(&self) -> Result<u64, QueryError> {
        let pinned = self.snapshot().version;
        let current = self.backend.current_version().await.context(StoreSnafu)?;
        if current == Some(pinned) {
            return Ok(pinned);
        }
        let fresh = Arc::new(Self::load(self.backend.as_ref()).await?);
        let version = fresh.version;
        *self.snapshot.write() = fresh;
        info!("query service moved from snapshot {pinned} to {version}");
        Ok(version)
    }

    /// Records, aggregates and summary of one entity.
    pub fn get_entity(&self, key: &str) -> Result<Arc<EntityData>, QueryError> {
        self.snapshot()
            .entity(key)
            .cloned()
            .with_context(|| NotFoundSnafu { key })
    }

    /// Entities matching `filter`, in key order, one page at a time.
    pub fn list_entities(
        &self,
        filter: &EntityFilter,
        page: &PageRequest,
    ) -> Result<Page<EntitySummary>, QueryError> {
        ensure!(
            (1..=filter::MAX_PAGE_SIZE).contains(&page.size),
            ValidationSnafu {
                field: "limit",
                detail: format!("page size {} out of range", page.size),
            }
        );

        let snapshot = self.snapshot();
        let lower = match &page.after {
            Some(after) => Bound::Excluded(after.as_str()),
            None => Bound::Unbounded,
        };
        let mut matching = snapshot
            .entities
            .range::<str, _>((lower, Bound::Unbounded))
            .map(|(_, data)| &data.summary)
            .filter(|s| filter.matches(s));

        let items: Vec<EntitySummary> = matching.by_ref().take(page.size).cloned().collect();
        let next_page = match (items.last(), matching.next()) {
            (Some(last), Some(_)) => Some(filter::encode_token(&last.entity)),
            _ => None,
        };
        Ok(Page { items, next_page })
    }

    /// Aggregates of `key` whose window overlaps `range`. Unknown entities
    /// yield an empty list.
    pub fn get_aggregates(&self, key: &str, range: &WindowRange) -> Vec<WindowAggregate> {
        self.snapshot()
            .entity(key)
            .map(|data| {
                data.aggregates
                    .iter()
                    .filter(|a| a.overlaps(range.from, range.to))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Latest sentiment figures for `key`.
    pub fn sentiment_summary(&self, key: &str) -> Result<SentimentSummary, QueryError> {
        let data = self.get_entity(key)?;
        let s = &data.summary;
        Ok(SentimentSummary {
            product_id: s.entity.clone(),
            product_name: s.name.clone(),
            latest_sentiment_score: s.latest_rating,
            rolling_average_sentiment: s.latest_rolling_sentiment,
            latest_text_sentiment: s.latest_sentiment,
            as_of: s.last_ts,
        })
    }

    /// Status of the pinned snapshot.
    pub fn health(&self) -> HealthStatus {
        let snapshot = self.snapshot();
        HealthStatus {
            status: "ok",
            snapshot_version: snapshot.version,
            built_at: snapshot.created_at,
            entity_count: snapshot.entity_count(),
            record_count: snapshot.record_count,
            aggregate_count: snapshot.aggregate_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::memory::MemoryStore, writer::StoreWriter};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn record(entity: &str, secs: i64, rating: f64) -> CleanRecord {
        CleanRecord {
            entity: entity.to_string(),
            ts: TimeKey::from_secs(secs).expect("key"),
            rating,
            rating_imputed: false,
            ingest_seq: secs as u64,
            review_id: String::new(),
            name: format!("Product {entity}"),
            reviewer: String::new(),
            text: String::new(),
            sentiment: 0.0,
        }
    }

    async fn service_with(
        records: &[CleanRecord],
    ) -> Result<(Arc<MemoryStore>, QueryService), Box<dyn std::error::Error>> {
        let store = Arc::new(MemoryStore::new());
        let window = WindowConfig::default();
        let aggs = crate::aggregate::aggregate(records, &window)?;
        StoreWriter::new(store.clone(), 1)
            .write(records, &aggs, window)
            .await?;
        let service = QueryService::open(store.clone()).await?;
        Ok((store, service))
    }

    #[tokio::test]
    async fn open_without_snapshot_fails() {
        let err = QueryService::open(Arc::new(MemoryStore::new()))
            .await
            .expect_err("empty store");
        assert!(matches!(err, QueryError::NoSnapshot { .. }));
    }

    #[tokio::test]
    async fn entity_summary_tracks_latest_record() -> TestResult {
        let (_, svc) = service_with(&[
            record("A", 1, 5.0),
            record("A", 2, 3.0),
            record("A", 3, 4.0),
        ])
        .await?;

        let data = svc.get_entity("A")?;
        assert_eq!(data.summary.record_count, 3);
        assert_eq!(data.summary.mean_rating, 4.0);
        assert_eq!(data.summary.latest_rating, 4.0);
        assert_eq!(data.summary.latest_rolling_mean, Some(4.0));

        let sentiment = svc.sentiment_summary("A")?;
        assert_eq!(sentiment.product_name, "Product A");
        assert_eq!(sentiment.latest_sentiment_score, 4.0);
        assert_eq!(sentiment.rolling_average_sentiment, Some(0.0));

        assert!(matches!(
            svc.get_entity("UNKNOWN"),
            Err(QueryError::NotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn rolling_sentiment_follows_text_not_rating() -> TestResult {
        let mut records = vec![record("A", 1, 5.0), record("A", 2, 5.0)];
        for r in &mut records {
            r.text = "terrible awful".to_string();
            r.sentiment = crate::normalize::sentiment::polarity(&r.text);
        }
        let (_, svc) = service_with(&records).await?;

        let s = svc.sentiment_summary("A")?;
        assert_eq!(s.latest_sentiment_score, 5.0);
        assert_eq!(s.latest_text_sentiment, -1.0);
        assert_eq!(s.rolling_average_sentiment, Some(-1.0));
        assert_eq!(svc.get_entity("A")?.summary.latest_rolling_mean, Some(5.0));
        Ok(())
    }

    #[tokio::test]
    async fn aggregates_filter_by_overlap() -> TestResult {
        let (_, svc) = service_with(&[
            record("A", 1, 1.0),
            record("A", 2, 2.0),
            record("A", 3, 3.0),
            record("A", 10, 4.0),
        ])
        .await?;

        assert_eq!(svc.get_aggregates("A", &WindowRange::all()).len(), 4);
        let late = svc.get_aggregates("A", &WindowRange::parse("4..9")?);
        // only the window [2, 10] reaches into 4..9
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].anchor.as_millis(), 10_000);
        assert!(svc.get_aggregates("NOPE", &WindowRange::all()).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn pinned_snapshot_survives_refresh() -> TestResult {
        let (store, svc) = service_with(&[record("A", 1, 5.0)]).await?;
        let pinned = svc.snapshot();

        let window = WindowConfig::default();
        let records = vec![record("A", 1, 5.0), record("B", 1, 2.0)];
        let aggs = crate::aggregate::aggregate(&records, &window)?;
        StoreWriter::new(store.clone(), 1)
            .write(&records, &aggs, window)
            .await?;

        assert_eq!(svc.refresh().await?, 2);
        assert_eq!(pinned.version, 1);
        assert!(pinned.entity("B").is_none());
        assert!(svc.get_entity("B").is_ok());
        assert_eq!(svc.health().entity_count, 2);
        Ok(())
    }
}
