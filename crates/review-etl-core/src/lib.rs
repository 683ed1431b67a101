//! Core engine for the review ETL pipeline and its read-only query store.
//!
//! The crate is organised as a one-shot batch pipeline followed by a
//! read-only serving layer:
//!
//! - `ingest` reads a delimited input file into raw rows without ever
//!   failing the batch on a single bad row.
//! - `normalize` turns raw rows into typed, de-duplicated `CleanRecord`s and
//!   reports every rejected or discarded row.
//! - `aggregate` computes per-entity rolling-window statistics with running
//!   sums.
//! - `store` defines the `StoreBackend` capability (a Parquet-on-disk backend
//!   and an in-memory fake) and `writer` publishes snapshots atomically under
//!   an exclusive build lock.
//! - `pipeline` wires the stages together and produces a `BuildReport`.
//! - `query` answers lookups, filtered pages and aggregate slices over a
//!   pinned snapshot, and `api` serves that as an axum router.
#![deny(missing_docs)]

pub mod aggregate;
pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod query;
pub mod storage;
pub mod store;
pub mod writer;

pub use config::{ConfigError, PipelineConfig};
pub use error::ErrorKind;
pub use model::{CleanRecord, RawRecord, TimeKey, WindowAggregate};
pub use pipeline::{BuildReport, PipelineError, run_build};
pub use query::{QueryError, QueryService};
pub use store::{StoreBackend, StoreError, local::LocalStore, memory::MemoryStore};
pub use writer::{StoreWriter, WriteError};
