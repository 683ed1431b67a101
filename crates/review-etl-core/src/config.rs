//! Pipeline configuration.
//!
//! Configuration is read once at process start (an optional JSON file,
//! overridden by CLI flags), validated, and then passed explicitly into each
//! component. Nothing in the crate reads ambient global state, so tests can
//! run builds with different settings side by side.
//!
//! Example file:
//!
//! ```json
//! {
//!   "input": { "path": "data/reviews.csv", "delimiter": ",", "encoding": "utf-8" },
//!   "store_path": "data/reviews_store",
//!   "window": { "size": 3, "alignment": "trailing", "partial": "emit" },
//!   "missing_values": { "policy": "drop" },
//!   "duplicates": "last_seen",
//!   "dedup_review_ids": true,
//!   "retain_snapshots": 1,
//!   "api_key": "change-me"
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::error::ErrorKind;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[snafu(display("Failed to read config file {path}: {source}"))]
    ReadConfig {
        /// Path of the configuration file.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`PipelineConfig`].
    #[snafu(display("Failed to parse config file {path}: {source}"))]
    ParseConfig {
        /// Path of the configuration file.
        path: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// A field holds a value the pipeline cannot run with.
    #[snafu(display("Invalid configuration for {field}: {reason}"))]
    InvalidField {
        /// Dotted name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigError
    }
}

/// Text encoding of the input file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// UTF-8; rows containing invalid sequences are rejected individually.
    #[default]
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    /// ISO-8859-1; every byte maps to the code point of the same value.
    #[serde(rename = "latin-1", alias = "latin1", alias = "iso-8859-1")]
    Latin1,
}

/// Header names of the input columns the pipeline reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColumnMap {
    /// Entity identifier column (required).
    pub entity: String,
    /// Timestamp / sequence column (required).
    pub timestamp: String,
    /// Numeric rating column (required).
    pub rating: String,
    /// Review identifier column.
    pub review_id: Option<String>,
    /// Entity display name column.
    pub name: Option<String>,
    /// Reviewer column.
    pub reviewer: Option<String>,
    /// Review text column.
    pub text: Option<String>,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            entity: "product_id".to_string(),
            timestamp: "review_date".to_string(),
            rating: "rating".to_string(),
            review_id: Some("review_id".to_string()),
            name: Some("product_name".to_string()),
            reviewer: Some("customer_id".to_string()),
            text: Some("review_text".to_string()),
        }
    }
}

/// Where and how to read the input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputConfig {
    /// Path of the delimited input file.
    pub path: PathBuf,
    /// Single-byte field delimiter.
    pub delimiter: char,
    /// Text encoding.
    pub encoding: Encoding,
    /// Column names.
    pub columns: ColumnMap,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/reviews.csv"),
            delimiter: ',',
            encoding: Encoding::Utf8,
            columns: ColumnMap::default(),
        }
    }
}

impl InputConfig {
    /// The delimiter as the byte the CSV reader expects. Only valid after
    /// [`PipelineConfig::validate`] accepted it.
    pub fn delimiter_byte(&self) -> u8 {
        u8::try_from(u32::from(self.delimiter)).unwrap_or(b',')
    }
}

/// Which edge of the window is tied to the record it is computed for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    /// The window ends at the current record.
    #[default]
    Trailing,
    /// The window is centred on the current record.
    Centered,
}

/// What to do with windows clipped at an entity's sequence boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialWindowPolicy {
    /// Emit clipped windows with `partial = true`.
    #[default]
    Emit,
    /// Drop clipped windows entirely.
    Suppress,
}

/// Rolling-window parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowConfig {
    /// Number of records per full window.
    pub size: usize,
    /// Window alignment.
    pub alignment: Alignment,
    /// Handling of clipped windows.
    pub partial: PartialWindowPolicy,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: 3,
            alignment: Alignment::Trailing,
            partial: PartialWindowPolicy::Emit,
        }
    }
}

/// Policy for records whose rating is missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum MissingValuePolicy {
    /// Reject the record and count it.
    #[default]
    Drop,
    /// Keep the record with `value` as its rating and mark it imputed.
    Impute {
        /// Rating assigned to records without one.
        value: f64,
    },
}

/// Which record survives when several share `(entity, timestamp)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep the record read last.
    #[default]
    LastSeen,
    /// Keep the record read first.
    FirstSeen,
}

/// Settings consumed by the normalizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizeConfig {
    /// Missing rating handling.
    pub missing_values: MissingValuePolicy,
    /// Duplicate resolution.
    pub duplicates: DuplicatePolicy,
    /// Keep only the first record of each non-empty review id.
    pub dedup_review_ids: bool,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            missing_values: MissingValuePolicy::Drop,
            duplicates: DuplicatePolicy::LastSeen,
            dedup_review_ids: true,
        }
    }
}

/// Full configuration of one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Input file settings.
    pub input: InputConfig,
    /// Root directory of the store.
    pub store_path: PathBuf,
    /// Rolling-window settings.
    pub window: WindowConfig,
    /// Missing rating handling.
    pub missing_values: MissingValuePolicy,
    /// Duplicate resolution.
    pub duplicates: DuplicatePolicy,
    /// Drop records whose review id was already seen.
    pub dedup_review_ids: bool,
    /// Number of superseded snapshots kept after a successful swap.
    pub retain_snapshots: usize,
    /// Key expected in the `X-API-Key` header of API requests. `None`
    /// leaves the API open.
    pub api_key: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: InputConfig::default(),
            store_path: PathBuf::from("data/reviews_store"),
            window: WindowConfig::default(),
            missing_values: MissingValuePolicy::Drop,
            duplicates: DuplicatePolicy::LastSeen,
            dedup_review_ids: true,
            retain_snapshots: 1,
            api_key: None,
        }
    }
}

impl PipelineConfig {
    /// Load a configuration file. Fields absent from the file keep their
    /// defaults. The result is not validated yet.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).context(ReadConfigSnafu {
            path: path.display().to_string(),
        })?;
        serde_json::from_str(&text).context(ParseConfigSnafu {
            path: path.display().to_string(),
        })
    }

    /// Check every field the pipeline depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.window.size >= 1,
            InvalidFieldSnafu {
                field: "window.size",
                reason: "must be at least 1",
            }
        );
        ensure!(
            self.window.size <= u32::MAX as usize,
            InvalidFieldSnafu {
                field: "window.size",
                reason: format!("must not exceed {}", u32::MAX),
            }
        );

        let d = self.input.delimiter;
        ensure!(
            d.is_ascii() && !matches!(d, '"' | '\n' | '\r'),
            InvalidFieldSnafu {
                field: "input.delimiter",
                reason: format!("{d:?} is not a usable single-byte delimiter"),
            }
        );

        if let MissingValuePolicy::Impute { value } = self.missing_values {
            ensure!(
                value.is_finite(),
                InvalidFieldSnafu {
                    field: "missing_values.value",
                    reason: format!("impute value {value} is not finite"),
                }
            );
        }

        let cols = &self.input.columns;
        for (field, name) in [
            ("input.columns.entity", &cols.entity),
            ("input.columns.timestamp", &cols.timestamp),
            ("input.columns.rating", &cols.rating),
        ] {
            ensure!(
                !name.trim().is_empty(),
                InvalidFieldSnafu {
                    field,
                    reason: "column name is empty",
                }
            );
        }

        if let Some(key) = &self.api_key {
            ensure!(
                !key.trim().is_empty(),
                InvalidFieldSnafu {
                    field: "api_key",
                    reason: "key is empty; omit it to leave the API open",
                }
            );
        }

        ensure!(
            !self.store_path.as_os_str().is_empty(),
            InvalidFieldSnafu {
                field: "store_path",
                reason: "path is empty",
            }
        );

        Ok(())
    }

    /// The normalizer's slice of the configuration.
    pub fn normalize(&self) -> NormalizeConfig {
        NormalizeConfig {
            missing_values: self.missing_values,
            duplicates: self.duplicates,
            dedup_review_ids: self.dedup_review_ids,
        }
    }
}
