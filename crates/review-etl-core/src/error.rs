//! Machine-readable error classification shared by every stage.
//!
//! Each module owns its own SNAFU error enum; this module only defines the
//! stable `ErrorKind` those enums report through `kind()`, so callers (the
//! CLI, the API mapping) can branch on a kind without matching every variant.

use std::fmt;

use serde::Serialize;

/// Stable classification of failures across the pipeline and query layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A malformed input row. Dropped and counted; never aborts a batch.
    ParseError,
    /// Bad query parameters. Surfaced to the caller, never retried.
    ValidationError,
    /// Store medium failure during a build. The previous snapshot stays authoritative.
    WriteError,
    /// Another build holds the exclusive build lock.
    BuildInProgress,
    /// The requested entity does not exist in the snapshot.
    NotFound,
    /// The input file could not be opened or lacks required columns.
    InputError,
    /// Invalid configuration detected at process start.
    ConfigError,
    /// The store could not be read while opening or refreshing a snapshot.
    StoreError,
    /// The request lacks the configured API key.
    Forbidden,
}

impl ErrorKind {
    /// Wire name used in API payloads and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ParseError => "parse_error",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::WriteError => "write_error",
            ErrorKind::BuildInProgress => "build_in_progress",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InputError => "input_error",
            ErrorKind::ConfigError => "config_error",
            ErrorKind::StoreError => "store_error",
            ErrorKind::Forbidden => "forbidden",
        }
    }

    /// Whether retrying the same operation later can succeed without
    /// changing its inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::BuildInProgress | ErrorKind::WriteError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_serde_names() {
        for kind in [
            ErrorKind::ParseError,
            ErrorKind::ValidationError,
            ErrorKind::WriteError,
            ErrorKind::BuildInProgress,
            ErrorKind::NotFound,
            ErrorKind::InputError,
            ErrorKind::ConfigError,
            ErrorKind::StoreError,
            ErrorKind::Forbidden,
        ] {
            let json = serde_json::to_string(&kind).expect("serialize kind");
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(ErrorKind::BuildInProgress.is_retryable());
        assert!(!ErrorKind::ValidationError.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::Forbidden.is_retryable());
    }
}
