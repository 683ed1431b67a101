use review_etl_core::{ConfigError, ErrorKind, PipelineError, QueryError, api::ApiCallError};

use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("{source}"))]
    Config { source: ConfigError },

    #[snafu(display("--impute-value is only valid together with --missing impute"))]
    ImputeWithoutPolicy,

    #[snafu(display("--missing impute needs --impute-value (or an impute policy in --config)"))]
    ImputeValueMissing,

    #[snafu(display("--delimiter must be a single character, got {value:?}"))]
    Delimiter { value: String },

    #[snafu(display(
        "Build into {store} failed. \
         The previously published snapshot (if any) is unchanged.\n{source}"
    ))]
    Build {
        store: String,
        #[snafu(source(from(PipelineError, Box::new)))]
        source: Box<PipelineError>,
    },

    #[snafu(display(
        "Failed to open store at {store}. \
         Run `review-etl build` first to publish a snapshot.\n{source}"
    ))]
    OpenStore { store: String, source: QueryError },

    #[snafu(display("{source}"))]
    Query { source: QueryError },

    #[snafu(display("Request {uri:?} could not be served: {source}"))]
    Serve { uri: String, source: ApiCallError },

    #[snafu(display("Failed to render output as JSON: {source}"))]
    RenderJson { source: serde_json::Error },
}

impl CliError {
    /// Kind reported next to the message; `None` for purely local failures.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            CliError::Config { source } => Some(source.kind()),
            CliError::ImputeWithoutPolicy
            | CliError::ImputeValueMissing
            | CliError::Delimiter { .. } => {
                Some(ErrorKind::ConfigError)
            }
            CliError::Build { source, .. } => Some(source.kind()),
            CliError::OpenStore { source, .. } | CliError::Query { source } => Some(source.kind()),
            CliError::Serve { .. } | CliError::RenderJson { .. } => None,
        }
    }
}
