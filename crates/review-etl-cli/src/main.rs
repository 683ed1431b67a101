//! CLI tool for building review stores and querying them.

mod error;
mod output;

use std::{path::PathBuf, sync::Arc};

use clap::{Args, Parser, Subcommand, ValueEnum};
use review_etl_core::{
    LocalStore, PipelineConfig, QueryService,
    api,
    config::{Alignment, DuplicatePolicy, Encoding, MissingValuePolicy, PartialWindowPolicy},
    query::{EntityFilter, PageRequest, WindowRange, filter::decode_token},
    run_build,
};
use snafu::ResultExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    error::{
        BuildSnafu, CliResult, ConfigSnafu, DelimiterSnafu, ImputeValueMissingSnafu,
        ImputeWithoutPolicySnafu, OpenStoreSnafu, QuerySnafu, ServeSnafu,
    },
    output::{OutputFormat, emit},
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AlignmentArg {
    Trailing,
    Centered,
}

impl From<AlignmentArg> for Alignment {
    fn from(v: AlignmentArg) -> Self {
        match v {
            AlignmentArg::Trailing => Alignment::Trailing,
            AlignmentArg::Centered => Alignment::Centered,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PartialArg {
    Emit,
    Suppress,
}

impl From<PartialArg> for PartialWindowPolicy {
    fn from(v: PartialArg) -> Self {
        match v {
            PartialArg::Emit => PartialWindowPolicy::Emit,
            PartialArg::Suppress => PartialWindowPolicy::Suppress,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MissingArg {
    Drop,
    Impute,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DuplicateArg {
    LastSeen,
    FirstSeen,
}

impl From<DuplicateArg> for DuplicatePolicy {
    fn from(v: DuplicateArg) -> Self {
        match v {
            DuplicateArg::LastSeen => DuplicatePolicy::LastSeen,
            DuplicateArg::FirstSeen => DuplicatePolicy::FirstSeen,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EncodingArg {
    #[value(name = "utf-8")]
    Utf8,
    #[value(name = "latin-1")]
    Latin1,
}

impl From<EncodingArg> for Encoding {
    fn from(v: EncodingArg) -> Self {
        match v {
            EncodingArg::Utf8 => Encoding::Utf8,
            EncodingArg::Latin1 => Encoding::Latin1,
        }
    }
}

/// Flags that override the configuration file for a build.
#[derive(Debug, Args)]
struct BuildArgs {
    /// Input file (CSV or other delimited text with a header row)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Records per full window
    #[arg(long)]
    window: Option<usize>,

    #[arg(long, value_enum)]
    alignment: Option<AlignmentArg>,

    /// Keep or drop windows clipped at an entity's first/last records
    #[arg(long, value_enum)]
    partial: Option<PartialArg>,

    /// What to do with rows that have no rating
    #[arg(long, value_enum)]
    missing: Option<MissingArg>,

    /// Rating assigned to rows without one (with --missing impute)
    #[arg(long = "impute-value")]
    impute_value: Option<f64>,

    /// Which of several rows sharing (entity, timestamp) survives
    #[arg(long, value_enum)]
    duplicates: Option<DuplicateArg>,

    #[arg(long)]
    delimiter: Option<String>,

    #[arg(long, value_enum)]
    encoding: Option<EncodingArg>,

    /// Superseded snapshots kept after publishing
    #[arg(long)]
    retain: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the ETL pipeline and publish a new snapshot
    Build(BuildArgs),

    /// Show one entity's summary, records and aggregates
    Get { key: String },

    /// List entities in key order, one page at a time
    List {
        /// e.g. rating:3..5,date:2024-01-01..
        #[arg(long, default_value = "")]
        filter: String,

        #[arg(long, default_value_t = review_etl_core::query::filter::DEFAULT_PAGE_SIZE)]
        limit: usize,

        /// Token printed as `next page` by the previous call
        #[arg(long)]
        page: Option<String>,
    },

    /// Window aggregates of one entity, optionally limited to LO..HI
    Aggregates {
        key: String,

        #[arg(long)]
        window: Option<String>,
    },

    /// Latest sentiment figures of one entity
    Sentiment { key: String },

    /// Status of the current snapshot
    Health,

    /// Answer one API request (`/path?query`) and print status and JSON body
    ServeRequest {
        uri: String,

        /// Value sent in the `X-API-Key` header
        #[arg(long)]
        api_key: Option<String>,
    },
}

#[derive(Debug, Parser)]
#[command(name = "review-etl", version, about)]
struct Cli {
    /// JSON configuration file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store directory (overrides `store_path`)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(subcommand)]
    cmd: Command,
}

fn base_config(cli: &Cli) -> CliResult<PipelineConfig> {
    let mut cfg = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path).context(ConfigSnafu)?,
        None => PipelineConfig::default(),
    };
    if let Some(store) = &cli.store {
        cfg.store_path = store.clone();
    }
    Ok(cfg)
}

fn apply_build_args(cfg: &mut PipelineConfig, args: &BuildArgs) -> CliResult<()> {
    if let Some(input) = &args.input {
        cfg.input.path = input.clone();
    }
    if let Some(size) = args.window {
        cfg.window.size = size;
    }
    if let Some(alignment) = args.alignment {
        cfg.window.alignment = alignment.into();
    }
    if let Some(partial) = args.partial {
        cfg.window.partial = partial.into();
    }
    cfg.missing_values = match (args.missing, args.impute_value, cfg.missing_values) {
        (Some(MissingArg::Drop), None, _) => MissingValuePolicy::Drop,
        (Some(MissingArg::Impute), Some(value), _)
        | (None, Some(value), MissingValuePolicy::Impute { .. }) => {
            MissingValuePolicy::Impute { value }
        }
        (Some(MissingArg::Impute), None, current @ MissingValuePolicy::Impute { .. }) => current,
        (Some(MissingArg::Impute), None, MissingValuePolicy::Drop) => {
            return ImputeValueMissingSnafu.fail();
        }
        (_, Some(_), _) => return ImputeWithoutPolicySnafu.fail(),
        (None, None, current) => current,
    };
    if let Some(duplicates) = args.duplicates {
        cfg.duplicates = duplicates.into();
    }
    if let Some(raw) = &args.delimiter {
        let mut chars = raw.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => cfg.input.delimiter = c,
            _ => return DelimiterSnafu { value: raw.clone() }.fail(),
        }
    }
    if let Some(encoding) = args.encoding {
        cfg.input.encoding = encoding.into();
    }
    if let Some(retain) = args.retain {
        cfg.retain_snapshots = retain;
    }
    cfg.validate().context(ConfigSnafu)
}

async fn cmd_build(cfg: &PipelineConfig, format: OutputFormat) -> CliResult<()> {
    let store = Arc::new(LocalStore::new(&cfg.store_path));
    let report = run_build(cfg, store).await.context(BuildSnafu {
        store: cfg.store_path.display().to_string(),
    })?;
    emit(format, &report, output::build_report)
}

async fn open_service(cfg: &PipelineConfig) -> CliResult<QueryService> {
    let store = Arc::new(LocalStore::new(&cfg.store_path));
    QueryService::open(store).await.context(OpenStoreSnafu {
        store: cfg.store_path.display().to_string(),
    })
}

async fn run(cli: Cli) -> CliResult<()> {
    let mut cfg = base_config(&cli)?;
    let format = cli.format;

    match cli.cmd {
        Command::Build(args) => {
            apply_build_args(&mut cfg, &args)?;
            cmd_build(&cfg, format).await
        }

        Command::Get { key } => {
            let svc = open_service(&cfg).await?;
            let data = svc.get_entity(&key).context(QuerySnafu)?;
            emit(format, data.as_ref(), output::entity)
        }

        Command::List {
            filter,
            limit,
            page,
        } => {
            let filter = EntityFilter::parse(&filter).context(QuerySnafu)?;
            let mut request = PageRequest::first(limit).context(QuerySnafu)?;
            request.after = page
                .as_deref()
                .map(decode_token)
                .transpose()
                .context(QuerySnafu)?;
            let svc = open_service(&cfg).await?;
            let page = svc.list_entities(&filter, &request).context(QuerySnafu)?;
            emit(format, &page, output::entity_page)
        }

        Command::Aggregates { key, window } => {
            let range = match window {
                Some(raw) => WindowRange::parse(&raw).context(QuerySnafu)?,
                None => WindowRange::all(),
            };
            let svc = open_service(&cfg).await?;
            let aggs = svc.get_aggregates(&key, &range);
            emit(format, aggs.as_slice(), output::aggregates)
        }

        Command::Sentiment { key } => {
            let svc = open_service(&cfg).await?;
            let summary = svc.sentiment_summary(&key).context(QuerySnafu)?;
            emit(format, &summary, output::sentiment)
        }

        Command::Health => {
            let svc = open_service(&cfg).await?;
            emit(format, &svc.health(), output::health)
        }

        // Always exits 0 once the store is open; the status is part of the output.
        Command::ServeRequest { uri, api_key } => {
            let svc = open_service(&cfg).await?;
            let router = api::router(Arc::new(svc), cfg.api_key.clone());
            let resp = api::call(&router, &uri, api_key.as_deref())
                .await
                .context(ServeSnafu { uri: uri.as_str() })?;
            println!("{} {}", resp.status, resp.body);
            Ok(())
        }
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        match e.kind() {
            Some(kind) => eprintln!("error[{kind}]: {e}"),
            None => eprintln!("error: {e}"),
        }
        std::process::exit(1);
    }
}
