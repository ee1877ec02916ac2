//! Flags, logging and exit codes shared by the ingest binaries.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{Args, Parser, ValueHint};
use d3m_ingest::{IngestConfig, StepEngine, StepInput};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "d3m_ingest=info,ingest_cli=info";

/// Exit code for a step that ran and failed.
pub const STEP_FAILURE: u8 = 2;
/// Exit code for missing or invalid flags.
pub const USAGE_FAILURE: u8 = 1;

/// Input dataset flags common to every step.
#[derive(Args, Debug, Clone)]
pub struct DatasetArgs {
    /// Schema document of the input dataset
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub schema: PathBuf,
    /// Main table to read instead of the one named by the schema
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub dataset: Option<PathBuf>,
    /// Whether the main table starts with a header row
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub has_header: bool,
    /// Pipeline runner endpoint, overriding PIPELINE_RUNNER_ENDPOINT
    #[arg(long, value_hint = ValueHint::Url)]
    pub endpoint: Option<String>,
}

impl DatasetArgs {
    pub fn input(&self) -> StepInput {
        StepInput::new(&self.schema)
            .with_data_path(self.dataset.clone())
            .with_header(self.has_header)
    }
}

/// Output flags of steps that write a dataset folder.
#[derive(Args, Debug, Clone)]
pub struct FolderOutputArgs {
    /// Folder the rewritten dataset is written to
    #[arg(long, value_hint = ValueHint::DirPath)]
    pub output: PathBuf,
    /// Also copy the written schema document to this path
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub output_schema: Option<PathBuf>,
}

impl FolderOutputArgs {
    /// Copies `schema_path` to `--output-schema` when one was given.
    pub fn publish(&self, schema_path: &Path) -> anyhow::Result<()> {
        if let Some(target) = &self.output_schema {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::copy(schema_path, target).with_context(|| {
                format!("Failed to copy {} to {}", schema_path.display(), target.display())
            })?;
        }
        info!("Wrote {}", schema_path.display());
        Ok(())
    }
}

/// Output flag of steps that write a side file.
#[derive(Args, Debug, Clone)]
pub struct FileOutputArgs {
    /// File the step output is written to
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub output: PathBuf,
}

/// Pre-merge schema flag of featurize and cluster.
#[derive(Args, Debug, Clone)]
pub struct SourceSchemaArgs {
    /// Schema of the dataset before it was merged; resolves media collections
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub source_schema: Option<PathBuf>,
}

/// Parses the command line. Help and version exit 0, any other parse error
/// exits 1.
pub fn parse_args<T: Parser>() -> T {
    match T::try_parse() {
        Ok(args) => args,
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp
            | ErrorKind::DisplayVersion
            | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => err.exit(),
            _ => {
                let _ = err.print();
                std::process::exit(i32::from(USAGE_FAILURE));
            }
        },
    }
}

pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Reads the environment configuration and applies the runner override.
pub fn load_config(endpoint: Option<&str>) -> anyhow::Result<IngestConfig> {
    let mut config = IngestConfig::from_env().context("Failed to read configuration")?;
    if let Some(endpoint) = endpoint {
        config.runner_endpoint = endpoint.to_string();
    }
    config.log_summary();
    Ok(config)
}

/// Step engine for `args`, cancelled on ctrl-c.
pub fn step_engine(args: &DatasetArgs) -> anyhow::Result<StepEngine> {
    let config = load_config(args.endpoint.as_deref())?;
    let engine = StepEngine::from_config(&config, shutdown_token())
        .context("Failed to initialize step engine")?;
    Ok(engine)
}

/// Token cancelled when the process receives ctrl-c.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running pipelines");
            cancel.cancel();
        }
    });
    token
}

/// Maps the outcome of a binary to its exit code, printing one error line
/// on failure.
pub fn finish(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", error_line(&e));
            ExitCode::from(STEP_FAILURE)
        }
    }
}

/// Single-line rendering of an error and its causes.
pub fn error_line(error: &anyhow::Error) -> String {
    let message = format!("{:#}", error);
    format!("ERROR: {}", message.replace(['\n', '\r'], " "))
}
