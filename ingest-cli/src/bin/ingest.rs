use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context};
use clap::{Parser, ValueHint};
use d3m_ingest::{IngestEngine, IngestRequest, IngestStep};
use ingest_cli::SourceSchemaArgs;
use tracing::info;

/// Runs the ingest steps for one dataset and projects the result into the
/// search index and the relational store
#[derive(Parser, Debug)]
#[command(name = "ingest", version, about)]
struct Cli {
    /// Schema document of the dataset to ingest
    #[arg(long, value_hint = ValueHint::FilePath)]
    schema: PathBuf,
    /// Folder receiving one subfolder per step and the final dataset
    #[arg(long, value_hint = ValueHint::DirPath)]
    output: PathBuf,
    /// Whether the main table starts with a header row
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    has_header: bool,
    /// Pipeline runner endpoint, overriding PIPELINE_RUNNER_ENDPOINT
    #[arg(long, value_hint = ValueHint::Url)]
    endpoint: Option<String>,
    #[command(flatten)]
    source: SourceSchemaArgs,
    /// Steps to run, comma separated; all steps by default
    #[arg(long, value_delimiter = ',', value_parser = parse_step)]
    steps: Vec<IngestStep>,
    /// Skip steps the input dataset has already been through
    #[arg(long)]
    resume: bool,
    /// Do not write the search index document
    #[arg(long)]
    no_index: bool,
    /// Delete and recreate the search index before writing
    #[arg(long, conflicts_with = "no_index")]
    overwrite_index: bool,
}

fn parse_step(value: &str) -> Result<IngestStep, String> {
    IngestStep::parse(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli: Cli = ingest_cli::parse_args();
    ingest_cli::init_logging();
    ingest_cli::finish(run(cli).await)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ingest_cli::load_config(cli.endpoint.as_deref())?;
    let engine = IngestEngine::from_config(&config, ingest_cli::shutdown_token())
        .context("Failed to initialize ingest engine")?;

    let mut request = IngestRequest::new(&cli.schema, &cli.output)
        .with_header(cli.has_header)
        .with_source_schema(cli.source.source_schema.clone())
        .resume(cli.resume)
        .index(!cli.no_index, cli.overwrite_index);
    if !cli.steps.is_empty() {
        request = request.with_steps(cli.steps.iter().copied());
    }

    let report = engine
        .run(&request)
        .await
        .with_context(|| format!("Ingest of {} failed", cli.schema.display()))?;

    info!(
        "Ingested {} to {} ({} rows, stage {:?})",
        report.dataset_id,
        report.schema_path.display(),
        report.num_rows,
        report.stage
    );
    if let Some(rows) = report.rows_stored {
        info!("Stored {} rows in the relational store", rows);
    }
    match report.failure_message() {
        Some(message) => Err(anyhow!(message)),
        None => Ok(()),
    }
}
