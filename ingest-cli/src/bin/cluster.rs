use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use ingest_cli::{DatasetArgs, FolderOutputArgs, SourceSchemaArgs};
use tracing::info;

/// Adds cluster ids for image and timeseries columns
#[derive(Parser, Debug)]
#[command(name = "cluster", version, about)]
struct Cli {
    #[command(flatten)]
    dataset: DatasetArgs,
    #[command(flatten)]
    source: SourceSchemaArgs,
    #[command(flatten)]
    output: FolderOutputArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli: Cli = ingest_cli::parse_args();
    ingest_cli::init_logging();
    ingest_cli::finish(run(cli).await)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let engine = ingest_cli::step_engine(&cli.dataset)?;
    let schema = engine
        .cluster(
            &cli.dataset.input(),
            cli.source.source_schema.as_deref(),
            &cli.output.output,
        )
        .await
        .with_context(|| format!("Cluster of {} failed", cli.dataset.schema.display()))?;
    info!("Clustered dataset written to {}", cli.output.output.display());
    cli.output.publish(&schema)
}
