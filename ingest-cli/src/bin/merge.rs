use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use ingest_cli::{DatasetArgs, FolderOutputArgs};
use tracing::info;

/// Merges all resources of a dataset into one table
#[derive(Parser, Debug)]
#[command(name = "merge", version, about)]
struct Cli {
    #[command(flatten)]
    dataset: DatasetArgs,
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
        .merge(&cli.dataset.input(), &cli.output.output)
        .await
        .with_context(|| format!("Merge of {} failed", cli.dataset.schema.display()))?;
    info!("Merged dataset written to {}", cli.output.output.display());
    cli.output.publish(&schema)
}
