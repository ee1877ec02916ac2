use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use ingest_cli::{DatasetArgs, FileOutputArgs};
use tracing::info;

/// Writes a keyword summary of a dataset
#[derive(Parser, Debug)]
#[command(name = "summarize", version, about)]
struct Cli {
    #[command(flatten)]
    dataset: DatasetArgs,
    #[command(flatten)]
    output: FileOutputArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli: Cli = ingest_cli::parse_args();
    ingest_cli::init_logging();
    ingest_cli::finish(run(cli).await)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let engine = ingest_cli::step_engine(&cli.dataset)?;
    let summary = engine
        .summarize(&cli.dataset.input(), &cli.output.output)
        .await
        .with_context(|| format!("Summarize of {} failed", cli.dataset.schema.display()))?;
    info!("Summary '{}' written to {}", summary.summary, cli.output.output.display());
    Ok(())
}
