use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use ingest_cli::{DatasetArgs, FileOutputArgs};
use tracing::info;

/// Scores the numeric columns of a dataset by importance
#[derive(Parser, Debug)]
#[command(name = "rank", version, about)]
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
    let importance = engine
        .rank(&cli.dataset.input(), &cli.output.output)
        .await
        .with_context(|| format!("Rank of {} failed", cli.dataset.schema.display()))?;
    let scored = importance.features.iter().filter(|f| **f > 0.0).count();
    info!(
        "Ranked {} of {} columns into {}",
        scored,
        importance.features.len(),
        cli.output.output.display()
    );
    Ok(())
}
