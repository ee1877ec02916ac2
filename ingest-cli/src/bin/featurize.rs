use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use ingest_cli::{DatasetArgs, FolderOutputArgs, SourceSchemaArgs};
use tracing::info;

/// Adds detected object labels for image columns
#[derive(Parser, Debug)]
#[command(name = "featurize", version, about)]
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
        .featurize(
            &cli.dataset.input(),
            cli.source.source_schema.as_deref(),
            &cli.output.output,
        )
        .await
        .with_context(|| format!("Featurize of {} failed", cli.dataset.schema.display()))?;
    info!("Featurized dataset written to {}", cli.output.output.display());
    cli.output.publish(&schema)
}
