mod extras;
mod ingest;
mod logging;
mod output;

use clap::Parser;
use std::process::ExitCode;

/// medkgctl drives the Medical KG ingestion core: it runs registered source
/// adapters through the streaming pipeline and records every document
/// lifecycle in the ingestion ledger.
#[derive(Debug, Parser)]
#[command(name = "medkgctl", version, author)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Ingest documents from a registered source adapter
    Ingest(ingest::IngestArgs),
}

/// Exit codes: 0 all documents completed or skipped, 1 one or more terminal
/// failures (or a fatal pipeline error), 2 invalid usage or unknown adapter.
/// (clap itself exits 2 on malformed arguments.)
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Ingest(args) => ingest::run(args).await,
    }
}
