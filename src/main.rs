mod cli;
mod config;
mod engine;
mod metrics;
mod model;
mod orchestrator;
mod report;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use model::RunOutcome;

fn exit_code(outcome: &RunOutcome) -> i32 {
    match outcome {
        o if o.is_success() => 0,
        RunOutcome::AbortedEarly => 2,
        RunOutcome::Cancelled => 130,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Diagnostics go to stderr; progress lines come from the event stream.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = cli::Cli::parse();
    let summary = cli::run(args).await?;
    std::process::exit(exit_code(&summary.outcome));
}
