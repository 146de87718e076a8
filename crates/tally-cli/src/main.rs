//! Tally event store command-line entry point.

use std::process::ExitCode;

use tally_cli::{CliError, Command, USAGE};
use tally_core::store::EventStore;
use tally_event_store::{StoreConfig, connect};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing subscriber. Logs go to stderr; stdout carries results.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if matches!(err, CliError::Usage(_)) {
                eprintln!("{USAGE}");
            }
            tracing::debug!(code = err.code(), error = %err, "command failed");
            // Failures are JSON on stdout too, so callers parse one stream.
            println!("{}", err.to_json());
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &[String]) -> Result<(), CliError> {
    let command = Command::parse(args)?;
    if command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }

    // Read configuration from environment.
    let config = StoreConfig::from_env()?;
    let repository = connect(&config).await?;
    let store = EventStore::new(repository);

    tracing::debug!(?command, "running command");
    let output = command.execute(&store).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
