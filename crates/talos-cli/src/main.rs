//! Talos CLI - command-line interface for the Talos component orchestrator.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "talos=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => commands::run::execute(args).await,
        Commands::Deploy(args) => commands::deploy::execute(args).await,
        Commands::Status(args) => commands::status::run(&args),
        Commands::Components(args) => commands::components::run(&args),
        Commands::Version => {
            println!("talos {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
