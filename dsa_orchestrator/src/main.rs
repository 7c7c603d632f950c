//! Main entry point for the dsa-cli binary.

use anyhow::Result;
use clap::Parser;
use dsa_orchestrator::{cli, settings::Settings, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let settings = Settings::load(args.config.as_deref())?;

    telemetry::init(&settings.logging, settings.otlp_endpoint.as_deref())?;

    cli::execute(args.command, settings).await
}
