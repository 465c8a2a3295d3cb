//! Main entry point for the scheduling trace CLI.

use anyhow::Result;
use clap::Parser;
use scheduling_trace::{cli, demo, settings::Settings, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load settings
    let settings = match &args.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };

    // Initialize logging
    telemetry::init(&settings.logging)?;

    // Execute the requested command
    match args.command {
        cli::Commands::Demo { subjects, targets, namespace } => {
            tokio::select! {
                report = demo::run(&settings, &namespace, subjects, targets) => {
                    println!("{}", serde_json::to_string_pretty(&report?)?);
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("Interrupted, abandoning demo run");
                }
            }
            Ok(())
        }
        cli::Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}
