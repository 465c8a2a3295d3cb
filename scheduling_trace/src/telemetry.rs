//! Logging initialization.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

use crate::settings::LoggingConfig;

/// Initialize logging based on configuration. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    if config.format == "json" {
        init_json(filter, config)
    } else {
        init_text(filter, config)
    }
}

fn init_json(filter: EnvFilter, config: &LoggingConfig) -> Result<()> {
    let subscriber = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr).with_target(config.enable_target));

    tracing::subscriber::set_global_default(subscriber)?;
    tracing::info!("JSON logging initialized");
    Ok(())
}

fn init_text(filter: EnvFilter, config: &LoggingConfig) -> Result<()> {
    let subscriber = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(config.enable_target));

    tracing::subscriber::set_global_default(subscriber)?;
    tracing::info!("Console logging initialized");
    Ok(())
}
