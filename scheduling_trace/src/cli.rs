//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Scheduling trace CLI
#[derive(Parser)]
#[command(name = "schedtrace-cli")]
#[command(about = "Records every scheduling stage's outcome and publishes it on the subject")]
#[command(version)]
pub struct Cli {
    /// Configuration file to use instead of ./schedtrace.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Schedule sample subjects with the sample plugins and print the reflected annotations
    Demo {
        /// Number of subjects to schedule
        #[arg(long, default_value_t = 3)]
        subjects: usize,
        /// Number of candidate targets
        #[arg(long, default_value_t = 6)]
        targets: usize,
        /// Namespace of the sample subjects
        #[arg(long, default_value = "default")]
        namespace: String,
    },
    /// Load and validate the configuration, then print it as JSON
    CheckConfig,
}
