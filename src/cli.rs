//! Command line options.

use std::path::PathBuf;

use clap::Parser;

/// Metrics-collection orchestrator plugin.
#[derive(Parser, Debug)]
#[command(name = "harvest", version, about, long_about = None)]
#[command(override_usage = "harvest [OPTIONS] [UPDATE_EVERY]")]
pub struct Cli {
    /// Enable debug logging.
    #[arg(short, long)]
    pub debug: bool,

    /// Module to run, or "all".
    #[arg(short, long, default_value = "all", value_name = "name|all")]
    pub modules: String,

    /// Configuration directories, highest priority first.
    #[arg(short, long, value_name = "dir")]
    pub config: Vec<PathBuf>,

    /// Minimum data collection interval override, seconds.
    #[arg(value_name = "UPDATE_EVERY")]
    pub update_every: Option<i64>,
}
