//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// Chunkqueue - admission-controlled chunk fetching
#[derive(Parser)]
#[command(
    name = "cq",
    about = "Admission-controlled chunk fetch scheduler with multi-subscriber fanout",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a synthetic viewer workload against a simulated chunk store
    Simulate(SimulateArgs),

    /// Print the effective configuration as YAML
    Config,

    /// Show logs
    Logs {
        /// Number of lines to show
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },
}

/// Overrides for the configured simulation
#[derive(Debug, Default, clap::Args)]
pub struct SimulateArgs {
    /// Number of viewer subscribers
    #[arg(long)]
    pub viewers: Option<usize>,

    /// Chunks each viewer requests
    #[arg(long)]
    pub chunks: Option<usize>,

    /// Chunks requested ahead at low priority
    #[arg(long)]
    pub prefetch: Option<usize>,

    /// Probability in [0, 1] that a fetch fails
    #[arg(long)]
    pub failure_rate: Option<f64>,

    /// Maximum concurrently executing fetches
    #[arg(long)]
    pub max_active: Option<usize>,

    /// Low-priority fetches only start below this many active
    #[arg(long)]
    pub max_low_priority: Option<usize>,

    /// Close the last viewer after this many milliseconds
    #[arg(long, conflicts_with = "no_teardown")]
    pub teardown_after_ms: Option<u64>,

    /// Never close a viewer mid-run
    #[arg(long)]
    pub no_teardown: bool,

    /// RNG seed for reproducible runs
    #[arg(long)]
    pub seed: Option<u64>,

    /// Output format
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chunkqueue")
        .join("logs")
        .join("chunkqueue.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Output format for reports
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => {
                debug!(%s, "OutputFormat::from_str: unknown format");
                Err(format!("Unknown format: {}. Use: text or json", s))
            }
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
