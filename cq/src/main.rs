//! Chunkqueue - admission-controlled chunk fetching
//!
//! CLI entry point for running simulated workloads and inspecting config.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info};

use chunkqueue::cli::{Cli, Command, OutputFormat, SimulateArgs, get_log_path};
use chunkqueue::config::Config;
use chunkqueue::sim::{Simulation, SimulatedStore};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    // Setup logging with priority: CLI > config > INFO default
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Simulate(args) => {
            debug!(?args, "main: matched Simulate command");
            cmd_simulate(config, args).await
        }
        Command::Config => {
            debug!("main: matched Config command");
            cmd_config(&config)
        }
        Command::Logs { lines } => {
            debug!(lines, "main: matched Logs command");
            cmd_logs(lines)
        }
    }
}

/// Run a simulated workload and print its report
async fn cmd_simulate(mut config: Config, args: SimulateArgs) -> Result<()> {
    debug!(?args, "cmd_simulate: called");
    apply_overrides(&mut config, &args);
    config.validate()?;

    let workload = config.simulation.clone();
    let simulation = Simulation::new(config.scheduler.clone(), workload.clone())?;
    let store = Arc::new(SimulatedStore::new(
        workload.latency_min_ms..=workload.latency_max_ms,
        workload.failure_rate,
        simulation.seed(),
    ));

    let report = simulation.run(store).await.context("Simulation failed")?;

    match args.format {
        OutputFormat::Json => {
            debug!("cmd_simulate: outputting JSON");
            println!("{}", report.to_json()?);
        }
        OutputFormat::Text => {
            debug!("cmd_simulate: outputting text");
            print!("{}", report.render_text());
        }
    }
    Ok(())
}

/// Fold command-line overrides into the loaded config
fn apply_overrides(config: &mut Config, args: &SimulateArgs) {
    let sim = &mut config.simulation;
    if let Some(viewers) = args.viewers {
        sim.viewers = viewers;
    }
    if let Some(chunks) = args.chunks {
        sim.chunks_per_viewer = chunks;
        sim.overlap = sim.overlap.min(chunks.saturating_sub(1));
    }
    if let Some(prefetch) = args.prefetch {
        sim.prefetch = prefetch;
    }
    if let Some(rate) = args.failure_rate {
        sim.failure_rate = rate;
    }
    if let Some(seed) = args.seed {
        sim.seed = Some(seed);
    }
    if args.no_teardown {
        sim.teardown_after_ms = None;
    } else if let Some(after_ms) = args.teardown_after_ms {
        sim.teardown_after_ms = Some(after_ms);
    }

    let sched = &mut config.scheduler;
    if let Some(max_active) = args.max_active {
        sched.max_active = max_active;
        sched.max_low_priority = sched.max_low_priority.min(max_active);
    }
    if let Some(max_low) = args.max_low_priority {
        sched.max_low_priority = max_low;
    }
}

/// Print the effective configuration
fn cmd_config(config: &Config) -> Result<()> {
    debug!("cmd_config: called");
    print!("{}", serde_yaml::to_string(config).context("Failed to serialize config")?);
    Ok(())
}

/// Show the last lines of the log file
fn cmd_logs(lines: usize) -> Result<()> {
    debug!(lines, "cmd_logs: called");
    let log_path: PathBuf = get_log_path();

    if !log_path.exists() {
        debug!(?log_path, "cmd_logs: log file does not exist");
        println!("No log file found at: {}", log_path.display());
        return Ok(());
    }

    let file = fs::File::open(&log_path).context("Failed to open log file")?;
    let reader = BufReader::new(file);
    let all_lines: Vec<String> = reader.lines().map_while(Result::ok).collect();

    let start = all_lines.len().saturating_sub(lines);
    for line in &all_lines[start..] {
        println!("{}", line);
    }

    Ok(())
}
