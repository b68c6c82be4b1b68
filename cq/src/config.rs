//! Chunkqueue configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::scheduler::SchedulerConfig;

/// Main chunkqueue configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Admission control limits
    pub scheduler: SchedulerConfig,

    /// Synthetic workload for `cq simulate`
    pub simulation: SimulationConfig,
}

/// Just the log level, read before logging is initialized
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogLevelOnly {
    #[serde(rename = "log-level")]
    log_level: Option<String>,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate().context("Invalid scheduler configuration")?;
        self.simulation.validate().context("Invalid simulation configuration")?;
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::candidate_paths() {
            if !candidate.exists() {
                continue;
            }
            match Self::load_from_file(&candidate) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", candidate.display(), e);
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only `log-level` along the same fallback chain
    ///
    /// Never fails: logging is not up yet, so a broken file just yields None
    /// here and is reported properly by [`Config::load`].
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let paths = match config_path {
            Some(path) => vec![path.clone()],
            None => Self::candidate_paths(),
        };

        paths
            .iter()
            .filter(|path| path.exists())
            .find_map(|path| {
                let content = fs::read_to_string(path).ok()?;
                serde_yaml::from_str::<LogLevelOnly>(&content).ok()
            })
            .and_then(|parsed| parsed.log_level)
    }

    /// Project-local then user config locations, in lookup order
    fn candidate_paths() -> Vec<PathBuf> {
        // Project-local config: .chunkqueue.yml
        let mut paths = vec![PathBuf::from(".chunkqueue.yml")];

        // User config: ~/.config/chunkqueue/chunkqueue.yml
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("chunkqueue").join("chunkqueue.yml"));
        }
        paths
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Synthetic workload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Array path the chunk keys live under
    pub array: String,

    /// Side length of the square chunk grid
    #[serde(rename = "grid-size")]
    pub grid_size: u64,

    /// Number of viewer subscribers
    pub viewers: usize,

    /// Chunks each viewer's viewport covers
    #[serde(rename = "chunks-per-viewer")]
    pub chunks_per_viewer: usize,

    /// Chunks shared between neighbouring viewports
    pub overlap: usize,

    /// Chunks requested ahead at low priority
    pub prefetch: usize,

    /// Fastest simulated fetch in milliseconds
    #[serde(rename = "latency-min-ms")]
    pub latency_min_ms: u64,

    /// Slowest simulated fetch in milliseconds
    #[serde(rename = "latency-max-ms")]
    pub latency_max_ms: u64,

    /// Probability in [0, 1] that a fetch fails
    #[serde(rename = "failure-rate")]
    pub failure_rate: f64,

    /// Close the last viewer after this many milliseconds (none: never)
    #[serde(rename = "teardown-after-ms")]
    pub teardown_after_ms: Option<u64>,

    /// RNG seed (none: random)
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            array: "volume/0".to_string(),
            grid_size: 16,
            viewers: 3,
            chunks_per_viewer: 24,
            overlap: 8,
            prefetch: 16,
            latency_min_ms: 5,
            latency_max_ms: 40,
            failure_rate: 0.05,
            teardown_after_ms: Some(30),
            seed: None,
        }
    }
}

impl SimulationConfig {
    /// Check the workload is well-formed
    pub fn validate(&self) -> Result<()> {
        if self.viewers == 0 {
            return Err(eyre::eyre!("viewers must be at least 1"));
        }
        if self.grid_size == 0 {
            return Err(eyre::eyre!("grid-size must be at least 1"));
        }
        if self.grid_size.checked_mul(self.grid_size).is_none() {
            return Err(eyre::eyre!("grid-size ({}) is too large", self.grid_size));
        }
        if self.overlap >= self.chunks_per_viewer.max(1) {
            return Err(eyre::eyre!(
                "overlap ({}) must be smaller than chunks-per-viewer ({})",
                self.overlap,
                self.chunks_per_viewer
            ));
        }
        if self.latency_min_ms > self.latency_max_ms {
            return Err(eyre::eyre!(
                "latency-min-ms ({}) exceeds latency-max-ms ({})",
                self.latency_min_ms,
                self.latency_max_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(eyre::eyre!("failure-rate must be within [0, 1], got {}", self.failure_rate));
        }
        Ok(())
    }

    /// Total chunks in the grid; saturates for sizes `validate` rejects
    pub fn grid_chunks(&self) -> u64 {
        self.grid_size.checked_mul(self.grid_size).unwrap_or(u64::MAX)
    }
}
