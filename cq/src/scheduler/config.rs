//! Scheduler configuration

use eyre::{Result, eyre};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Max concurrently executing actions
    #[serde(rename = "max-active", default = "default_max_active")]
    pub max_active: usize,

    /// Low-priority keys only start while fewer than this many are active
    #[serde(rename = "max-low-priority", default = "default_max_low_priority")]
    pub max_low_priority: usize,

    /// Default per-entry admission delay for bulk submission
    #[serde(rename = "stagger-ms", default = "default_stagger_ms")]
    pub stagger_ms: u64,
}

fn default_max_active() -> usize {
    10
}

fn default_max_low_priority() -> usize {
    5
}

fn default_stagger_ms() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_active: default_max_active(),
            max_low_priority: default_max_low_priority(),
            stagger_ms: default_stagger_ms(),
        }
    }
}

impl SchedulerConfig {
    /// Config with the given limits and the default stagger
    pub fn with_limits(max_active: usize, max_low_priority: usize) -> Self {
        Self {
            max_active,
            max_low_priority,
            ..Default::default()
        }
    }

    /// Get the bulk-submission stagger as a Duration
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    /// Check the limits are usable
    pub fn validate(&self) -> Result<()> {
        if self.max_active == 0 {
            return Err(eyre!("max-active must be at least 1"));
        }
        if self.max_low_priority > self.max_active {
            return Err(eyre!(
                "max-low-priority ({}) must not exceed max-active ({})",
                self.max_low_priority,
                self.max_active
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_active, 10);
        assert_eq!(config.max_low_priority, 5);
        assert_eq!(config.stagger_ms, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stagger_duration() {
        let config = SchedulerConfig {
            stagger_ms: 25,
            ..Default::default()
        };
        assert_eq!(config.stagger(), Duration::from_millis(25));
    }

    #[test]
    fn test_validate_rejects_zero_active() {
        let config = SchedulerConfig::with_limits(0, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_low_above_active() {
        let config = SchedulerConfig::with_limits(2, 3);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max-low-priority"));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: SchedulerConfig = serde_yaml::from_str("max-active: 4\n").unwrap();
        assert_eq!(config.max_active, 4);
        assert_eq!(config.max_low_priority, 5);
        assert_eq!(config.stagger_ms, 10);
    }
}
