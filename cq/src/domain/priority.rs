//! Priority lanes for request admission

use serde::{Deserialize, Serialize};

/// Lane a request is admitted into
///
/// Normal-priority keys always drain before low-priority keys; low-priority
/// work only uses capacity below the scheduler's low-priority sub-limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
}

impl Priority {
    /// True for the low-priority lane
    pub fn is_low(&self) -> bool {
        matches!(self, Self::Low)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" | "prefetch" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}
