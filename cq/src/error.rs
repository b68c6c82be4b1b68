//! Fetch error types

use std::sync::Arc;

use thiserror::Error;

use crate::domain::SubscriberId;

/// Reason used when a caller cancels without giving one
pub const DEFAULT_CANCEL_REASON: &str = "request cancelled";

/// Errors a request or subscription can settle with
///
/// `Clone` so that one settlement can be routed verbatim to every listener.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("{reason}")]
    Cancelled { reason: String },

    #[error("Unknown subscriber: {0}")]
    UnknownSubscriber(SubscriberId),

    #[error("{0}")]
    Action(Arc<eyre::Report>),

    #[error("Request dropped before it settled")]
    Dropped,
}

impl FetchError {
    /// Cancellation with the given reason, or the default one if it is empty
    pub fn cancelled(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let reason = if reason.is_empty() {
            DEFAULT_CANCEL_REASON.to_string()
        } else {
            reason
        };
        FetchError::Cancelled { reason }
    }

    /// Wrap an action's own failure
    pub fn action(report: eyre::Report) -> Self {
        FetchError::Action(Arc::new(report))
    }

    /// Check if this is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled { .. })
    }

    /// The cancellation reason, if any
    pub fn cancel_reason(&self) -> Option<&str> {
        match self {
            FetchError::Cancelled { reason } => Some(reason),
            _ => None,
        }
    }

    /// The action's failure report, if any
    pub fn action_report(&self) -> Option<&eyre::Report> {
        match self {
            FetchError::Action(report) => Some(report),
            _ => None,
        }
    }
}
