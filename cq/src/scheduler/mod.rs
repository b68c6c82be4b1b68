//! Scheduler for chunk fetches
//!
//! Admission-controlled queue with a normal and a low-priority lane,
//! bounded concurrency, per-key deduplication, deferred/staggered admission
//! and cooperative cancellation.

mod action;
mod config;
mod core;
mod handle;
mod queue;

pub use action::{Action, ActionFuture, BoxAction};
pub use config::SchedulerConfig;
pub use core::Scheduler;
pub use handle::{Outcome, RequestHandle};
pub use queue::{Admission, QueueState, RequestOptions, SchedulerStats};
