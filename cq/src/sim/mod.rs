//! Synthetic chunk-store workloads
//!
//! Drives a [`Fanout`](crate::fanout::Fanout) with viewer subscribers whose
//! viewports overlap, a low-priority prefetcher and an optional mid-run
//! viewer teardown, then reports what the scheduler did.

mod report;
mod source;
mod workload;

pub use report::{SimulationReport, SubscriberReport};
pub use source::{Chunk, ChunkSource, SimulatedStore};
pub use workload::{Simulation, VIEWER_CLOSED};
