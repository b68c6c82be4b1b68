//! Chunkqueue - admission-controlled chunk fetching
//!
//! Chunkqueue schedules asynchronous fetches of chunked image data for
//! interactive viewers. Many consumers ask for overlapping chunks while the
//! remote store tolerates only a bounded number of concurrent requests.
//!
//! # Core Concepts
//!
//! - **Two Lanes**: Normal-priority work starts first; low-priority
//!   (prefetch) work only starts while the system is lightly loaded
//! - **One Fetch Per Key**: Duplicate requests share one pending action
//! - **Cancel Before Start**: Unwanted requests are dropped while queued;
//!   a running fetch is never interrupted
//! - **Fanout**: Independent subscribers each get their own cancellable
//!   result handle on a shared request
//!
//! # Modules
//!
//! - [`scheduler`] - Admission-controlled two-lane queue
//! - [`fanout`] - Multi-subscriber multiplexer over a scheduler
//! - [`domain`] - Keys, subscriber ids and priorities
//! - [`error`] - Settlement errors
//! - [`sim`] - Synthetic chunk store and viewer workloads
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod fanout;
pub mod scheduler;
pub mod sim;

pub use domain::{ChunkKey, Priority, RequestKey, SubscriberId};
pub use error::{DEFAULT_CANCEL_REASON, FetchError};
pub use fanout::{Fanout, FanoutStats, Subscription};
pub use scheduler::{Admission, QueueState, RequestHandle, RequestOptions, Scheduler, SchedulerConfig, SchedulerStats};
