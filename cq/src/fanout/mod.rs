//! Fanout over a scheduler
//!
//! Lets many independent subscribers request the same key. Each gets its own
//! cancellable subscription; the scheduler runs the underlying action at most
//! once per key, and drops it before it starts once nobody wants it.

mod core;
mod subscription;

pub use core::Fanout;
pub use subscription::{FanoutStats, Subscription};
