//! Domain types for chunkqueue
//!
//! Keys, subscriber identities and priority lanes shared by the scheduler
//! and the fanout.

mod id;
mod priority;

pub use id::{ChunkKey, RequestKey, SubscriberId};
pub use priority::Priority;
