//! Identifiers: request keys, chunk addresses, subscriber ids

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Anything usable as a scheduling key
///
/// A key identifies one unit of schedulable work and every listener waiting
/// on it. Blanket-implemented for all suitable types.
pub trait RequestKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> RequestKey for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Resolved address of one chunk in a chunked image array
///
/// Displays as `{array}/{c0}.{c1}...`, e.g. `image/0/2.0.15.7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    /// Path of the array inside the store (e.g. a multiscale level)
    pub array: String,

    /// Chunk grid coordinates
    pub coords: Vec<u64>,
}

impl ChunkKey {
    pub fn new(array: impl Into<String>, coords: impl Into<Vec<u64>>) -> Self {
        Self {
            array: array.into(),
            coords: coords.into(),
        }
    }

    /// Chunk coordinate string, `.`-separated
    pub fn chunk_id(&self) -> String {
        self.coords
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.array, self.chunk_id())
    }
}

/// Identity of one logical consumer registered with a fanout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}
