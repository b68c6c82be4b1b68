//! Chunk sources

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, eyre};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::ChunkKey;

/// One fetched chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub key: ChunkKey,
    pub bytes: usize,
    pub checksum: u64,
}

/// Remote store that chunks are fetched from
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Fetch a single chunk
    async fn fetch(&self, key: &ChunkKey) -> Result<Chunk>;

    /// Number of fetches that reached the store
    fn fetch_count(&self) -> usize;
}

/// In-memory store with random latency and failures
pub struct SimulatedStore {
    latency_ms: RangeInclusive<u64>,
    failure_rate: f64,
    chunk_bytes: usize,
    rng: Mutex<StdRng>,
    fetches: AtomicUsize,
}

impl SimulatedStore {
    pub fn new(latency_ms: RangeInclusive<u64>, failure_rate: f64, seed: u64) -> Self {
        debug!(?latency_ms, failure_rate, seed, "SimulatedStore::new: called");
        Self {
            latency_ms,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            chunk_bytes: 64 * 64 * 2,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            fetches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ChunkSource for SimulatedStore {
    async fn fetch(&self, key: &ChunkKey) -> Result<Chunk> {
        let (latency, fail) = {
            let mut rng = self.rng.lock().await;
            (
                rng.random_range(self.latency_ms.clone()),
                rng.random_bool(self.failure_rate),
            )
        };
        self.fetches.fetch_add(1, Ordering::SeqCst);
        debug!(%key, latency, fail, "SimulatedStore::fetch: called");

        tokio::time::sleep(Duration::from_millis(latency)).await;
        if fail {
            return Err(eyre!("store returned 503 for {}", key));
        }

        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        Ok(Chunk {
            key: key.clone(),
            bytes: self.chunk_bytes,
            checksum: hasher.finish(),
        })
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}
