//! Synthetic viewer workload driven through a fanout

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use eyre::{Context, Result, eyre};
use futures::future::join_all;
use rand::Rng;
use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::domain::{ChunkKey, SubscriberId};
use crate::error::FetchError;
use crate::fanout::{Fanout, Subscription};
use crate::scheduler::{Action, RequestOptions, SchedulerConfig};

use super::report::{SimulationReport, SubscriberReport};
use super::source::{Chunk, ChunkSource};

/// How long to wait for in-flight fetches after every subscription settled
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Reason given to listeners of a viewer that is torn down mid-run
pub const VIEWER_CLOSED: &str = "viewer closed";

/// Subscriptions one consumer is still waiting on
struct Pending {
    name: String,
    subscriber: SubscriberId,
    subscriptions: Vec<Subscription<Chunk>>,
}

impl Pending {
    async fn tally(self) -> SubscriberReport {
        let mut report = SubscriberReport::new(self.name, self.subscriber, self.subscriptions.len());
        for outcome in join_all(self.subscriptions).await {
            match outcome {
                Ok(chunk) => {
                    report.delivered += 1;
                    report.bytes += chunk.bytes;
                }
                Err(FetchError::Cancelled { .. }) => report.cancelled += 1,
                Err(_) => report.failed += 1,
            }
        }
        report
    }
}

/// Milliseconds in `elapsed`, saturating at `u64::MAX`
fn whole_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// A seeded run of viewers, prefetch and teardown against one chunk source
pub struct Simulation {
    scheduler: SchedulerConfig,
    workload: SimulationConfig,
    seed: u64,
}

impl Simulation {
    /// Build a simulation, drawing a seed if the workload has none
    pub fn new(scheduler: SchedulerConfig, workload: SimulationConfig) -> Result<Self> {
        scheduler.validate().context("Invalid scheduler configuration")?;
        workload.validate().context("Invalid simulation configuration")?;
        let seed = workload.seed.unwrap_or_else(|| rand::rng().random());
        debug!(?scheduler, ?workload, seed, "Simulation::new: called");
        Ok(Self {
            scheduler,
            workload,
            seed,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Chunk at a linear position, wrapping around the grid
    fn chunk_at(&self, index: usize) -> ChunkKey {
        let grid = self.workload.grid_size;
        let linear = index as u64 % self.workload.grid_chunks();
        ChunkKey::new(self.workload.array.clone(), vec![linear / grid, linear % grid])
    }

    /// Keys covered by viewer `viewer`; neighbours share `overlap` chunks
    fn viewport(&self, viewer: usize) -> Vec<ChunkKey> {
        let stride = self.workload.chunks_per_viewer - self.workload.overlap;
        let start = viewer * stride;
        (start..start + self.workload.chunks_per_viewer)
            .map(|index| self.chunk_at(index))
            .collect()
    }

    /// Keys just past the last viewport, fetched ahead at low priority
    fn prefetch_window(&self) -> Vec<ChunkKey> {
        let stride = self.workload.chunks_per_viewer - self.workload.overlap;
        let start = (self.workload.viewers - 1) * stride + self.workload.chunks_per_viewer;
        (start..start + self.workload.prefetch)
            .map(|index| self.chunk_at(index))
            .collect()
    }

    /// Drive the workload to completion and summarize it
    pub async fn run(&self, source: Arc<dyn ChunkSource>) -> Result<SimulationReport> {
        info!(seed = self.seed, viewers = self.workload.viewers, "Simulation starting");
        let started = Instant::now();
        let fanout: Fanout<ChunkKey, Chunk> = Fanout::new(self.scheduler.clone())?;
        let actions_run = Arc::new(AtomicUsize::new(0));
        let mut unique = HashSet::new();
        let mut pending = Vec::with_capacity(self.workload.viewers);

        for viewer in 0..self.workload.viewers {
            let subscriber = fanout.add_subscriber().await;
            let mut subscriptions = Vec::with_capacity(self.workload.chunks_per_viewer);
            for key in self.viewport(viewer) {
                unique.insert(key.clone());
                let action = fetch_action(&source, key.clone(), &actions_run);
                subscriptions.push(
                    fanout
                        .add_request(key, subscriber, action, RequestOptions::normal())
                        .await?,
                );
            }
            debug!(viewer, %subscriber, requested = subscriptions.len(), "Simulation::run: viewer registered");
            pending.push(Pending {
                name: format!("viewer-{viewer}"),
                subscriber,
                subscriptions,
            });
        }

        let prefetch = if self.workload.prefetch > 0 {
            let subscriber = fanout.add_subscriber().await;
            let mut subscriptions = Vec::with_capacity(self.workload.prefetch);
            for key in self.prefetch_window() {
                unique.insert(key.clone());
                let action = fetch_action(&source, key.clone(), &actions_run);
                subscriptions.push(
                    fanout
                        .add_request(key, subscriber, action, RequestOptions::low_priority())
                        .await?,
                );
            }
            Some(Pending {
                name: "prefetch".to_string(),
                subscriber,
                subscriptions,
            })
        } else {
            None
        };

        let teardown = match (self.workload.teardown_after_ms, pending.last()) {
            (Some(after_ms), Some(last)) if self.workload.viewers > 1 => {
                let fanout = fanout.clone();
                let subscriber = last.subscriber;
                Some(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(after_ms)).await;
                    fanout.remove_subscriber(subscriber, VIEWER_CLOSED).await
                }))
            }
            _ => None,
        };

        let viewers = join_all(pending.into_iter().map(Pending::tally)).await;
        let prefetch = match prefetch {
            Some(pending) => Some(pending.tally().await),
            None => None,
        };
        let torn_down = match teardown {
            Some(task) => Some(task.await.context("Viewer teardown task failed")?),
            None => None,
        };
        debug!(?torn_down, "Simulation::run: all subscriptions settled");

        tokio::time::timeout(DRAIN_TIMEOUT, wait_until_drained(&fanout))
            .await
            .map_err(|_| eyre!("Scheduler did not drain within {:?}", DRAIN_TIMEOUT))?;

        let queue = fanout.queue_state().await;
        let report = SimulationReport {
            seed: self.seed,
            unique_keys: unique.len(),
            actions_run: actions_run.load(Ordering::SeqCst),
            store_fetches: source.fetch_count(),
            elapsed_ms: whole_millis(started.elapsed()),
            torn_down,
            viewers,
            prefetch,
            scheduler: queue.stats,
            fanout: fanout.stats().await,
        };
        info!(
            unique_keys = report.unique_keys,
            actions_run = report.actions_run,
            elapsed_ms = report.elapsed_ms,
            "Simulation finished"
        );
        Ok(report)
    }
}

fn fetch_action(source: &Arc<dyn ChunkSource>, key: ChunkKey, runs: &Arc<AtomicUsize>) -> impl Action<Chunk> + use<> {
    let source = Arc::clone(source);
    let runs = Arc::clone(runs);
    move || async move {
        runs.fetch_add(1, Ordering::SeqCst);
        source.fetch(&key).await
    }
}

async fn wait_until_drained(fanout: &Fanout<ChunkKey, Chunk>) {
    loop {
        let state = fanout.queue_state().await;
        if state.active == 0 && state.queued() == 0 && state.deferred == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
