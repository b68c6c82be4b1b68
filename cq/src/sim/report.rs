//! Simulation summary

use colored::Colorize;
use serde::Serialize;

use crate::domain::SubscriberId;
use crate::fanout::FanoutStats;
use crate::scheduler::SchedulerStats;

/// Outcome counts for one subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberReport {
    pub name: String,
    pub subscriber: String,
    pub requested: usize,
    pub delivered: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub bytes: usize,
}

impl SubscriberReport {
    pub fn new(name: impl Into<String>, subscriber: SubscriberId, requested: usize) -> Self {
        Self {
            name: name.into(),
            subscriber: subscriber.to_string(),
            requested,
            delivered: 0,
            cancelled: 0,
            failed: 0,
            bytes: 0,
        }
    }
}

/// Summary of one simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub seed: u64,
    pub unique_keys: usize,
    pub actions_run: usize,
    pub store_fetches: usize,
    pub elapsed_ms: u64,

    /// Listeners cancelled by the mid-run teardown, if one happened
    pub torn_down: Option<usize>,

    pub viewers: Vec<SubscriberReport>,
    pub prefetch: Option<SubscriberReport>,
    pub scheduler: SchedulerStats,
    pub fanout: FanoutStats,
}

impl SimulationReport {
    /// Listener requests made across every subscriber
    pub fn total_requested(&self) -> usize {
        self.subscribers().map(|s| s.requested).sum()
    }

    fn subscribers(&self) -> impl Iterator<Item = &SubscriberReport> {
        self.viewers.iter().chain(self.prefetch.iter())
    }

    /// Render for humans
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{}\n", "Chunkqueue Simulation".bright_cyan().bold()));
        out.push_str("---------------------\n");
        out.push_str(&format!("Seed:          {}\n", self.seed));
        out.push_str(&format!("Elapsed:       {} ms\n", self.elapsed_ms));
        out.push_str(&format!(
            "Requests:      {} listener requests over {} unique chunks\n",
            self.total_requested(),
            self.unique_keys
        ));
        out.push_str(&format!(
            "Fetches:       {} actions run, {} reached the store\n",
            self.actions_run, self.store_fetches
        ));
        if let Some(cancelled) = self.torn_down {
            out.push_str(&format!("Teardown:      {} listeners cancelled\n", cancelled));
        }
        out.push('\n');

        out.push_str(&format!(
            "  {:<10} {:<8} {:>9} {:>9} {:>9} {:>9}\n",
            "NAME", "ID", "REQUESTED", "DELIVERED", "CANCELLED", "FAILED"
        ));
        for sub in self.subscribers() {
            let failed = if sub.failed > 0 {
                format!("{:>9}", sub.failed).red().to_string()
            } else {
                format!("{:>9}", sub.failed)
            };
            let cancelled = if sub.cancelled > 0 {
                format!("{:>9}", sub.cancelled).yellow().to_string()
            } else {
                format!("{:>9}", sub.cancelled)
            };
            out.push_str(&format!(
                "  {:<10} {:<8} {:>9} {} {} {}\n",
                sub.name,
                sub.subscriber,
                sub.requested,
                format!("{:>9}", sub.delivered).green(),
                cancelled,
                failed
            ));
        }
        out.push('\n');

        let s = &self.scheduler;
        out.push_str(&format!("{}\n", "Scheduler".bold()));
        out.push_str(&format!(
            "  admitted {}  deduplicated {}  promoted {}\n",
            s.total_requests, s.total_deduplicated, s.total_promoted
        ));
        out.push_str(&format!(
            "  started {}  completed {}  failed {}  cancelled {}  discarded {}\n",
            s.total_started, s.total_completed, s.total_failed, s.total_cancelled, s.total_discarded
        ));
        out.push_str(&format!(
            "  peak active {}  peak queue depth {}\n",
            s.peak_active, s.peak_queue_depth
        ));

        let f = &self.fanout;
        out.push_str(&format!("{}\n", "Fanout".bold()));
        out.push_str(&format!(
            "  subscriptions {}  coalesced {}  settled {}  cancelled {}  abandoned {}\n",
            f.total_subscriptions, f.total_coalesced, f.total_settled, f.total_cancelled, f.total_abandoned
        ));
        out
    }

    /// Render as pretty JSON
    pub fn to_json(&self) -> eyre::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
