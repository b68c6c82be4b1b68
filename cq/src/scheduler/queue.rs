//! Queue types for the scheduler

use serde::Serialize;
use tokio::task::AbortHandle;

use crate::domain::Priority;

use super::action::BoxAction;
use super::handle::{RequestHandle, Settler};

/// Where a key currently sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Membership {
    /// Registered but not yet admitted (possibly waiting on a timer)
    Idle,

    /// Waiting in a lane
    Queued(Priority),

    /// Action executing
    Active,
}

/// A registered request for one key
pub(crate) struct RequestRecord<V> {
    pub(crate) id: u64,
    pub(crate) action: Option<BoxAction<V>>,
    pub(crate) settler: Settler<V>,
    pub(crate) handle: RequestHandle<V>,

    /// Lane to admit into; only ever raised from Low to Normal
    pub(crate) priority: Priority,
    pub(crate) membership: Membership,
    pub(crate) timer: Option<AbortHandle>,
}

impl<V> RequestRecord<V> {
    pub(crate) fn new(
        id: u64,
        action: BoxAction<V>,
        settler: Settler<V>,
        handle: RequestHandle<V>,
        priority: Priority,
    ) -> Self {
        Self {
            id,
            action: Some(action),
            settler,
            handle,
            priority,
            membership: Membership::Idle,
            timer: None,
        }
    }

    /// Abort the deferred-admission timer, if one is pending
    pub(crate) fn cancel_timer(&mut self) -> bool {
        match self.timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }
}

/// An executing action, tracked until it settles
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActiveRun {
    pub(crate) request_id: u64,
    pub(crate) priority: Priority,
}

/// How a call to `add_request` was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New record admitted straight into a lane
    Admitted,

    /// New record waiting on its admission timer
    Deferred,

    /// Existing record moved from the low lane to the back of the normal lane
    Promoted,

    /// Existing record admitted now, any pending timer cancelled
    Expedited,

    /// Existing record left as it was
    Unchanged,
}

/// Options for one `add_request` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub priority: Priority,
    pub delay_ms: u64,
}

impl RequestOptions {
    /// Normal priority, admitted immediately
    pub fn normal() -> Self {
        Self::default()
    }

    /// Low priority, admitted immediately
    pub fn low_priority() -> Self {
        Self {
            priority: Priority::Low,
            delay_ms: 0,
        }
    }

    /// Defer admission by `delay_ms`
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

/// Statistics for the scheduler
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub total_requests: u64,
    pub total_deduplicated: u64,
    pub total_promoted: u64,
    pub total_started: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_discarded: u64,
    pub peak_active: usize,
    pub peak_queue_depth: usize,
}

/// Queue state snapshot
#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    pub active: usize,
    pub active_low_priority: usize,
    pub queued_normal: usize,
    pub queued_low: usize,
    pub deferred: usize,
    pub stats: SchedulerStats,
}

impl QueueState {
    /// Keys waiting in either lane
    pub fn queued(&self) -> usize {
        self.queued_normal + self.queued_low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_options() {
        let opts = RequestOptions::low_priority().with_delay_ms(30);
        assert_eq!(opts.priority, Priority::Low);
        assert_eq!(opts.delay_ms, 30);

        let opts = RequestOptions::normal();
        assert_eq!(opts.priority, Priority::Normal);
        assert_eq!(opts.delay_ms, 0);
    }

    #[test]
    fn test_queue_state_queued() {
        let state = QueueState {
            active: 2,
            active_low_priority: 0,
            queued_normal: 3,
            queued_low: 4,
            deferred: 1,
            stats: SchedulerStats::default(),
        };
        assert_eq!(state.queued(), 7);
    }
}
