//! Scheduler implementation

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Result, eyre};
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::domain::{Priority, RequestKey};
use crate::error::FetchError;

use super::action::{Action, BoxAction};
use super::config::SchedulerConfig;
use super::handle::{RequestHandle, request_channel};
use super::queue::{ActiveRun, Admission, Membership, QueueState, RequestOptions, RequestRecord, SchedulerStats};

/// Internal state protected by mutex
struct SchedulerInner<K, V> {
    /// Normal-priority lane, FIFO
    normal: VecDeque<K>,

    /// Low-priority lane, FIFO
    low: VecDeque<K>,

    /// Currently executing actions, including ones whose record was cancelled
    active: HashMap<K, ActiveRun>,

    /// One record per registered key
    records: HashMap<K, RequestRecord<V>>,

    next_request_id: u64,

    stats: SchedulerStats,
}

impl<K: RequestKey, V> SchedulerInner<K, V> {
    fn new() -> Self {
        Self {
            normal: VecDeque::new(),
            low: VecDeque::new(),
            active: HashMap::new(),
            records: HashMap::new(),
            next_request_id: 1,
            stats: SchedulerStats::default(),
        }
    }

    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<K> {
        match priority {
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    /// Append `key` to the lane unless it is already queued or active
    fn admit(&mut self, key: &K, priority: Priority) -> bool {
        let Some(record) = self.records.get_mut(key) else {
            return false;
        };
        if record.membership != Membership::Idle {
            debug!(?key, membership = ?record.membership, "Scheduler::admit: already admitted");
            return false;
        }
        record.membership = Membership::Queued(priority);
        self.lane_mut(priority).push_back(key.clone());
        self.stats.peak_queue_depth = self.stats.peak_queue_depth.max(self.normal.len() + self.low.len());
        debug!(?key, %priority, "Scheduler::admit: queued");
        true
    }

    /// Move `key` from the low lane to the back of the normal lane
    fn promote(&mut self, key: &K) {
        remove_from_lane(&mut self.low, key);
        self.normal.push_back(key.clone());
        if let Some(record) = self.records.get_mut(key) {
            record.membership = Membership::Queued(Priority::Normal);
        }
        self.stats.total_promoted += 1;
        debug!(?key, position = self.normal.len(), "Scheduler::promote: moved to normal lane");
    }

    /// Pop the first key in the lane that has no run still in flight
    fn next_eligible(&mut self, priority: Priority) -> Option<K> {
        let active = &self.active;
        let lane = match priority {
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        };
        let position = lane.iter().position(|key| !active.contains_key(key))?;
        lane.remove(position)
    }

    /// Remove the record for `key`, failing its handle
    fn cancel(&mut self, key: &K, reason: &str) -> bool {
        let Some(mut record) = self.records.remove(key) else {
            return false;
        };
        record.cancel_timer();
        if let Membership::Queued(priority) = record.membership {
            remove_from_lane(self.lane_mut(priority), key);
        }
        record.settler.settle(Err(FetchError::cancelled(reason)));
        self.stats.total_cancelled += 1;
        debug!(?key, request_id = record.id, membership = ?record.membership, %reason, "Scheduler::cancel: cancelled");
        true
    }
}

fn remove_from_lane<K: PartialEq>(lane: &mut VecDeque<K>, key: &K) -> bool {
    match lane.iter().position(|k| k == key) {
        Some(position) => {
            lane.remove(position);
            true
        }
        None => false,
    }
}

struct Shared<K, V> {
    config: SchedulerConfig,
    inner: Mutex<SchedulerInner<K, V>>,
}

/// Admission-controlled queue with two priority lanes and bounded concurrency
///
/// Runs at most one action per key at a time, deduplicating concurrent
/// requests for the same key. Cloning is cheap; clones share one queue.
pub struct Scheduler<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for Scheduler<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> Scheduler<K, V>
where
    K: RequestKey,
    V: Clone + Send + Sync + 'static,
{
    /// Create a new scheduler with the given configuration
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        debug!(?config, "Scheduler::new: called");
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(SchedulerInner::new()),
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Request `key`, returning the single outstanding handle for it
    ///
    /// The first call for a key registers `action`; later calls for the same
    /// key never replace it, but may promote or expedite its admission.
    pub async fn add_request<A: Action<V>>(&self, key: K, action: A, options: RequestOptions) -> RequestHandle<V> {
        self.submit(key, Box::new(action), options).await.0
    }

    /// Like [`Scheduler::add_request`], also reporting how the call was handled
    pub async fn submit(
        &self,
        key: K,
        action: BoxAction<V>,
        options: RequestOptions,
    ) -> (RequestHandle<V>, Admission) {
        debug!(?key, ?options, "Scheduler::submit: called");
        let mut inner = self.shared.inner.lock().await;
        inner.stats.total_requests += 1;
        let immediate = options.delay_ms == 0;

        if let Some(record) = inner.records.get_mut(&key) {
            let handle = record.handle.clone();
            let upgraded = options.priority == Priority::Normal && record.priority.is_low();
            if upgraded {
                record.priority = Priority::Normal;
            }
            let admission = if upgraded && record.membership == Membership::Queued(Priority::Low) {
                record.cancel_timer();
                inner.promote(&key);
                Admission::Promoted
            } else if immediate && record.cancel_timer() {
                let priority = record.priority;
                inner.admit(&key, priority);
                Admission::Expedited
            } else {
                Admission::Unchanged
            };
            inner.stats.total_deduplicated += 1;
            debug!(?key, request_id = handle.id(), ?admission, "Scheduler::submit: existing request");

            if admission != Admission::Unchanged {
                self.drain(&mut inner);
            }
            return (handle, admission);
        }

        let request_id = inner.next_request_id;
        inner.next_request_id += 1;
        let (settler, handle) = request_channel(request_id);
        let mut record = RequestRecord::new(request_id, action, settler, handle.clone(), options.priority);

        let admission = if immediate {
            inner.records.insert(key.clone(), record);
            inner.admit(&key, options.priority);
            self.drain(&mut inner);
            Admission::Admitted
        } else {
            let delay = Duration::from_millis(options.delay_ms);
            record.timer = Some(self.start_timer(key.clone(), request_id, delay));
            inner.records.insert(key.clone(), record);
            Admission::Deferred
        };

        debug!(?key, request_id, ?admission, "Scheduler::submit: new request");
        (handle, admission)
    }

    /// Bulk form of `add_request`; entry `i` is deferred by `stagger_ms * i`
    ///
    /// `stagger_ms` falls back to the configured stagger.
    pub async fn add_requests<I>(&self, requests: I, priority: Priority, stagger_ms: Option<u64>) -> Vec<RequestHandle<V>>
    where
        I: IntoIterator<Item = (K, BoxAction<V>)>,
    {
        let stagger_ms = stagger_ms.unwrap_or(self.shared.config.stagger_ms);
        debug!(%priority, stagger_ms, "Scheduler::add_requests: called");

        let mut handles = Vec::new();
        for (index, (key, action)) in requests.into_iter().enumerate() {
            let options = RequestOptions {
                priority,
                delay_ms: stagger_ms.saturating_mul(index as u64),
            };
            handles.push(self.submit(key, action, options).await.0);
        }
        handles
    }

    /// Cancel `key`: drop it from its lane and fail its handle with `reason`
    ///
    /// An action that already started keeps running; its result is discarded.
    pub async fn cancel_request(&self, key: &K, reason: &str) -> bool {
        debug!(?key, %reason, "Scheduler::cancel_request: called");
        let mut inner = self.shared.inner.lock().await;
        inner.cancel(key, reason)
    }

    /// Cancel request `request_id` for `key` only if its action has not started
    pub async fn cancel_if_pending(&self, key: &K, request_id: u64, reason: &str) -> bool {
        debug!(?key, request_id, %reason, "Scheduler::cancel_if_pending: called");
        let mut inner = self.shared.inner.lock().await;

        let pending = inner
            .records
            .get(key)
            .is_some_and(|record| record.id == request_id && record.membership != Membership::Active);
        if !pending {
            debug!(?key, request_id, "Scheduler::cancel_if_pending: running or gone, leaving it");
            return false;
        }
        inner.cancel(key, reason)
    }

    /// Clear both lanes and cancel every registered key
    pub async fn cancel_all_requests(&self, reason: &str) -> usize {
        debug!(%reason, "Scheduler::cancel_all_requests: called");
        let mut inner = self.shared.inner.lock().await;

        inner.normal.clear();
        inner.low.clear();
        let keys: Vec<K> = inner.records.keys().cloned().collect();
        let mut cancelled = 0;
        for key in &keys {
            if inner.cancel(key, reason) {
                cancelled += 1;
            }
        }

        info!(cancelled, %reason, "Cancelled all requests");
        cancelled
    }

    /// Check if `key` has a registered request
    pub async fn has_request(&self, key: &K) -> bool {
        self.shared.inner.lock().await.records.contains_key(key)
    }

    /// Check if the request registered for `key` is executing
    pub async fn request_running(&self, key: &K) -> bool {
        let inner = self.shared.inner.lock().await;
        inner
            .records
            .get(key)
            .is_some_and(|record| record.membership == Membership::Active)
    }

    /// Get current queue state
    pub async fn queue_state(&self) -> QueueState {
        let inner = self.shared.inner.lock().await;
        QueueState {
            active: inner.active.len(),
            active_low_priority: inner.active.values().filter(|run| run.priority.is_low()).count(),
            queued_normal: inner.normal.len(),
            queued_low: inner.low.len(),
            deferred: inner.records.values().filter(|record| record.timer.is_some()).count(),
            stats: inner.stats.clone(),
        }
    }

    /// Get the scheduler statistics
    pub async fn stats(&self) -> SchedulerStats {
        self.shared.inner.lock().await.stats.clone()
    }

    /// Pull eligible keys into the active set while capacity allows
    fn drain(&self, inner: &mut SchedulerInner<K, V>) {
        let config = &self.shared.config;
        while inner.active.len() < config.max_active {
            let next = match inner.next_eligible(Priority::Normal) {
                Some(key) => Some((key, Priority::Normal)),
                None if inner.active.len() < config.max_low_priority => {
                    inner.next_eligible(Priority::Low).map(|key| (key, Priority::Low))
                }
                None => None,
            };
            let Some((key, priority)) = next else {
                break;
            };
            self.start(inner, key, priority);
        }
    }

    /// Mark `key` active and run its action on its own task
    fn start(&self, inner: &mut SchedulerInner<K, V>, key: K, priority: Priority) {
        let Some(record) = inner.records.get_mut(&key) else {
            warn!(?key, "Scheduler::start: queued key has no record");
            return;
        };
        let Some(action) = record.action.take() else {
            warn!(?key, request_id = record.id, "Scheduler::start: action already taken");
            return;
        };
        record.membership = Membership::Active;
        let request_id = record.id;

        inner.active.insert(key.clone(), ActiveRun { request_id, priority });
        inner.stats.total_started += 1;
        inner.stats.peak_active = inner.stats.peak_active.max(inner.active.len());
        debug!(?key, request_id, %priority, active = inner.active.len(), "Scheduler::start: running action");

        let scheduler = self.clone();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(async move { action.run().await }).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(eyre!("action panicked")),
            };
            scheduler.settle(key, request_id, result).await;
        });
    }

    /// Record the result of a finished action and pull in the next key
    async fn settle(&self, key: K, request_id: u64, result: Result<V>) {
        let mut inner = self.shared.inner.lock().await;

        if inner.active.get(&key).is_some_and(|run| run.request_id == request_id) {
            inner.active.remove(&key);
        }

        let current = inner.records.get(&key).is_some_and(|record| record.id == request_id);
        let record = if current { inner.records.remove(&key) } else { None };
        match record {
            Some(record) => match result {
                Ok(value) => {
                    inner.stats.total_completed += 1;
                    debug!(?key, request_id, "Scheduler::settle: completed");
                    record.settler.settle(Ok(value));
                }
                Err(e) => {
                    inner.stats.total_failed += 1;
                    warn!(?key, request_id, error = %e, "Action failed");
                    record.settler.settle(Err(FetchError::action(e)));
                }
            },
            None => {
                inner.stats.total_discarded += 1;
                debug!(?key, request_id, "Scheduler::settle: request was cancelled, discarding result");
            }
        }

        self.drain(&mut inner);
    }

    /// Spawn the one-shot timer that admits a deferred request
    fn start_timer(&self, key: K, request_id: u64, delay: Duration) -> AbortHandle {
        debug!(?key, request_id, ?delay, "Scheduler::start_timer: called");
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.admit_deferred(key, request_id).await;
        })
        .abort_handle()
    }

    async fn admit_deferred(&self, key: K, request_id: u64) {
        let mut inner = self.shared.inner.lock().await;
        let Some(record) = inner.records.get_mut(&key) else {
            debug!(?key, request_id, "Scheduler::admit_deferred: record gone");
            return;
        };
        if record.id != request_id || record.timer.take().is_none() {
            debug!(?key, request_id, "Scheduler::admit_deferred: superseded timer");
            return;
        }
        let priority = record.priority;
        inner.admit(&key, priority);
        self.drain(&mut inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    type TestScheduler = Scheduler<&'static str, String>;

    fn scheduler(max_active: usize, max_low_priority: usize) -> TestScheduler {
        Scheduler::new(SchedulerConfig::with_limits(max_active, max_low_priority)).unwrap()
    }

    /// Action that counts its invocation, then waits for the gate to open
    fn gated(value: &str, calls: &Arc<AtomicUsize>) -> (oneshot::Sender<()>, impl Action<String> + use<>) {
        let (tx, rx) = oneshot::channel::<()>();
        let calls = Arc::clone(calls);
        let value = value.to_string();
        let action = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            rx.await.map_err(|_| eyre!("gate dropped"))?;
            Ok::<_, eyre::Report>(value)
        };
        (tx, action)
    }

    fn counting(value: &str, calls: &Arc<AtomicUsize>) -> impl Action<String> + use<> {
        let calls = Arc::clone(calls);
        let value = value.to_string();
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, eyre::Report>(value)
        }
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_limits() {
        assert!(TestScheduler::new(SchedulerConfig::with_limits(1, 2)).is_err());
        assert!(TestScheduler::new(SchedulerConfig::with_limits(0, 0)).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_limit() {
        let scheduler = scheduler(2, 2);
        let calls = Arc::new(AtomicUsize::new(0));

        let (gate_a, a) = gated("a", &calls);
        let (_gate_b, b) = gated("b", &calls);
        let (_gate_c, c) = gated("c", &calls);
        let handle_a = scheduler.add_request("a", a, RequestOptions::normal()).await;
        scheduler.add_request("b", b, RequestOptions::normal()).await;
        scheduler.add_request("c", c, RequestOptions::normal()).await;

        assert!(scheduler.request_running(&"a").await);
        assert!(scheduler.request_running(&"b").await);
        assert!(!scheduler.request_running(&"c").await);
        assert_eq!(scheduler.queue_state().await.queued_normal, 1);

        gate_a.send(()).unwrap();
        assert_eq!(handle_a.await.unwrap(), "a");

        assert!(scheduler.request_running(&"c").await);
        assert!(!scheduler.has_request(&"a").await);

        let state = scheduler.queue_state().await;
        assert_eq!(state.active, 2);
        assert_eq!(state.queued(), 0);
    }

    #[tokio::test]
    async fn test_normal_lane_drains_before_low() {
        let scheduler = scheduler(2, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let (gate_a, a) = gated("A", &calls);
        let (gate_b, b) = gated("B", &calls);
        let (gate_c, c) = gated("C", &calls);
        let (_gate_d, d) = gated("D", &calls);
        let handle_a = scheduler.add_request("A", a, RequestOptions::normal()).await;
        let handle_b = scheduler.add_request("B", b, RequestOptions::normal()).await;
        let handle_c = scheduler.add_request("C", c, RequestOptions::normal()).await;
        scheduler.add_request("D", d, RequestOptions::low_priority()).await;

        assert!(scheduler.request_running(&"A").await);
        assert!(scheduler.request_running(&"B").await);
        assert!(!scheduler.request_running(&"C").await);
        assert!(!scheduler.request_running(&"D").await);

        gate_a.send(()).unwrap();
        handle_a.await.unwrap();
        assert!(scheduler.request_running(&"C").await);
        assert!(!scheduler.request_running(&"D").await);

        // One active key left: still not below the low-priority sub-limit
        gate_b.send(()).unwrap();
        handle_b.await.unwrap();
        assert!(!scheduler.request_running(&"D").await);

        gate_c.send(()).unwrap();
        handle_c.await.unwrap();
        assert!(scheduler.request_running(&"D").await);

        let state = scheduler.queue_state().await;
        assert_eq!(state.active, 1);
        assert_eq!(state.active_low_priority, 1);
    }

    #[tokio::test]
    async fn test_duplicate_requests_share_one_action() {
        let scheduler = scheduler(4, 2);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut gates = Vec::new();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let scheduler = scheduler.clone();
            let (gate, action) = gated("chunk", &calls);
            gates.push(gate);
            tasks.push(tokio::spawn(async move {
                scheduler.add_request("k", action, RequestOptions::normal()).await
            }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert!(handles.iter().all(|handle| handle.id() == handles[0].id()));

        for gate in gates {
            let _ = gate.send(());
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "chunk");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = scheduler.stats().await;
        assert_eq!(stats.total_started, 1);
    }

    #[tokio::test]
    async fn test_repeated_calls_return_same_handle() {
        let scheduler = scheduler(1, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let (_gate, blocker) = gated("blocker", &calls);
        scheduler.add_request("blocker", blocker, RequestOptions::normal()).await;

        let first = scheduler.add_request("k", counting("first", &calls), RequestOptions::normal()).await;
        let (second, admission) = scheduler
            .submit("k", Box::new(counting("second", &calls)), RequestOptions::normal())
            .await;

        assert_eq!(first.id(), second.id());
        assert_eq!(admission, Admission::Unchanged);
        assert_eq!(scheduler.queue_state().await.queued_normal, 1);
    }

    #[tokio::test]
    async fn test_promotion_goes_to_back_of_normal_lane() {
        let scheduler = scheduler(1, 1);
        let calls = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let (gate, blocker) = gated("blocker", &calls);
        let blocker_handle = scheduler.add_request("blocker", blocker, RequestOptions::normal()).await;

        let recorder = |name: &'static str| {
            let order = Arc::clone(&order);
            move || async move {
                order.lock().unwrap().push(name);
                Ok::<_, eyre::Report>(name.to_string())
            }
        };

        scheduler.add_request("low", recorder("low"), RequestOptions::low_priority()).await;
        scheduler.add_request("n1", recorder("n1"), RequestOptions::normal()).await;
        scheduler.add_request("n2", recorder("n2"), RequestOptions::normal()).await;
        let (low_handle, admission) = scheduler
            .submit("low", Box::new(recorder("unused")), RequestOptions::normal())
            .await;
        assert_eq!(admission, Admission::Promoted);

        let state = scheduler.queue_state().await;
        assert_eq!(state.queued_normal, 3);
        assert_eq!(state.queued_low, 0);

        gate.send(()).unwrap();
        blocker_handle.await.unwrap();
        assert_eq!(low_handle.await.unwrap(), "low");

        assert_eq!(*order.lock().unwrap(), vec!["n1", "n2", "low"]);
        assert_eq!(scheduler.stats().await.total_promoted, 1);
    }

    #[tokio::test]
    async fn test_promotion_leaves_no_pending_timer() {
        let scheduler = scheduler(1, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let (_gate, blocker) = gated("blocker", &calls);
        scheduler.add_request("blocker", blocker, RequestOptions::normal()).await;

        scheduler.add_request("k", counting("k", &calls), RequestOptions::low_priority()).await;
        let (_, admission) = scheduler
            .submit("k", Box::new(counting("k", &calls)), RequestOptions::normal().with_delay_ms(20))
            .await;
        assert_eq!(admission, Admission::Promoted);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let state = scheduler.queue_state().await;
        assert_eq!(state.queued_normal, 1);
        assert_eq!(state.queued_low, 0);
        assert_eq!(state.deferred, 0);
    }

    #[tokio::test]
    async fn test_deferred_admission() {
        let scheduler = scheduler(2, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let (handle, admission) = scheduler
            .submit("k", Box::new(counting("late", &calls)), RequestOptions::normal().with_delay_ms(30))
            .await;
        assert_eq!(admission, Admission::Deferred);
        assert!(scheduler.has_request(&"k").await);
        assert_eq!(scheduler.queue_state().await.deferred, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(handle.await.unwrap(), "late");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deferred_request_delayed_again_is_unchanged() {
        let scheduler = scheduler(2, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        scheduler
            .add_request("k", counting("k", &calls), RequestOptions::normal().with_delay_ms(500))
            .await;
        let (_, admission) = scheduler
            .submit("k", Box::new(counting("k", &calls)), RequestOptions::normal().with_delay_ms(10))
            .await;
        assert_eq!(admission, Admission::Unchanged);
        assert_eq!(scheduler.queue_state().await.deferred, 1);
    }

    #[tokio::test]
    async fn test_deferred_low_request_raised_to_normal() {
        let scheduler = scheduler(1, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let (_gate, blocker) = gated("blocker", &calls);
        scheduler.add_request("blocker", blocker, RequestOptions::normal()).await;

        scheduler
            .add_request("k", counting("k", &calls), RequestOptions::low_priority().with_delay_ms(20))
            .await;
        let (_, admission) = scheduler
            .submit("k", Box::new(counting("k", &calls)), RequestOptions::normal().with_delay_ms(20))
            .await;
        assert_eq!(admission, Admission::Unchanged);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let state = scheduler.queue_state().await;
        assert_eq!(state.deferred, 0);
        assert_eq!(state.queued_normal, 1);
        assert_eq!(state.queued_low, 0);
    }

    #[tokio::test]
    async fn test_immediate_request_cancels_timer() {
        let scheduler = scheduler(1, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let (_gate, blocker) = gated("blocker", &calls);
        scheduler.add_request("blocker", blocker, RequestOptions::normal()).await;

        scheduler
            .add_request("k", counting("k", &calls), RequestOptions::normal().with_delay_ms(20))
            .await;
        let (_, admission) = scheduler
            .submit("k", Box::new(counting("k", &calls)), RequestOptions::normal())
            .await;
        assert_eq!(admission, Admission::Expedited);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let state = scheduler.queue_state().await;
        assert_eq!(state.queued_normal, 1);
        assert_eq!(state.deferred, 0);
    }

    #[tokio::test]
    async fn test_add_requests_staggers_admission() {
        let scheduler = scheduler(4, 4);
        let calls = Arc::new(AtomicUsize::new(0));

        let requests: Vec<(&'static str, BoxAction<String>)> = ["a", "b", "c"]
            .into_iter()
            .map(|key| (key, Box::new(counting(key, &calls)) as BoxAction<String>))
            .collect();
        let handles = scheduler.add_requests(requests, Priority::Low, Some(50)).await;

        let state = scheduler.queue_state().await;
        assert_eq!(state.deferred, 2);

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap());
        }
        assert_eq!(values, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_cancel_queued_request() {
        let scheduler = scheduler(1, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let (gate, blocker) = gated("blocker", &calls);
        let blocker_handle = scheduler.add_request("blocker", blocker, RequestOptions::normal()).await;
        let queued = scheduler.add_request("k", counting("k", &calls), RequestOptions::normal()).await;

        assert!(scheduler.cancel_request(&"k", "viewport moved").await);
        assert!(!scheduler.cancel_request(&"k", "again").await);

        let err = queued.await.unwrap_err();
        assert_eq!(err.cancel_reason(), Some("viewport moved"));
        assert_eq!(scheduler.queue_state().await.queued(), 0);

        gate.send(()).unwrap();
        blocker_handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_deferred_request_never_admits() {
        let scheduler = scheduler(2, 2);
        let calls = Arc::new(AtomicUsize::new(0));

        let handle = scheduler
            .add_request("k", counting("k", &calls), RequestOptions::normal().with_delay_ms(20))
            .await;
        assert!(scheduler.cancel_request(&"k", "gone").await);
        assert!(handle.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.queue_state().await.active, 0);
    }

    #[tokio::test]
    async fn test_cancel_running_request_detaches() {
        let scheduler = scheduler(2, 2);
        let calls = Arc::new(AtomicUsize::new(0));

        let (gate, action) = gated("k", &calls);
        let handle = scheduler.add_request("k", action, RequestOptions::normal()).await;
        assert!(scheduler.request_running(&"k").await);

        assert!(scheduler.cancel_request(&"k", "no longer needed").await);
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(!scheduler.has_request(&"k").await);

        // In-flight work still holds its slot until it settles
        assert_eq!(scheduler.queue_state().await.active, 1);
        gate.send(()).unwrap();

        for _ in 0..100 {
            if scheduler.queue_state().await.active == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let state = scheduler.queue_state().await;
        assert_eq!(state.active, 0);
        assert_eq!(state.stats.total_discarded, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rerequest_waits_for_cancelled_run() {
        let scheduler = scheduler(2, 2);
        let calls = Arc::new(AtomicUsize::new(0));

        let (gate, first) = gated("first", &calls);
        scheduler.add_request("k", first, RequestOptions::normal()).await;
        scheduler.cancel_request(&"k", "moved").await;

        let second = scheduler.add_request("k", counting("second", &calls), RequestOptions::normal()).await;
        assert!(!scheduler.request_running(&"k").await);
        assert_eq!(scheduler.queue_state().await.queued_normal, 1);

        gate.send(()).unwrap();
        assert_eq!(second.await.unwrap(), "second");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_if_pending() {
        let scheduler = scheduler(1, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let (_gate, running) = gated("running", &calls);
        let running = scheduler.add_request("running", running, RequestOptions::normal()).await;
        let queued = scheduler.add_request("queued", counting("q", &calls), RequestOptions::normal()).await;

        assert!(!scheduler.cancel_if_pending(&"running", running.id(), "x").await);
        assert!(!scheduler.cancel_if_pending(&"queued", queued.id() + 100, "x").await);
        assert!(scheduler.cancel_if_pending(&"queued", queued.id(), "x").await);
        assert!(scheduler.has_request(&"running").await);
        assert!(!scheduler.has_request(&"queued").await);
    }

    #[tokio::test]
    async fn test_cancel_all_requests() {
        let scheduler = scheduler(1, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let (_gate, running) = gated("a", &calls);
        let a = scheduler.add_request("a", running, RequestOptions::normal()).await;
        let b = scheduler.add_request("b", counting("b", &calls), RequestOptions::normal()).await;
        let c = scheduler.add_request("c", counting("c", &calls), RequestOptions::low_priority()).await;
        let d = scheduler
            .add_request("d", counting("d", &calls), RequestOptions::normal().with_delay_ms(50))
            .await;

        assert_eq!(scheduler.cancel_all_requests("shutdown").await, 4);
        for handle in [a, b, c, d] {
            assert_eq!(handle.await.unwrap_err().cancel_reason(), Some("shutdown"));
        }

        let state = scheduler.queue_state().await;
        assert_eq!(state.queued(), 0);
        assert_eq!(state.deferred, 0);
        assert_eq!(state.stats.total_cancelled, 4);
    }

    #[tokio::test]
    async fn test_action_failure_reaches_handle() {
        let scheduler = scheduler(1, 1);
        let handle = scheduler
            .add_request(
                "k",
                || async { Err::<String, _>(eyre!("HTTP 404 for chunk k")) },
                RequestOptions::normal(),
            )
            .await;

        let err = handle.await.unwrap_err();
        assert!(err.to_string().contains("HTTP 404"));
        assert!(!scheduler.has_request(&"k").await);
        assert_eq!(scheduler.stats().await.total_failed, 1);
    }

    #[tokio::test]
    async fn test_panicking_action_frees_slot() {
        let scheduler = scheduler(1, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let bad = scheduler
            .add_request(
                "bad",
                || async {
                    if true {
                        panic!("decoder bug");
                    }
                    Ok::<String, eyre::Report>(String::new())
                },
                RequestOptions::normal(),
            )
            .await;
        let next = scheduler.add_request("next", counting("next", &calls), RequestOptions::normal()).await;

        assert!(bad.await.unwrap_err().to_string().contains("panicked"));
        assert_eq!(next.await.unwrap(), "next");
    }
}
