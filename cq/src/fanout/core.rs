//! Fanout implementation

use std::collections::HashMap;
use std::sync::Arc;

use eyre::Result;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

use crate::domain::{RequestKey, SubscriberId};
use crate::error::FetchError;
use crate::scheduler::{Action, Outcome, QueueState, RequestHandle, RequestOptions, Scheduler, SchedulerConfig};

use super::subscription::{FanoutStats, Subscription};

/// One subscriber's registered interest in one key
struct Listener<V> {
    id: u64,
    subscriber: SubscriberId,
    tx: oneshot::Sender<Outcome<V>>,
}

/// Listeners of one key, bound to the scheduler request they wait on
struct KeyListeners<V> {
    request: RequestHandle<V>,
    listeners: Vec<Listener<V>>,
}

/// Internal state protected by mutex
struct FanoutInner<K, V> {
    next_subscriber: u64,
    next_listener: u64,

    /// Subscriber -> key -> listener ids, in registration order
    subscribers: HashMap<SubscriberId, HashMap<K, Vec<u64>>>,

    /// Key -> listeners; the list length is the key's reference count
    listeners: HashMap<K, KeyListeners<V>>,

    stats: FanoutStats,
}

impl<K: RequestKey, V: Clone> FanoutInner<K, V> {
    fn new() -> Self {
        Self {
            next_subscriber: 1,
            next_listener: 1,
            subscribers: HashMap::new(),
            listeners: HashMap::new(),
            stats: FanoutStats::default(),
        }
    }

    /// Drop `listener_id` from the subscriber's mapping for `key`
    fn forget(&mut self, subscriber: SubscriberId, key: &K, listener_id: u64) {
        let Some(keys) = self.subscribers.get_mut(&subscriber) else {
            return;
        };
        if let Some(ids) = keys.get_mut(key) {
            ids.retain(|id| *id != listener_id);
            if ids.is_empty() {
                keys.remove(key);
            }
        }
    }

    /// Settle every listener of an entry with the shared outcome
    fn settle_listeners(&mut self, key: &K, entry: KeyListeners<V>, outcome: Outcome<V>) {
        let count = entry.listeners.len();
        for listener in entry.listeners {
            self.forget(listener.subscriber, key, listener.id);
            let _ = listener.tx.send(outcome.clone());
            self.stats.total_settled += 1;
        }
        debug!(?key, request_id = entry.request.id(), listeners = count, ok = outcome.is_ok(), "Fanout::settle_listeners: dispatched");
    }
}

/// Multiplexes one scheduler's requests across many subscribers
///
/// Each subscriber gets its own cancellable [`Subscription`] per request while
/// the underlying action runs at most once per key. A request nobody wants
/// anymore is dropped before it starts; once started it runs to completion
/// and its result goes to whoever is still listening.
pub struct Fanout<K, V> {
    scheduler: Scheduler<K, V>,
    inner: Arc<Mutex<FanoutInner<K, V>>>,
}

impl<K, V> Clone for Fanout<K, V> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Fanout<K, V>
where
    K: RequestKey,
    V: Clone + Send + Sync + 'static,
{
    /// Create a fanout over a fresh scheduler
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        debug!(?config, "Fanout::new: called");
        Ok(Self {
            scheduler: Scheduler::new(config)?,
            inner: Arc::new(Mutex::new(FanoutInner::new())),
        })
    }

    /// Register a new consumer
    pub async fn add_subscriber(&self) -> SubscriberId {
        let mut inner = self.inner.lock().await;
        let subscriber = SubscriberId::new(inner.next_subscriber);
        inner.next_subscriber += 1;
        inner.subscribers.insert(subscriber, HashMap::new());
        debug!(%subscriber, "Fanout::add_subscriber: registered");
        subscriber
    }

    /// Request `key` on behalf of `subscriber`
    ///
    /// Fails with [`FetchError::UnknownSubscriber`] if the subscriber was never
    /// registered or has been removed.
    pub async fn add_request<A: Action<V>>(
        &self,
        key: K,
        subscriber: SubscriberId,
        action: A,
        options: RequestOptions,
    ) -> Result<Subscription<V>, FetchError> {
        debug!(?key, %subscriber, ?options, "Fanout::add_request: called");
        let mut inner = self.inner.lock().await;
        if !inner.subscribers.contains_key(&subscriber) {
            warn!(?key, %subscriber, "Request from unknown subscriber");
            return Err(FetchError::UnknownSubscriber(subscriber));
        }

        let request = self.scheduler.add_request(key.clone(), action, options).await;
        match inner.listeners.get(&key).map(|entry| entry.request.id()) {
            Some(bound) if bound == request.id() => {
                inner.stats.total_coalesced += 1;
                debug!(?key, request_id = bound, "Fanout::add_request: joining bound request");
            }
            Some(stale) => {
                // Settled in the scheduler, continuation not yet run
                debug!(?key, stale, request_id = request.id(), "Fanout::add_request: flushing stale listeners");
                if let Some(entry) = inner.listeners.remove(&key) {
                    let outcome = entry.request.outcome().unwrap_or(Err(FetchError::Dropped));
                    inner.settle_listeners(&key, entry, outcome);
                }
                self.bind(&mut inner, key.clone(), request);
            }
            None => self.bind(&mut inner, key.clone(), request),
        }

        let listener_id = inner.next_listener;
        inner.next_listener += 1;
        let (tx, rx) = oneshot::channel();

        if let Some(entry) = inner.listeners.get_mut(&key) {
            entry.listeners.push(Listener {
                id: listener_id,
                subscriber,
                tx,
            });
        }
        if let Some(keys) = inner.subscribers.get_mut(&subscriber) {
            keys.entry(key.clone()).or_default().push(listener_id);
        }
        inner.stats.total_subscriptions += 1;

        debug!(?key, %subscriber, listener_id, "Fanout::add_request: listener attached");
        Ok(Subscription::new(listener_id, subscriber, rx))
    }

    /// Withdraw every listener `subscriber` has on `key`
    ///
    /// Returns false if the subscriber had no listeners on the key.
    pub async fn cancel_request(&self, key: &K, subscriber: SubscriberId, reason: &str) -> bool {
        debug!(?key, %subscriber, %reason, "Fanout::cancel_request: called");
        let mut inner = self.inner.lock().await;

        let listener_ids = inner
            .subscribers
            .get_mut(&subscriber)
            .and_then(|keys| keys.remove(key))
            .unwrap_or_default();
        if listener_ids.is_empty() {
            debug!(?key, %subscriber, "Fanout::cancel_request: nothing to cancel");
            return false;
        }

        for listener_id in listener_ids {
            self.reject_subscription(&mut inner, key, listener_id, reason).await;
        }
        true
    }

    /// Tear down `subscriber`, cancelling exactly its own listeners
    ///
    /// Returns the number of listeners cancelled.
    pub async fn remove_subscriber(&self, subscriber: SubscriberId, reason: &str) -> usize {
        debug!(%subscriber, %reason, "Fanout::remove_subscriber: called");
        let mut inner = self.inner.lock().await;

        let Some(keys) = inner.subscribers.remove(&subscriber) else {
            warn!(%subscriber, "Removing unknown subscriber");
            return 0;
        };

        let mut cancelled = 0;
        for (key, listener_ids) in keys {
            for listener_id in listener_ids {
                if self.reject_subscription(&mut inner, &key, listener_id, reason).await {
                    cancelled += 1;
                }
            }
        }

        info!(%subscriber, cancelled, "Subscriber removed");
        cancelled
    }

    /// Check if a scheduler request exists for `key`
    pub async fn has_request(&self, key: &K) -> bool {
        self.scheduler.has_request(key).await
    }

    /// Check if the action for `key` is executing
    pub async fn request_running(&self, key: &K) -> bool {
        self.scheduler.request_running(key).await
    }

    /// Check if `subscriber` is registered
    pub async fn has_subscriber(&self, subscriber: SubscriberId) -> bool {
        self.inner.lock().await.subscribers.contains_key(&subscriber)
    }

    /// Check if `subscriber` has an outstanding listener on `key`
    pub async fn is_subscribed(&self, subscriber: SubscriberId, key: &K) -> bool {
        let inner = self.inner.lock().await;
        inner
            .subscribers
            .get(&subscriber)
            .and_then(|keys| keys.get(key))
            .is_some_and(|ids| !ids.is_empty())
    }

    /// Number of listeners currently waiting on `key`
    pub async fn listener_count(&self, key: &K) -> usize {
        let inner = self.inner.lock().await;
        inner.listeners.get(key).map_or(0, |entry| entry.listeners.len())
    }

    /// Get the fanout statistics
    pub async fn stats(&self) -> FanoutStats {
        let inner = self.inner.lock().await;
        FanoutStats {
            live_subscribers: inner.subscribers.len(),
            live_keys: inner.listeners.len(),
            ..inner.stats.clone()
        }
    }

    /// Get the underlying scheduler's queue state
    pub async fn queue_state(&self) -> QueueState {
        self.scheduler.queue_state().await
    }

    /// Start a listener list for `key` and attach its settlement continuation
    fn bind(&self, inner: &mut FanoutInner<K, V>, key: K, request: RequestHandle<V>) {
        let request_id = request.id();
        inner.listeners.insert(
            key.clone(),
            KeyListeners {
                request: request.clone(),
                listeners: Vec::new(),
            },
        );
        debug!(?key, request_id, "Fanout::bind: listening for settlement");

        let fanout = self.clone();
        tokio::spawn(async move {
            let outcome = request.await;
            fanout.settle_all(key, request_id, outcome).await;
        });
    }

    /// Route one settlement to every listener of `key`
    ///
    /// Runs once per underlying request; a continuation whose request is no
    /// longer bound to the key does nothing.
    async fn settle_all(&self, key: K, request_id: u64, outcome: Outcome<V>) {
        let mut inner = self.inner.lock().await;
        let bound = inner
            .listeners
            .get(&key)
            .is_some_and(|entry| entry.request.id() == request_id);
        if !bound {
            debug!(?key, request_id, "Fanout::settle_all: request no longer bound");
            return;
        }
        if let Some(entry) = inner.listeners.remove(&key) {
            inner.settle_listeners(&key, entry, outcome);
        }
    }

    /// Cancel one listener; release the request if it was the last one
    ///
    /// The scheduler request is only cancelled if it has not started. A
    /// running request keeps its (now empty) list until it settles.
    async fn reject_subscription(
        &self,
        inner: &mut FanoutInner<K, V>,
        key: &K,
        listener_id: u64,
        reason: &str,
    ) -> bool {
        let Some(entry) = inner.listeners.get_mut(key) else {
            debug!(?key, listener_id, "Fanout::reject_subscription: key already settled");
            return false;
        };
        let Some(position) = entry.listeners.iter().position(|listener| listener.id == listener_id) else {
            debug!(?key, listener_id, "Fanout::reject_subscription: listener already settled");
            return false;
        };

        let listener = entry.listeners.remove(position);
        let _ = listener.tx.send(Err(FetchError::cancelled(reason)));
        let remaining = entry.listeners.len();
        let request_id = entry.request.id();
        inner.stats.total_cancelled += 1;
        debug!(?key, listener_id, remaining, "Fanout::reject_subscription: listener cancelled");

        if remaining == 0 {
            if self.scheduler.cancel_if_pending(key, request_id, reason).await {
                inner.listeners.remove(key);
                inner.stats.total_abandoned += 1;
                debug!(?key, request_id, "Fanout::reject_subscription: last listener gone, request dropped");
            } else {
                debug!(?key, request_id, "Fanout::reject_subscription: request in flight, letting it finish");
            }
        }
        true
    }
}
