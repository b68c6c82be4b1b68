//! Subscription - one subscriber's handle on one key

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::oneshot;

use crate::domain::SubscriberId;
use crate::error::FetchError;
use crate::scheduler::Outcome;

/// Result handle for one listener
///
/// Settles exactly once: with the shared action's outcome, or with a
/// cancellation when this subscriber's interest is withdrawn.
#[derive(Debug)]
pub struct Subscription<V> {
    listener_id: u64,
    subscriber: SubscriberId,
    rx: oneshot::Receiver<Outcome<V>>,
}

impl<V> Subscription<V> {
    pub(crate) fn new(listener_id: u64, subscriber: SubscriberId, rx: oneshot::Receiver<Outcome<V>>) -> Self {
        Self {
            listener_id,
            subscriber,
            rx,
        }
    }

    pub fn listener_id(&self) -> u64 {
        self.listener_id
    }

    pub fn subscriber(&self) -> SubscriberId {
        self.subscriber
    }
}

impl<V> Future for Subscription<V> {
    type Output = Outcome<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(FetchError::Dropped)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Statistics for the fanout
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct FanoutStats {
    /// Listeners created
    pub total_subscriptions: u64,

    /// Listeners that joined a request already bound for their key
    pub total_coalesced: u64,

    /// Listeners settled with a cancellation
    pub total_cancelled: u64,

    /// Listeners settled with the shared outcome
    pub total_settled: u64,

    /// Underlying requests dropped because nobody wanted them anymore
    pub total_abandoned: u64,

    /// Registered subscribers right now
    pub live_subscribers: usize,

    /// Keys with a listener list right now
    pub live_keys: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_resolves() {
        let (tx, rx) = oneshot::channel();
        let sub: Subscription<u8> = Subscription::new(1, SubscriberId::new(2), rx);
        assert_eq!(sub.listener_id(), 1);
        assert_eq!(sub.subscriber(), SubscriberId::new(2));

        tx.send(Ok(5)).unwrap();
        assert_eq!(sub.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_subscription_sender_dropped() {
        let (tx, rx) = oneshot::channel::<Outcome<u8>>();
        let sub = Subscription::new(1, SubscriberId::new(1), rx);
        drop(tx);

        assert!(matches!(sub.await, Err(FetchError::Dropped)));
    }
}
