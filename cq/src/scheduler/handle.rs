//! RequestHandle - the single outstanding result of one scheduled key

use std::fmt;
use std::future::IntoFuture;

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::error::FetchError;

/// Result every handle eventually settles with
pub type Outcome<V> = Result<V, FetchError>;

/// Shared, cloneable view of a request's eventual outcome
///
/// Every `add_request` call for the same key returns a clone of the same
/// handle, so all callers observe the same settlement. Await it directly or
/// peek with [`RequestHandle::outcome`].
pub struct RequestHandle<V> {
    id: u64,
    rx: watch::Receiver<Option<Outcome<V>>>,
}

/// Write side of a request handle, owned by the request record
pub(crate) struct Settler<V> {
    tx: watch::Sender<Option<Outcome<V>>>,
}

/// Create a linked settler/handle pair for request `id`
pub(crate) fn request_channel<V>(id: u64) -> (Settler<V>, RequestHandle<V>) {
    let (tx, rx) = watch::channel(None);
    (Settler { tx }, RequestHandle { id, rx })
}

impl<V> Settler<V> {
    /// Publish the outcome; later settles are ignored
    pub(crate) fn settle(&self, outcome: Outcome<V>) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }
}

impl<V> RequestHandle<V> {
    /// Id of the underlying request record
    ///
    /// A key that is cancelled or settled and then requested again gets a
    /// new record with a new id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check if the request has settled
    pub fn is_settled(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

impl<V: Clone> RequestHandle<V> {
    /// Peek at the outcome without waiting
    pub fn outcome(&self) -> Option<Outcome<V>> {
        self.rx.borrow().clone()
    }
}

impl<V> Clone for RequestHandle<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            rx: self.rx.clone(),
        }
    }
}

impl<V> fmt::Debug for RequestHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<V> IntoFuture for RequestHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    type Output = Outcome<V>;
    type IntoFuture = BoxFuture<'static, Outcome<V>>;

    fn into_future(self) -> Self::IntoFuture {
        let mut rx = self.rx;
        Box::pin(async move {
            let outcome = match rx.wait_for(Option::is_some).await {
                Ok(slot) => (*slot).clone(),
                Err(_) => None,
            };
            outcome.unwrap_or(Err(FetchError::Dropped))
        })
    }
}
