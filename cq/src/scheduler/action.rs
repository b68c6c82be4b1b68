//! Caller-supplied units of work

use std::future::Future;

use futures::future::BoxFuture;

/// Future returned by a running action
pub type ActionFuture<V> = BoxFuture<'static, eyre::Result<V>>;

/// A zero-argument asynchronous operation that yields a value or fails
///
/// The scheduler invokes an action at most once per admission. Any
/// `FnOnce() -> impl Future<Output = eyre::Result<V>>` closure is an action;
/// fetchers that carry their own state can implement the trait directly.
pub trait Action<V>: Send + 'static {
    /// Consume the action and start it
    fn run(self: Box<Self>) -> ActionFuture<V>;
}

impl<V, F, Fut> Action<V> for F
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = eyre::Result<V>> + Send + 'static,
{
    fn run(self: Box<Self>) -> ActionFuture<V> {
        Box::pin((*self)())
    }
}

/// Type-erased action as stored on a request record
pub type BoxAction<V> = Box<dyn Action<V>>;
