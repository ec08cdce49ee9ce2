//! Settle-once futures shared between the pool, the query manager and the scheduler
//!
//! A [`Deferred`] is the producing half and a [`Promise`] the consuming half.
//! Settling consumes the deferred, so a result is delivered at most once.
//! Dropping the promise is how a caller cancels: the producer observes it
//! through [`Deferred::is_closed`] / [`Deferred::poll_closed`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Create a linked deferred/promise pair.
pub fn channel<T>() -> (Deferred<T>, Promise<T>) {
    let (tx, rx) = oneshot::channel();
    (Deferred { tx }, Promise { rx })
}

/// Producing half of a promise.
#[derive(Debug)]
pub struct Deferred<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Deferred<T> {
    /// Fulfil the promise. Gives the value back if the promise was dropped.
    pub fn resolve(self, value: T) -> std::result::Result<(), T> {
        match self.tx.send(Ok(value)) {
            Err(Ok(value)) => Err(value),
            _ => Ok(()),
        }
    }

    /// Reject the promise. Returns false if nobody is listening.
    pub fn reject(self, error: Error) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    /// Settle with a ready result. Returns false if nobody is listening.
    pub fn settle(self, result: Result<T>) -> bool {
        self.tx.send(result).is_ok()
    }

    /// Whether the promise side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the promise side is dropped, registering the waker.
    pub fn poll_closed(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.tx.poll_closed(cx)
    }
}

/// Consuming half: a future of `Result<T>`.
///
/// If the deferred is dropped without settling, the promise rejects with
/// [`Error::Cancelled`].
#[derive(Debug)]
pub struct Promise<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Promise<T> {
    /// An already fulfilled promise.
    pub fn resolved(value: T) -> Self {
        Self::settled(Ok(value))
    }

    /// An already rejected promise.
    pub fn rejected(error: Error) -> Self {
        Self::settled(Err(error))
    }

    fn settled(result: Result<T>) -> Self {
        let (deferred, promise) = channel();
        deferred.settle(result);
        promise
    }

    /// Take the result without waiting, if it is already there.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(abandoned())),
        }
    }
}

fn abandoned() -> Error {
    Error::Cancelled("promise abandoned before it was settled".into())
}

impl<T> Future for Promise<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(abandoned())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_and_await() {
        let (deferred, promise) = channel();
        assert!(deferred.resolve(5).is_ok());
        assert_eq!(promise.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_dropped_deferred_cancels() {
        let (deferred, promise) = channel::<u8>();
        drop(deferred);
        assert!(matches!(promise.await, Err(Error::Cancelled(_))));
    }

    #[test]
    fn test_dropped_promise_returns_value() {
        let (deferred, promise) = channel();
        drop(promise);
        assert!(deferred.is_closed());
        assert_eq!(deferred.resolve("lease"), Err("lease"));
    }

    #[test]
    fn test_try_take() {
        let (deferred, mut promise) = channel::<i32>();
        assert!(promise.try_take().is_none());
        assert!(deferred.reject(Error::Timeout("slow".into())));
        assert!(matches!(promise.try_take(), Some(Err(Error::Timeout(_)))));
        assert_eq!(Promise::resolved(1).try_take(), Some(Ok(1)));
    }
}
