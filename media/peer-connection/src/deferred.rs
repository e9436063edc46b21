use crate::Error;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::oneshot;

/// Result of an asynchronous [`PeerConnection`](crate::PeerConnection) operation.
///
/// Resolved exactly once from inside the step loop. Can be awaited or polled with [`Deferred::try_result`] when
/// driving the peer connection manually.
#[must_use = "the result of the operation is only available through the Deferred"]
pub struct Deferred<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
}

/// The resolving end of a [`Deferred`]
pub(crate) struct Completer<T> {
    tx: oneshot::Sender<Result<T, Error>>,
}

pub(crate) fn deferred<T>() -> (Completer<T>, Deferred<T>) {
    let (tx, rx) = oneshot::channel();

    (Completer { tx }, Deferred { rx })
}

impl<T> Completer<T> {
    pub(crate) fn complete(self, result: Result<T, Error>) {
        if self.tx.send(result).is_err() {
            log::trace!("deferred result was dropped before completion");
        }
    }
}

impl<T> Deferred<T> {
    /// Returns the result if it's available
    pub fn try_result(&mut self) -> Option<Result<T, Error>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            // Completer dropped without resolving, only happens when the peer connection is gone
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Shutdown)),
        }
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(Error::Shutdown)))
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").finish_non_exhaustive()
    }
}
