//! Single-fire result channels.
//!
//! Every queued request hands the caller a [`PendingResult`] as soon as it
//! has been accepted; the matching [`ResultSink`] is owned by whatever
//! part of the session will eventually complete the request.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::{Error, Result};

/// The caller's end of a single-fire result.
///
/// Resolves to [`Error::SessionClosed`] if the session is dropped before
/// the request completes.
#[derive(Debug)]
pub struct PendingResult<T> {
    rx: oneshot::Receiver<Result<T>>,
}

#[derive(Debug)]
pub(crate) struct ResultSink<T> {
    tx: oneshot::Sender<Result<T>>,
}

pub(crate) fn pending<T>() -> (ResultSink<T>, PendingResult<T>) {
    let (tx, rx) = oneshot::channel();
    (ResultSink { tx }, PendingResult { rx })
}

impl<T> PendingResult<T> {
    /// A result that's already known, such as a request rejected before
    /// it reached the queue.
    pub(crate) fn ready(result: Result<T>) -> Self {
        let (sink, pending) = pending();
        sink.resolve(result);
        pending
    }
}

impl<T> ResultSink<T> {
    /// Consumes the sink. It's fine if the caller has stopped listening.
    pub(crate) fn resolve(self, result: Result<T>) {
        let _ = self.tx.send(result);
    }
}

impl<T> Future for PendingResult<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::SessionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[tokio::test]
async fn dropped_sink_reports_session_closed() {
    let (sink, pending) = pending::<u32>();
    drop(sink);
    assert!(matches!(pending.await, Err(Error::SessionClosed)));

    let ready = PendingResult::ready(Ok(7u32));
    assert_eq!(ready.await.unwrap(), 7);
}
