//! Future returned by `ServiceProxy::async_unary_invoke`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tailrpc_core::{ErrorKind, Payload, RequestContext, Status};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of an async call: the context travels back with the result.
pub type AsyncOutcome = (RequestContext, Result<Payload, Status>);

/// Handle to a unary call running on its own task.
///
/// Cancelling, or dropping the handle before it resolves, stops the call at
/// its next stage boundary and aborts any transport operation in flight.
/// The call still runs its post hooks, so the task is not aborted outright.
#[derive(Debug)]
pub struct ResponseFuture {
    handle: JoinHandle<AsyncOutcome>,
    cancel: CancellationToken,
}

impl ResponseFuture {
    pub(crate) fn spawn<F>(fut: F, cancel: CancellationToken) -> Self
    where
        F: Future<Output = AsyncOutcome> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(fut),
            cancel,
        }
    }

    /// Requests cancellation; the future still resolves, with a
    /// `Cancelled` status unless the call had already finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for ResponseFuture {
    type Output = AsyncOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Poll::Ready(Err(e)) => {
                let mut ctx = RequestContext::new();
                let status = Status::from_kind(ErrorKind::Cancelled, e.to_string());
                ctx.set_status(status.clone());
                Poll::Ready((ctx, Err(status)))
            }
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if !self.handle.is_finished() {
            self.cancel.cancel();
        }
    }
}
