//! Budget of one attempt.
//!
//! The proxy puts what is left of the call's timeout into `msg.timeout`.
//! An attempt with nothing left never reaches the transport; one that runs
//! past its budget is dropped and fails with the call's timeout kind, so a
//! full-link budget surfaces as `FullLinkTimeout`.

use std::task::{Context, Poll};
use std::time::Duration;

use tailrpc_core::{ErrorKind, Status};
use tower::{Layer, Service};

use super::{DispatchFuture, DispatchRequest, DispatchResponse};

#[derive(Debug, Clone, Copy, Default)]
pub struct DeadlineLayer;

impl<S> Layer<S> for DeadlineLayer {
    type Service = Deadline<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Deadline { inner }
    }
}

#[derive(Debug, Clone)]
pub struct Deadline<S> {
    inner: S,
}

fn expired(kind: ErrorKind, req: &DispatchRequest, budget: Duration) -> Status {
    Status::from_kind(
        kind,
        format!(
            "request {} to {} exceeded its {}ms budget",
            req.msg.request_id,
            req.msg.endpoint,
            budget.as_millis()
        ),
    )
}

impl<S> Service<DispatchRequest> for Deadline<S>
where
    S: Service<DispatchRequest, Response = DispatchResponse, Error = Status, Future = DispatchFuture>,
{
    type Response = DispatchResponse;
    type Error = Status;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: DispatchRequest) -> Self::Future {
        let budget = req.msg.timeout;
        let kind = req.timeout_kind;
        if budget.is_zero() {
            let status = expired(kind, &req, budget);
            return Box::pin(async move { Err(status) });
        }

        let on_expiry = expired(kind, &req, budget);
        let fut = self.inner.call(req);
        Box::pin(async move {
            tokio::time::timeout(budget, fut)
                .await
                .unwrap_or(Err(on_expiry))
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tower::ServiceExt;

    use super::*;
    use crate::dispatch::test_support::{request, ENDPOINT};
    use crate::dispatch::{DispatchMode, TransportService};
    use crate::testing::{MockTransport, Script};

    #[tokio::test(start_paused = true)]
    async fn reply_within_budget_passes_through() {
        let transport = MockTransport::new();
        transport.script(ENDPOINT, Script::reply(10, Bytes::from_static(b"ok")));
        let svc = DeadlineLayer.layer(TransportService::new(transport));

        let resp = svc.oneshot(request(DispatchMode::SendRecv, 100)).await.unwrap();
        assert_eq!(resp, DispatchResponse::Reply(Bytes::from_static(b"ok")));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_reports_the_call_timeout_kind() {
        let transport = MockTransport::new();
        transport.script(ENDPOINT, Script::echo(200));
        let svc = DeadlineLayer.layer(TransportService::new(transport.clone()));

        let err = svc
            .clone()
            .oneshot(request(DispatchMode::SendRecv, 50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Timeout));
        assert!(err.message().contains("exceeded its 50ms budget"));

        let mut full_link = request(DispatchMode::SendRecvAsync, 50);
        full_link.timeout_kind = ErrorKind::FullLinkTimeout;
        let err = svc.oneshot(full_link).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::FullLinkTimeout));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.in_progress(), 0);
        assert_eq!(transport.completed(), 0);
    }

    #[tokio::test]
    async fn spent_budget_never_reaches_the_transport() {
        let transport = MockTransport::new();
        let svc = DeadlineLayer.layer(TransportService::new(transport.clone()));

        let err = svc.oneshot(request(DispatchMode::SendOnly, 0)).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Timeout));
        assert_eq!(transport.send_only_calls(), 0);
    }
}
