//! Per-attempt outcome reporting.
//!
//! Each attempt that runs to an outcome is reported to the proxy's selector
//! with its endpoint, framework code and cost. That includes both legs of a
//! backup race, so a loser's failure still counts against its endpoint. The
//! same outcome feeds the `tailrpc_client_dispatch_duration_seconds`
//! histogram and a `dispatch` span.
//!
//! Cancelled attempts say nothing about the endpoint and are not reported.

use std::sync::Arc;
use std::task::{Context, Poll};

use tailrpc_core::{ErrorKind, InvokeResult, Selector, Status};
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::Instrument;

use super::{DispatchFuture, DispatchRequest, DispatchResponse};

#[derive(Clone)]
pub struct ReportLayer {
    selector: Arc<dyn Selector>,
}

impl ReportLayer {
    #[must_use]
    pub fn new(selector: Arc<dyn Selector>) -> Self {
        Self { selector }
    }
}

impl std::fmt::Debug for ReportLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportLayer")
            .field("selector", &self.selector.name())
            .finish()
    }
}

impl<S> Layer<S> for ReportLayer {
    type Service = Report<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Report {
            inner,
            selector: Arc::clone(&self.selector),
        }
    }
}

#[derive(Clone)]
pub struct Report<S> {
    inner: S,
    selector: Arc<dyn Selector>,
}

/// Metric label for an attempt outcome.
fn outcome_label(result: &Result<DispatchResponse, Status>) -> &'static str {
    let Err(status) = result else { return "ok" };
    match status.kind() {
        Some(ErrorKind::Timeout | ErrorKind::FullLinkTimeout) => "timeout",
        Some(ErrorKind::ConnectError) => "connect",
        Some(ErrorKind::NetworkError) => "network",
        Some(ErrorKind::Cancelled) => "cancelled",
        _ => "error",
    }
}

impl<S> Service<DispatchRequest> for Report<S>
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
        let span = tracing::debug_span!(
            "dispatch",
            service = %req.service,
            request_id = req.msg.request_id,
            endpoint = %req.msg.endpoint,
            mode = req.mode.as_str(),
        );
        let selector = Arc::clone(&self.selector);
        let service = Arc::clone(&req.service);
        let endpoint = req.msg.endpoint.clone();
        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let started = Instant::now();
                let result = fut.await;
                let cost = started.elapsed();
                let outcome = outcome_label(&result);

                metrics::histogram!(
                    "tailrpc_client_dispatch_duration_seconds",
                    "service" => service.to_string(),
                    "outcome" => outcome,
                )
                .record(cost.as_secs_f64());
                tracing::debug!(cost_us = cost.as_micros(), outcome, "dispatch finished");

                if outcome != "cancelled" {
                    selector.report(&InvokeResult {
                        service: service.to_string(),
                        endpoint,
                        framework_code: result.as_ref().map_or_else(Status::framework_code, |_| 0),
                        cost,
                    });
                }
                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tailrpc_core::TransportError;
    use tower::ServiceExt;

    use super::*;
    use crate::dispatch::test_support::{request, ENDPOINT};
    use crate::dispatch::{DispatchMode, TransportService};
    use crate::selector::{EndpointStats, StaticSelector};
    use crate::testing::{MockTransport, Script};

    fn reporting(transport: &Arc<MockTransport>) -> (Report<TransportService>, Arc<StaticSelector>) {
        let selector = Arc::new(StaticSelector::new());
        let svc = ReportLayer::new(selector.clone()).layer(TransportService::new(transport.clone()));
        (svc, selector)
    }

    #[tokio::test(start_paused = true)]
    async fn outcomes_are_reported_against_the_endpoint() {
        let transport = MockTransport::new();
        transport.script(ENDPOINT, Script::echo(30));
        let (svc, selector) = reporting(&transport);

        svc.clone()
            .oneshot(request(DispatchMode::SendRecv, 1_000))
            .await
            .unwrap();
        transport.script(ENDPOINT, Script::fail(0, TransportError::Network("reset".into())));
        svc.oneshot(request(DispatchMode::SendRecv, 1_000))
            .await
            .unwrap_err();

        let stats = selector.endpoint_stats(ENDPOINT);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert!(stats.total_cost_us >= 30_000);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_attempts_are_not_held_against_the_endpoint() {
        let transport = MockTransport::new();
        transport.script(ENDPOINT, Script::fail(5, TransportError::Cancelled));
        let (svc, selector) = reporting(&transport);

        let err = svc
            .clone()
            .oneshot(request(DispatchMode::SendRecv, 1_000))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Cancelled));

        transport.script(ENDPOINT, Script::echo(10_000));
        let dropped = svc.oneshot(request(DispatchMode::SendRecvAsync, 20_000));
        assert!(tokio::time::timeout(Duration::from_millis(5), dropped).await.is_err());

        assert_eq!(selector.endpoint_stats(ENDPOINT), EndpointStats::default());
    }
}
